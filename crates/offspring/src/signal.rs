use nix::sys::signal::Signal;

/// The signal [`crate::Child::destroy`] sends to a still-running child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestroySignal {
  /// SIGTERM: ask the child to shut down.
  #[default]
  Term,
  /// SIGKILL: no questions asked.
  Kill,
}

impl DestroySignal {
  pub fn signal(self) -> Signal {
    match self {
      Self::Term => Signal::SIGTERM,
      Self::Kill => Signal::SIGKILL,
    }
  }

  /// The raw signal number, which is also the exit code a signal-terminated
  /// child reports.
  pub fn code(self) -> i32 {
    self.signal() as i32
  }
}

impl From<DestroySignal> for Signal {
  fn from(value: DestroySignal) -> Self {
    value.signal()
  }
}
