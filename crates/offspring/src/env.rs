//! Owned snapshot of the child's environment.
//!
//! The table is seeded from the parent's environment when the builder is
//! created and rendered into an owned `envp` before launch; the process
//! globals are never consulted again after that point, so concurrent
//! `setenv` calls elsewhere in the program cannot tear the child's view.

use std::collections::BTreeMap;
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvTable {
  vars: BTreeMap<OsString, OsString>,
}

impl EnvTable {
  /// Snapshot of the current process environment.
  pub fn inherited() -> Self {
    Self {
      vars: std::env::vars_os().collect(),
    }
  }

  pub fn empty() -> Self {
    Self {
      vars: BTreeMap::new(),
    }
  }

  pub fn set<K: Into<OsString>, V: Into<OsString>>(&mut self, key: K, value: V) {
    self.vars.insert(key.into(), value.into());
  }

  pub fn remove<K: AsRef<OsStr>>(&mut self, key: K) {
    self.vars.remove(key.as_ref());
  }

  pub fn clear(&mut self) {
    self.vars.clear();
  }

  pub fn get<K: AsRef<OsStr>>(&self, key: K) -> Option<&OsStr> {
    self.vars.get(key.as_ref()).map(OsString::as_os_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&OsStr, &OsStr)> {
    self
      .vars
      .iter()
      .map(|(k, v)| (k.as_os_str(), v.as_os_str()))
  }

  pub fn len(&self) -> usize {
    self.vars.len()
  }

  pub fn is_empty(&self) -> bool {
    self.vars.is_empty()
  }

  /// Renders the table into `KEY=VALUE` strings for exec's `envp`.
  pub(crate) fn to_envp(&self) -> Result<Vec<CString>> {
    self
      .vars
      .iter()
      .map(|(key, value)| {
        let mut entry = Vec::with_capacity(key.len() + value.len() + 1);
        entry.extend_from_slice(key.as_bytes());
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        CString::new(entry)
          .map_err(|_| Error::invalid("environment entry contains a NUL byte"))
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn overrides_apply_on_top_of_the_snapshot() {
    let mut env = EnvTable::empty();
    env.set("A", "1");
    env.set("B", "2");
    env.set("A", "3");
    env.remove("B");
    assert_eq!(env.get("A"), Some(OsStr::new("3")));
    assert_eq!(env.get("B"), None);
    assert_eq!(env.len(), 1);
  }

  #[test]
  fn inherited_sees_the_parent_environment() {
    // PATH is as close to universally present as it gets.
    let env = EnvTable::inherited();
    assert_eq!(env.get("PATH"), std::env::var_os("PATH").as_deref());
  }

  #[test]
  fn envp_renders_key_value_pairs() {
    let mut env = EnvTable::empty();
    env.set("KEY", "value");
    env.set("EMPTY", "");
    let envp = env.to_envp().unwrap();
    let rendered: Vec<&str> = envp.iter().map(|c| c.to_str().unwrap()).collect();
    assert_eq!(rendered, ["EMPTY=", "KEY=value"]);
  }

  #[test]
  fn nul_bytes_are_rejected() {
    let mut env = EnvTable::empty();
    env.set("BAD", OsString::from("a\0b"));
    assert!(matches!(env.to_envp(), Err(Error::Invalid { .. })));
  }
}
