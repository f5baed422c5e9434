//! Source identifiers.
//!
//! A source is one upstream data feed (e.g. `ceden-chemistry`). Every
//! piece of per-source state (cache, lock, scheduler row, disk artifact) is
//! namespaced by its [`SourceId`].

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lowercase ASCII letters, digits and `-`; used verbatim in file names,
/// URL paths and database keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
  pub fn new(id: impl Into<String>) -> Result<Self, Error> {
    let id = id.into();
    let valid = !id.is_empty()
      && id.len() <= 64
      && id
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if valid { Ok(Self(id)) } else { Err(Error::InvalidSourceId(id)) }
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SourceId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl FromStr for SourceId {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> { Self::new(s) }
}

impl TryFrom<String> for SourceId {
  type Error = Error;

  fn try_from(s: String) -> Result<Self, Self::Error> { Self::new(s) }
}

impl From<SourceId> for String {
  fn from(id: SourceId) -> Self { id.0 }
}
