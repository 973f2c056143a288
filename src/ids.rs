//! Typed identifiers for stand documents.
//!
//! Entry and request ids are generated here; agent and client ids come from
//! the external auth collaborator and are carried as opaque strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
  ($(#[$attr:meta])* $vis:vis struct $name:ident;) => {
    $(#[$attr])*
    #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
    #[serde(transparent)]
    $vis struct $name(pub Uuid);

    impl $name {
      pub fn new() -> Self {
        Self(Uuid::new_v4())
      }
    }

    impl Default for $name {
      fn default() -> Self {
        Self::new()
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
      }
    }

    impl From<Uuid> for $name {
      fn from(id: Uuid) -> Self {
        Self(id)
      }
    }
  };
}

macro_rules! opaque_id {
  ($(#[$attr:meta])* $vis:vis struct $name:ident;) => {
    $(#[$attr])*
    #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
    #[serde(transparent)]
    $vis struct $name(pub String);

    impl $name {
      pub fn as_str(&self) -> &str {
        &self.0
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
      }
    }

    impl From<&str> for $name {
      fn from(id: &str) -> Self {
        Self(id.to_owned())
      }
    }

    impl From<String> for $name {
      fn from(id: String) -> Self {
        Self(id)
      }
    }
  };
}

uuid_id! {
  /// Handle of a queue entry at the stand.
  pub struct EntryId;
}

uuid_id! {
  /// Handle of a delivery request.
  pub struct RequestId;
}

opaque_id! {
  /// A delivery agent, as identified by the auth collaborator.
  pub struct AgentId;
}

opaque_id! {
  pub struct ClientId;
}
