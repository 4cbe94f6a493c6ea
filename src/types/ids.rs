//! Strongly-typed identifiers.
//!
//! Catalog records are keyed by integer identity; invocations get a UUID so
//! their log lines can be correlated.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// `integer` generates a `u64` key (catalog records): `new()`, `get()`,
/// `From<u64>`, Display. `uuid` generates a random string key: `new()`,
/// `as_str()`, `Default`, Display.
macro_rules! define_id {
    ($name:ident, integer) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
    ($name:ident, uuid) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(ToolId, integer);
define_id!(DependencyId, integer);
define_id!(GroupId, integer);
define_id!(CallLogId, integer);
define_id!(InvocationId, uuid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_id_serializes_transparently() {
        let id = ToolId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let back: ToolId = serde_json::from_str("42").unwrap();
        assert_eq!(back, id);
        assert_eq!(back.to_string(), "42");
    }

    #[test]
    fn test_invocation_ids_are_unique() {
        assert_ne!(InvocationId::new(), InvocationId::new());
    }
}
