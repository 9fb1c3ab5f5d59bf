//! Strongly-typed identifiers.
//!
//! All IDs are validated at construction time and implement common traits.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `from_string()`, `as_str()`, Display, Serialize,
/// Deserialize. Optionally generates `new()` (UUID v4) and `Default` if the
/// `uuid` flag is passed.
macro_rules! define_id {
    ($name:ident, uuid) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
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
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(SilenceId, uuid);
define_id!(GroupKey);

impl GroupKey {
    /// Test/dispatcher helper, panics on empty input.
    pub fn must(s: &str) -> Self {
        #[allow(clippy::expect_used)]
        Self::from_string(s.to_string()).expect("non-empty group key")
    }
}

impl SilenceId {
    /// Test helper, panics on empty input.
    pub fn must(s: &str) -> Self {
        #[allow(clippy::expect_used)]
        Self::from_string(s.to_string()).expect("non-empty silence id")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_id_generates_unique_uuids() {
        assert_ne!(SilenceId::new(), SilenceId::new());
    }

    #[test]
    fn group_key_rejects_empty() {
        assert!(GroupKey::from_string(String::new()).is_err());
        assert!(GroupKey::from_string("{}/{job=\"x\"}".to_string()).is_ok());
    }
}
