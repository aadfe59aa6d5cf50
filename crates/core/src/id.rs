//! Strongly-typed identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of a worker process (node).
///
/// Node ids become part of store keys (`inprogress:<queue>:<node>`), so they
/// must be non-empty and must not contain the `:` key separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

/// Name of a queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

macro_rules! impl_key_segment {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Validate and wrap a raw identifier.
            pub fn new(value: impl Into<String>) -> Result<Self, CoreError> {
                let value = value.into();
                if value.is_empty() {
                    return Err(CoreError::invalid_id(concat!($name, ": must not be empty")));
                }
                if value.contains(':') || value.chars().any(char::is_whitespace) {
                    return Err(CoreError::invalid_id(format!(
                        "{}: {:?} contains ':' or whitespace",
                        $name, value
                    )));
                }
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $t {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_key_segment!(NodeId, "NodeId");
impl_key_segment!(QueueName, "QueueName");

impl NodeId {
    /// Generate a fresh node id.
    ///
    /// Uses UUIDv7 (time-ordered) in simple form, so ids sort by start time.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }
}
