use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifiers here are assigned outside this process (by the remote service or
/// the host runtime), so they wrap opaque strings instead of locally minted UUIDs.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

// Remote-assigned, stable across retransmission
define_id!(CommandId);

// Player account identifier on the host runtime
define_id!(PlayerId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = CommandId::new("c1");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"c1\"");

        let back: CommandId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn blank_detection_ignores_whitespace() {
        assert!(PlayerId::new("   ").is_blank());
        assert!(!PlayerId::new("alice").is_blank());
    }
}
