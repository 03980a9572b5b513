use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Rejection for an id value that does not carry the expected brand prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdParseError {
    pub expected: &'static str,
    pub value: String,
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected a {}-prefixed id, got {:?}", self.expected, self.value)
    }
}

impl std::error::Error for IdParseError {}

/// String-backed id newtype with a brand prefix (`sess_…`, `user_…`, …).
///
/// Minting goes through `new` (uuid v7, so ids sort by creation order).
/// Values read back from the store are wrapped with `from_raw`; anything
/// arriving over the wire goes through `parse`, which enforces the prefix.
macro_rules! branded_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7()))
            }

            /// Wrap an already-trusted value (rows read back from the store).
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Validate untrusted input: the brand prefix must be present and
            /// followed by a non-empty remainder.
            pub fn parse(s: &str) -> Result<Self, IdParseError> {
                match s.strip_prefix(concat!($prefix, "_")) {
                    Some(rest) if !rest.is_empty() => Ok(Self(s.to_owned())),
                    _ => Err(IdParseError {
                        expected: $prefix,
                        value: s.to_owned(),
                    }),
                }
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
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(UserId, "user");
branded_id!(ConfigId, "cfg");
/// One worker incarnation. A session that crashes and recovers has seen
/// several of these; logs keyed by worker id tell the incarnations apart.
branded_id!(WorkerId, "wrk");
