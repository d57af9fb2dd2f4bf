//! Identifier newtypes.
//!
//! Envelope, execution, group and scope identifiers are UUIDs. Their byte form
//! is used verbatim in storage keys, so `as_bytes` is part of the on-disk
//! contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::TypesError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new(id: Uuid) -> Self {
                Self(id)
            }

            /// Fresh random identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_bytes(bytes: [u8; 16]) -> Self {
                Self(Uuid::from_bytes(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = TypesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| TypesError::InvalidId(format!("{s}: {e}")))
            }
        }
    };
}

uuid_id!(
    /// Primary key of one envelope row (one party's copy of an execution).
    EnvelopeId
);
uuid_id!(
    /// One logical contract execution.
    ExecutionId
);
uuid_id!(
    /// Multi-party negotiation group; also names the record group written to the scope.
    GroupId
);
uuid_id!(
    /// On-chain addressable record an execution reads and writes.
    ScopeId
);

/// Identity of a party: the hex-encoded public signing key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartyKey(String);

impl PartyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().to_ascii_lowercase())
    }

    pub fn from_public_key(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PartyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.0.get(..12).unwrap_or(&self.0);
        write!(f, "PartyKey({short}..)")
    }
}

impl fmt::Display for PartyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
