use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ModelError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub Uuid);

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn to_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim()).map(Self).map_err(|_| {
                    ModelError::InvalidId {
                        kind: $kind,
                        value: s.to_string(),
                    }
                })
            }
        }
    };
}

uuid_id!(
    /// Unique identifier of a flow. Doubles as the session id on every
    /// request the flow sends to its agent.
    FlowId,
    "flow"
);

uuid_id!(
    /// Unique identifier of a hunt.
    HuntId,
    "hunt"
);

uuid_id!(
    /// Identifier handed out with every flow lease.
    LeaseId,
    "lease"
);

const CLIENT_PREFIX: &str = "C.";
const CLIENT_HEX_LEN: usize = 16;

/// Remote agent identifier, `C.` followed by 16 lowercase hex digits.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ClientId(String);

impl ClientId {
    pub fn parse(value: &str) -> Result<Self, ModelError> {
        let invalid = || ModelError::InvalidId {
            kind: "client",
            value: value.to_string(),
        };
        let hex = value.strip_prefix(CLIENT_PREFIX).ok_or_else(invalid)?;
        if hex.len() != CLIENT_HEX_LEN
            || !hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(invalid());
        }
        Ok(Self(value.to_string()))
    }

    /// Builds the id for a numeric client index, e.g. `C.1000000000000003`.
    pub fn from_index(index: u64) -> Self {
        Self(format!(
            "{CLIENT_PREFIX}{:016x}",
            0x1000_0000_0000_0000u64 + index
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ClientId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ClientId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ClientId> for String {
    fn from(value: ClientId) -> Self {
        value.0
    }
}

/// Per-flow request id. Ids start at 1 and increase monotonically.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct RequestId(pub u64);

impl RequestId {
    pub const FIRST: RequestId = RequestId(1);

    pub fn next(self) -> RequestId {
        RequestId(self.0 + 1)
    }

    /// Zero-padded form used in store keys so lexical order is numeric order.
    pub fn to_key(self) -> String {
        format!("{:020}", self.0)
    }

    pub fn from_key(key: &str) -> Option<RequestId> {
        key.parse().ok().map(RequestId)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_accepts_canonical_form() {
        let id = ClientId::parse("C.1000000000000003").expect("valid id");
        assert_eq!(id.as_str(), "C.1000000000000003");
        assert_eq!(ClientId::from_index(3), id);
    }

    #[test]
    fn client_id_rejects_markup_and_bad_lengths() {
        for bad in ["C.123456<script>", "C.123", "X.1000000000000000", ""] {
            assert!(ClientId::parse(bad).is_err(), "{bad} should be rejected");
        }
        assert!(ClientId::parse("C.100000000000000A").is_err());
    }

    #[test]
    fn client_id_deserialization_validates() {
        let ok: ClientId =
            serde_json::from_str("\"C.1000000000000001\"").expect("valid");
        assert_eq!(ok, ClientId::from_index(1));
        assert!(serde_json::from_str::<ClientId>("\"nope\"").is_err());
    }

    #[test]
    fn flow_id_parse_rejects_garbage() {
        assert!("X:<script>".parse::<FlowId>().is_err());
        let id = FlowId::new();
        assert_eq!(id.to_string().parse::<FlowId>().expect("round trip"), id);
    }

    #[test]
    fn request_key_sorts_numerically() {
        let a = RequestId(2).to_key();
        let b = RequestId(10).to_key();
        assert!(a < b);
        assert_eq!(RequestId::from_key(&b), Some(RequestId(10)));
    }
}
