use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::{ResultExt, ensure};

use super::error::{EmptySessionIdSnafu, InvalidIdSnafu, ProtocolError, ProtocolResult};

/// Integer ids arrive as JSON numbers from the persistence layer, but some
/// endpoints echo them back as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum LooseInteger {
    Number(i64),
    Text(String),
}

// Every integer id the server assigns shares one shape, so they stay interchangeable on the wire
// while remaining distinct types in the engine.
macro_rules! define_wire_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub i64);

        impl $name {
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            pub fn parse(raw: &str) -> ProtocolResult<Self> {
                let parsed = raw.trim().parse::<i64>().context(InvalidIdSnafu {
                    stage: "parse-wire-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub const fn get(&self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(raw: &str) -> ProtocolResult<Self> {
                Self::parse(raw)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_i64(self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                match LooseInteger::deserialize(deserializer)? {
                    LooseInteger::Number(raw) => Ok(Self(raw)),
                    LooseInteger::Text(raw) => Self::parse(&raw).map_err(serde::de::Error::custom),
                }
            }
        }
    };
}

define_wire_id!(ConversationId, "conversation-id");
define_wire_id!(RecordId, "record-id");

/// Server-minted session identifier.
///
/// The live one is scoped to a single connection handshake; historical ones name the session a
/// persisted conversation was created under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(raw: impl Into<String>) -> ProtocolResult<Self> {
        let raw = raw.into().trim().to_string();
        ensure!(
            !raw.is_empty(),
            EmptySessionIdSnafu {
                stage: "parse-session-id"
            }
        );
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = ProtocolError;

    fn from_str(raw: &str) -> ProtocolResult<Self> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_ids_accept_numbers_and_numeric_strings() {
        let from_number: ConversationId = serde_json::from_str("7").unwrap();
        let from_text: ConversationId = serde_json::from_str("\" 7 \"").unwrap();

        assert_eq!(from_number, ConversationId::new(7));
        assert_eq!(from_text, ConversationId::new(7));
        assert_eq!(serde_json::to_string(&RecordId::new(42)).unwrap(), "42");
    }

    #[test]
    fn integer_ids_reject_garbage() {
        assert!(serde_json::from_str::<RecordId>("\"forty-two\"").is_err());
        assert!(matches!(
            RecordId::parse("x"),
            Err(ProtocolError::InvalidId {
                id_type: "record-id",
                ..
            })
        ));
    }

    #[test]
    fn session_ids_are_trimmed_and_never_empty() {
        assert_eq!(SessionId::parse("  S1 ").unwrap().as_str(), "S1");
        assert!(SessionId::parse("   ").is_err());
    }
}
