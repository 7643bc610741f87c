use serde::{Deserialize, Deserializer, Serialize};

/// Platform user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// A served community (guild / group chat).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ServerId(pub i64);

/// A channel inside a server. On platforms without channels this equals the server id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RoleId(pub i64);

/// Platform message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

/// A stable reference to a posted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Stored rows written by older deployments carry ids as decimal strings.
macro_rules! lenient_id {
    ($($ty:ident),* $(,)?) => {
        $(
            impl<'de> Deserialize<'de> for $ty {
                fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                    #[derive(Deserialize)]
                    #[serde(untagged)]
                    enum Raw {
                        Num(i64),
                        Text(String),
                    }

                    match Raw::deserialize(d)? {
                        Raw::Num(n) => Ok($ty(n)),
                        Raw::Text(s) => s
                            .trim()
                            .parse::<i64>()
                            .map($ty)
                            .map_err(serde::de::Error::custom),
                    }
                }
            }
        )*
    };
}

lenient_id!(UserId, ServerId, ChannelId, RoleId, MessageId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_accept_numbers_and_numeric_strings() {
        let ids: Vec<UserId> = serde_json::from_str(r#"[1, "22", " 333 "]"#).unwrap();
        assert_eq!(ids, vec![UserId(1), UserId(22), UserId(333)]);
        assert!(serde_json::from_str::<UserId>(r#""abc""#).is_err());
        assert_eq!(serde_json::to_string(&ServerId(5)).unwrap(), "5");
    }
}
