use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id! {
    /// Remote conversation identifier (direct or group).
    ConversationId
}

string_id! {
    /// Account identifier as assigned by the remote service.
    UserId
}

string_id! {
    /// Message identifier. Either server-assigned or a locally generated
    /// temporary id that is promoted in place once the server acknowledges it.
    MessageId
}

impl MessageId {
    /// Generate a fresh temporary id for an outgoing draft.
    pub fn new_local() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}
