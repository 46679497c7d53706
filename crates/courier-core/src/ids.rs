//! Branded ID newtypes.
//!
//! Connections, subscriptions, frames and RPC calls each get a distinct ID
//! type wrapping a `String`, so a subscription ID can never be handed to an
//! API expecting a connection ID.
//!
//! Generated IDs are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a new UUID v7 string (time-ordered).
fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new random ID (UUID v7, time-ordered).
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of one accepted (server) or established (client) transport connection.
    ConnectionId
}

branded_id! {
    /// Identifier of a destination subscription, unique per connection.
    SubscriptionId
}

branded_id! {
    /// Identifier stamped on every outbound MESSAGE frame (`message-id` header).
    MessageId
}

branded_id! {
    /// Correlation token generated for client-initiated RPC calls.
    CorrelationId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_ids_are_unique() {
        let ids: HashSet<ConnectionId> = (0..100).map(|_| ConnectionId::new()).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn new_ids_are_uuid_v7() {
        let id = MessageId::new();
        let parsed = Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version_num(), 7);
    }

    #[test]
    fn from_str_and_display() {
        let id = SubscriptionId::from("sub-1");
        assert_eq!(id.to_string(), "sub-1");
        assert_eq!(&*id, "sub-1");
        assert_eq!(String::from(id), "sub-1");
    }

    #[test]
    fn serde_is_transparent() {
        let id = ConnectionId::from_string("conn-9".into());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"conn-9\"");
        let back: ConnectionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn into_inner_returns_string() {
        let id = MessageId::from("m");
        assert_eq!(id.into_inner(), "m");
    }
}
