//! Branded ID newtypes.
//!
//! Rooms and users are named by the deployment (the private room has a fixed
//! key, participants have fixed handles), so their IDs are built from strings.
//! Messages and live sessions get generated UUID v7 IDs, which sort by
//! creation time.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Whether the ID is empty or whitespace only.
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
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

macro_rules! generated_id {
    ($name:ident, $prefix:literal) => {
        impl $name {
            /// Create a new time-ordered ID.
            #[must_use]
            pub fn new() -> Self {
                Self(format!(concat!($prefix, "{}"), Uuid::now_v7()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }
    };
}

branded_id! {
    /// Logical conversation channel key.
    RoomId
}

branded_id! {
    /// Authenticated participant handle.
    UserId
}

branded_id! {
    /// Globally unique message identifier.
    MessageId
}

branded_id! {
    /// Identifier of one live streaming session.
    SessionId
}

generated_id!(MessageId, "msg_");
generated_id!(SessionId, "sess_");
