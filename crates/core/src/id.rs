// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Identifier types for the gateway.
//!
//! Client and request ids are minted by the gateway as lowercase hex;
//! session and prompt ids are assigned by the engine and carried opaquely.

use uuid::Uuid;

/// Hard upper bound the engine's image output node places on a request id
/// (ASCII bytes). Minted request ids stay well under this.
pub const MAX_REQUEST_ID_LEN: usize = 32;

/// Length of a minted request id in hex characters.
const REQUEST_ID_LEN: usize = 24;

/// Define a newtype ID wrapper around `String`.
///
/// Generates `from_string()`, `as_str()`, `into_string()`, `Display`,
/// `From<&str>`, `From<String>`, `AsRef<str>`, `Borrow<str>`, `Deref`,
/// and `PartialEq<str>` implementations.
#[macro_export]
macro_rules! define_str_id {
    (
        $(#[$meta:meta])*
        pub struct $name:ident;
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create ID from an existing string (parsing/deserialization)
            pub fn from_string(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::from_string(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_str_id! {
    /// Gateway-assigned client connection id, 32 hex chars.
    pub struct ClientId;
}

define_str_id! {
    /// Backend-assigned session id for a paired engine WebSocket.
    ///
    /// Also minted gateway-side for the status listener's own channel.
    pub struct SessionId;
}

define_str_id! {
    /// Gateway-assigned id for a workflow submission, echoed back to the
    /// client with every status event and embedded in output frames.
    pub struct RequestId;
}

define_str_id! {
    /// Engine-assigned id for a submitted workflow.
    pub struct PromptId;
}

impl ClientId {
    /// Mint a fresh 32-hex-char client id.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl SessionId {
    /// Mint a fresh 32-hex-char session id (status listener only; proxied
    /// session ids come from the engine handshake).
    pub fn mint() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl RequestId {
    /// Mint a fresh 24-hex-char request id.
    pub fn mint() -> Self {
        let hex = Uuid::new_v4().simple().to_string();
        Self(hex[..REQUEST_ID_LEN].to_string())
    }

    /// Whether this id fits the engine's output node limit.
    pub fn fits_engine_limit(&self) -> bool {
        self.0.is_ascii() && self.0.len() <= MAX_REQUEST_ID_LEN
    }
}

#[cfg(test)]
#[path = "id_tests.rs"]
mod tests;
