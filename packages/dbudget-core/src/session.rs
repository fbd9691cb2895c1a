//! # Session Context
//!
//! The signed-in user's credential plus a generation counter. The counter
//! goes up on every sign-in and sign-out; async work records the value it
//! started under and discards its result if the value has moved on.

use serde::Deserialize;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::network::protocol::MAX_DEVICE_NAME_LEN;

/// What the user typed on the sign-in screen
#[derive(Clone, Deserialize)]
pub struct Credential {
    /// Account name; devices with the same username find each other
    pub username: String,
    /// Name shown to other devices
    pub device_name: String,
    /// Shared sync password. Wiped on drop.
    #[serde(deserialize_with = "deserialize_password")]
    pub password: Zeroizing<String>,
    /// Relay URL, e.g. `wss://relay.example.com/ws`
    pub server: String,
}

fn deserialize_password<'de, D>(deserializer: D) -> std::result::Result<Zeroizing<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    String::deserialize(deserializer).map(Zeroizing::new)
}

impl Credential {
    /// Build a credential
    pub fn new(
        username: impl Into<String>,
        device_name: impl Into<String>,
        password: impl Into<String>,
        server: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            device_name: device_name.into(),
            password: Zeroizing::new(password.into()),
            server: server.into(),
        }
    }

    /// Reject empty fields
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(Error::InvalidConfig("username must not be empty".into()));
        }
        if self.device_name.trim().is_empty() {
            return Err(Error::InvalidConfig("device name must not be empty".into()));
        }
        // peers drop every frame whose sender name is longer
        if self.device_name.len() > MAX_DEVICE_NAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "device name must be at most {} bytes",
                MAX_DEVICE_NAME_LEN
            )));
        }
        if self.password.is_empty() {
            return Err(Error::InvalidConfig("password must not be empty".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("device_name", &self.device_name)
            .field("password", &"<redacted>")
            .field("server", &self.server)
            .finish()
    }
}

/// Current session state held by the sync loop
#[derive(Debug, Default)]
pub struct SessionContext {
    credential: Option<Credential>,
    generation: u64,
}

impl SessionContext {
    /// Signed-out context
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session. Returns the new generation.
    pub fn sign_in(&mut self, credential: Credential) -> u64 {
        self.credential = Some(credential);
        self.generation += 1;
        self.generation
    }

    /// End the session. Returns the new generation.
    pub fn sign_out(&mut self) -> u64 {
        self.credential = None;
        self.generation += 1;
        self.generation
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `generation` still describes a live session
    pub fn is_current(&self, generation: u64) -> bool {
        self.credential.is_some() && self.generation == generation
    }

    /// The credential, if signed in
    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    /// The credential, or `NotSignedIn`
    pub fn require(&self) -> Result<&Credential> {
        self.credential.as_ref().ok_or(Error::NotSignedIn)
    }
}
