//! # UI Events
//!
//! Everything the sync core tells the host application. Events are
//! delivered in order over the channel returned by
//! [`SyncService::start`](crate::sync::SyncService::start).

use serde::{Deserialize, Serialize};

use crate::ledger::Ledger;

/// Event for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    /// Short user-facing notice
    Toast {
        /// Text to show
        message: String,
    },
    /// Stored ledger decrypted with the entered password
    SignInSuccess {
        /// The local ledger (empty for a new user)
        ledger: Ledger,
    },
    /// A trusted peer sent ledger records
    ReceivedTransactions {
        /// Records from the peer
        ledger: Ledger,
        /// Relay session id of the sender
        from_socket_id: String,
    },
    /// A peer proved it holds the password
    GotHelloBack {
        /// Relay session id of the now trusted peer
        socket_id: String,
    },
    /// The entered password does not open the stored ledger
    WrongPassword,
    /// A peer confirmed it backed up our records
    SyncComplete {
        /// Text to show
        message: String,
    },
}

impl AppEvent {
    /// Build a toast
    pub fn toast(message: impl Into<String>) -> Self {
        AppEvent::Toast {
            message: message.into(),
        }
    }

    /// Event type name
    pub fn event_type(&self) -> &'static str {
        match self {
            AppEvent::Toast { .. } => "toast",
            AppEvent::SignInSuccess { .. } => "sign_in_success",
            AppEvent::ReceivedTransactions { .. } => "received_transactions",
            AppEvent::GotHelloBack { .. } => "got_hello_back",
            AppEvent::WrongPassword => "wrong_password",
            AppEvent::SyncComplete { .. } => "sync_complete",
        }
    }
}

// ============================================================================
// USER-FACING TEXT
// ============================================================================

/// Toast after a peer's `hello` failed to decrypt
pub const MSG_PASSWORD_MISMATCH: &str =
    "Make sure you use the same password with all of your devices";

/// Toast after a forged `helloBack`
pub const MSG_TRUST_VIOLATION: &str = "Somebody is hacking you!";

/// Toast after a successful save
pub const MSG_SAVED: &str = "Saved";

/// Toast when saving without a session
pub const MSG_SIGNED_OUT: &str = "Can't save to database. You are signed out";

/// Toast when the relay sends something unparseable
pub const MSG_BAD_RELAY_DATA: &str = "Server sent invalid data";

/// Toast when the relay cannot be reached
pub const MSG_RELAY_UNREACHABLE: &str = "Can't connect to the sync server";

/// Toast when a peer's records could not be decrypted or parsed
pub const MSG_UNREADABLE_TRANSACTIONS: &str = "Received transactions could not be read";

/// Toast when the stored ledger exists but cannot be read
pub const MSG_CORRUPTED_LEDGER: &str = "Your saved transactions are damaged and could not be loaded";

/// Summary after pushing records to every trusted peer
pub fn sync_summary(peers: usize) -> String {
    match peers {
        0 => "No other devices online to sync with".to_string(),
        1 => "Sent transactions to 1 device".to_string(),
        n => format!("Sent transactions to {} devices", n),
    }
}

/// Toast when a peer finished sending to us
pub fn got_transactions_from(device_name: &str) -> String {
    format!("Got transactions from {}", device_name)
}

/// Sync-complete text when a peer backed up our records
pub fn backed_up_by(device_name: &str) -> String {
    format!("{} backed up transactions from us", device_name)
}

/// Toast when a connection was dropped because its transfer broke
pub fn connection_failed(device_name: &str) -> String {
    format!("Sync with {} failed, connection closed", device_name)
}

/// Toast when the store rejected a write
pub fn save_failed(reason: &str) -> String {
    format!("Can't save to database: {}", reason)
}

/// Toast when confirmations stopped arriving
pub fn sync_timed_out(device_name: &str) -> String {
    format!("Sync with {} timed out, try again", device_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_summary_phrasing() {
        assert_eq!(sync_summary(0), "No other devices online to sync with");
        assert_eq!(sync_summary(1), "Sent transactions to 1 device");
        assert_eq!(sync_summary(3), "Sent transactions to 3 devices");
    }

    #[test]
    fn test_event_serialization() {
        let event = AppEvent::GotHelloBack {
            socket_id: "s1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"got_hello_back","socket_id":"s1"}"#);

        let json = serde_json::to_string(&AppEvent::WrongPassword).unwrap();
        assert_eq!(json, r#"{"type":"wrong_password"}"#);
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(AppEvent::toast("hi").event_type(), "toast");
        assert_eq!(
            AppEvent::SignInSuccess { ledger: Ledger::new() }.event_type(),
            "sign_in_success"
        );
    }

    #[test]
    fn test_device_messages() {
        assert_eq!(got_transactions_from("phone"), "Got transactions from phone");
        assert_eq!(backed_up_by("phone"), "phone backed up transactions from us");
    }
}
