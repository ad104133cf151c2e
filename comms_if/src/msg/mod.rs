//! # Messages
//!
//! All messages are sent as a single ZMQ frame of the form `<topic> <json payload>`. Topics are
//! namespaced by the vehicle identity, for example `drone0/self_localization/state`, so that a
//! subscriber can filter on the topic prefix.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

pub mod cmd;
pub mod reference;
pub mod state;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{de::DeserializeOwned, Serialize};

pub use cmd::*;
pub use reference::*;
pub use state::*;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Topic on which state estimates are received
pub const STATE_TOPIC: &str = "self_localization/state";

/// Topic on which trajectory references are received
pub const REF_TOPIC: &str = "motion_reference";

/// Topic on which actuator commands are published
pub const CMD_TOPIC: &str = "actuator_command";

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    #[error("Message did not contain a topic separator")]
    NoTopic,

    #[error("Expected topic {expected:?} but found {found:?}")]
    WrongTopic { expected: String, found: String },

    #[error("Could not serialize the message: {0}")]
    SerializationError(serde_json::Error),

    #[error("Could not deserialize the message: {0}")]
    DeserializeError(serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Build the full topic name for `name` within `namespace`.
pub fn topic(namespace: &str, name: &str) -> String {
    let namespace = namespace.trim_matches('/');

    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Encode a message for sending on the given topic.
pub fn encode<T: Serialize>(topic: &str, msg: &T) -> Result<String, MsgError> {
    let payload = serde_json::to_string(msg).map_err(MsgError::SerializationError)?;

    Ok(format!("{} {}", topic, payload))
}

/// Decode a message received on the given topic.
pub fn decode<T: DeserializeOwned>(topic: &str, frame: &str) -> Result<T, MsgError> {
    let (found, payload) = match frame.find(' ') {
        Some(i) => (&frame[..i], &frame[i + 1..]),
        None => return Err(MsgError::NoTopic),
    };

    if found != topic {
        return Err(MsgError::WrongTopic {
            expected: topic.to_string(),
            found: found.to_string(),
        });
    }

    serde_json::from_str(payload).map_err(MsgError::DeserializeError)
}
