//! # Command Server
//!
//! Publishes the actuator command produced by each control cycle.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use comms_if::{
    msg::ActuatorCmd,
    net::{MonitoredSocket, MonitoredSocketError, SocketOptions, zmq}
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Actuator command publisher
pub struct CmdServer {
    socket: MonitoredSocket,
    topic: String
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CmdServerError {
    #[error("Socket error: {0}")]
    SocketError(MonitoredSocketError),

    #[error("Could not send the command: {0}")]
    SendError(MonitoredSocketError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl CmdServer {
    /// Create a new instance of the command server, bound to `endpoint`.
    ///
    /// This function will not block until a subscriber connects.
    pub fn new(ctx: &zmq::Context, endpoint: &str, topic: &str) -> Result<Self, CmdServerError> {
        let socket = MonitoredSocket::new(
            ctx,
            zmq::PUB,
            SocketOptions::publisher(),
            endpoint
        ).map_err(CmdServerError::SocketError)?;

        Ok(Self {
            socket,
            topic: topic.to_string()
        })
    }

    /// Publish a command.
    pub fn send(&self, cmd: &ActuatorCmd) -> Result<(), CmdServerError> {
        self.socket.publish(&self.topic, cmd)
            .map_err(CmdServerError::SendError)
    }
}
