//! Error types for miner sessions, the wire codec and address resolution.
//!
//! Every failure a target can hit is a variant of [`MinerError`]. The
//! [`ErrorKind`] tag exposes the same classification as plain data so callers
//! (and the batch orchestrator) can branch exhaustively without matching on
//! payloads.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::address::Address;

/// Errors raised while talking to miners or resolving their addresses.
#[derive(Error, Debug)]
pub enum MinerError {
    /// A malformed address specification.
    ///
    /// Never retried; surfaced to the caller of the resolver.
    #[error("cannot parse address '{input}': {reason}")]
    AddressParsing { input: String, reason: String },

    /// The socket to the miner could not be established or broke mid-exchange.
    #[error("<{address}>: connection error, {reason}")]
    Connection { address: Address, reason: String },

    /// The reply is not a JSON document.
    #[error("<{address}>: malformed message, {reason}")]
    MessageMalformed { address: Address, reason: String },

    /// The reply parsed but lacks the required envelope or payload structure.
    #[error("<{address}>: invalid message, {reason}")]
    MessageInvalid { address: Address, reason: String },

    /// The reply envelope reports that the device rejected the request.
    ///
    /// Carries the device's own status code and message text.
    #[error("<{address}>: device replied {status} (code {code}): {msg}")]
    MessageReply {
        address: Address,
        status: String,
        code: i64,
        msg: String,
    },

    /// The device explicitly rejected a command sent by a session.
    #[error("<{address}>: command '{command}' failed (code {code}): {msg}")]
    CommandFailed {
        address: Address,
        command: String,
        code: i64,
        msg: String,
    },

    /// The per-call deadline elapsed.
    #[error("<{address}>: command timeout after {elapsed_ms}ms")]
    CommandTimeout { address: Address, elapsed_ms: u128 },

    /// Session lifecycle misuse: double logon, a privileged command without
    /// logon, or the device refusing a new session because one is active.
    #[error("<{address}>: session already active, {reason}")]
    SessionAlreadyActive { address: Address, reason: String },

    /// Local file access failed (address lists).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A recorded session does not contain the requested exchange.
    #[error("replay mismatch: {0}")]
    ReplayMismatch(String),

    /// Internal failure unrelated to a specific device.
    #[error("internal error: {0}")]
    InternalServerError(String),
}

/// Closed set of error classifications carried as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AddressParsing,
    Connection,
    MessageMalformed,
    MessageInvalid,
    MessageReply,
    CommandFailed,
    CommandTimeout,
    SessionAlreadyActive,
    Io,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind may be attempted again by the orchestrator.
    pub fn is_retryable(self) -> bool {
        !matches!(
            self,
            ErrorKind::AddressParsing | ErrorKind::SessionAlreadyActive
        )
    }

    /// Whether this kind is a deadline expiry.
    pub fn is_timeout(self) -> bool {
        self == ErrorKind::CommandTimeout
    }
}

impl MinerError {
    /// Returns the classification tag of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MinerError::AddressParsing { .. } => ErrorKind::AddressParsing,
            MinerError::Connection { .. } => ErrorKind::Connection,
            MinerError::MessageMalformed { .. } => ErrorKind::MessageMalformed,
            MinerError::MessageInvalid { .. } => ErrorKind::MessageInvalid,
            MinerError::MessageReply { .. } => ErrorKind::MessageReply,
            MinerError::CommandFailed { .. } => ErrorKind::CommandFailed,
            MinerError::CommandTimeout { .. } => ErrorKind::CommandTimeout,
            MinerError::SessionAlreadyActive { .. } => ErrorKind::SessionAlreadyActive,
            MinerError::Io(_) => ErrorKind::Io,
            MinerError::ReplayMismatch(_) | MinerError::InternalServerError(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// The target this error belongs to, if any.
    pub fn address(&self) -> Option<&Address> {
        match self {
            MinerError::Connection { address, .. }
            | MinerError::MessageMalformed { address, .. }
            | MinerError::MessageInvalid { address, .. }
            | MinerError::MessageReply { address, .. }
            | MinerError::CommandFailed { address, .. }
            | MinerError::CommandTimeout { address, .. }
            | MinerError::SessionAlreadyActive { address, .. } => Some(address),
            MinerError::AddressParsing { .. }
            | MinerError::Io(_)
            | MinerError::ReplayMismatch(_)
            | MinerError::InternalServerError(_) => None,
        }
    }

    pub(crate) fn address_parsing(input: &str, reason: impl Into<String>) -> Self {
        MinerError::AddressParsing {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}
