//! Miner sessions and command execution.
//!
//! This module provides the per-device connection used by every remote
//! operation: connecting, one-shot request/reply exchanges, the LuxOS
//! logon/logoff handshake, and scoped helpers that guarantee the socket (and
//! any session id) is released on every exit path.
//!
//! # Main Components
//!
//! - [`Session`] - A logical connection to one miner
//! - [`with_session`] - Scoped acquisition around an async closure
//! - [`rexec`] / [`roundtrip`] - One-call helpers on top of `Session`
//! - [`SessionRecorder`] - Injectable sink for structured exchange events

use log::{debug, trace};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::address::Address;
use crate::catalog;
use crate::config::ExecOptions;
use crate::error::{ErrorKind, MinerError};
use crate::wire::{self, Command, Reply};

pub use manager::{rexec, roundtrip, with_session};
pub use recording::{
    NormalizeOptions, SessionEvent, SessionRecordEntry, SessionRecordLevel, SessionRecorder,
    SessionReplayer,
};

/// A logical connection to one miner.
///
/// The firmware serves one request per TCP connection. The socket opened by
/// [`Session::open`] carries the first exchange; later exchanges reconnect.
/// Dropping a `Session` closes any socket it still holds.
pub struct Session {
    address: Address,
    stream: Option<TcpStream>,

    /// Token returned by `logon`, prepended to privileged commands
    sid: Option<String>,

    /// Deadline applied to exchanges that do not pass their own
    timeout: Duration,

    /// Optional recorder bound to this session.
    recorder: Option<SessionRecorder>,
}

mod client;
mod manager;
mod recording;
