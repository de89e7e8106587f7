//! # rluxos - Async client for fleets of LuxOS miners
//!
//! `rluxos` talks to the JSON API that LuxOS firmware serves on TCP port 4028.
//! It provides a wire codec for the request/reply envelope, sessions with the
//! logon/logoff handshake privileged commands need, a resolver that expands
//! address expressions and lists into targets, and a batch orchestrator that
//! runs one operation over many miners with bounded concurrency, per-attempt
//! deadlines and retries.
//!
//! ## Features
//!
//! - **Wire Codec**: Request encoding, stream framing and reply validation
//! - **Sessions**: Scoped logon/logoff that is released on every exit path
//! - **Address Ranges**: `10.0.0.1-10.0.0.9:4028` style expressions and CSV lists
//! - **Batch Launch**: One result per target, never aborted by a failing miner
//! - **Recording**: JSONL capture of exchanges for offline replay in tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rluxos::address::iter_ip_ranges;
//! use rluxos::config::{ExecOptions, LaunchOptions, DEFAULT_PORT};
//! use rluxos::launch::Launcher;
//! use rluxos::session::rexec;
//! use rluxos::wire::Command;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = LaunchOptions::default().with_batch_size(50).with_retries(1);
//!     let report = Launcher::new(options)
//!         .run_resolved(iter_ip_ranges("10.0.0.1-10.0.0.20", DEFAULT_PORT), |address| async move {
//!             let reply = rexec(&address, Command::new("version"), &ExecOptions::default()).await?;
//!             Ok(reply.into_payload())
//!         })
//!         .await?;
//!
//!     for result in report.failures() {
//!         println!("{}: {:?}", result.address, result.failure());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`wire`] - Commands, replies and the byte-level codec
//! - [`session::Session`] - A logical connection to one miner
//! - [`address`] - Address parsing and range expansion
//! - [`launch::Launcher`] - Bounded-concurrency fan-out over many miners
//! - [`catalog`] - Known commands and whether they need a logon
//! - [`error::MinerError`] - Error types shared by every layer
//! - [`config`] - Protocol constants and tunable options

pub mod address;
pub mod catalog;
pub mod config;
pub mod error;
pub mod launch;
pub mod session;
pub mod wire;

pub use address::Address;
pub use error::{ErrorKind, MinerError};
pub use launch::{LaunchReport, LaunchResult, Launcher, Outcome, launch};
pub use wire::{Command, Reply};
