//! Protocol constants and tunable execution options.
//!
//! The constants mirror what LuxOS firmware expects on its API port. The
//! option structs carry the per-call and per-batch knobs; external tooling
//! may deserialize them from any serde format.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default LuxOS API port.
pub const DEFAULT_PORT: u16 = 4028;

/// Default deadline for a single operation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of retries after the first failed attempt.
pub const DEFAULT_RETRIES: u32 = 0;

/// Default wait between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Default number of targets in flight.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Replies longer than this are rejected as malformed.
pub const MAX_REPLY_BYTES: usize = 4 * 1024 * 1024;

/// Separator used to join command parameters on the wire.
pub const PARAMETER_SEPARATOR: char = ',';

/// Byte the firmware may use to terminate a reply.
pub const REPLY_TERMINATOR: u8 = 0x00;

/// Read chunk size used while collecting a reply.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Options for a single remote execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ExecOptions {
    /// Deadline for each exchange (connect + send + receive), in seconds.
    #[serde(with = "duration_secs")]
    #[schemars(with = "f64")]
    pub timeout: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ExecOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Options for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LaunchOptions {
    /// Maximum number of targets in flight; `0` means unlimited.
    pub batch_size: usize,
    /// Extra attempts after the first failed one. Timeouts consume attempts.
    pub retries: u32,
    /// Wait between attempts, in seconds.
    #[serde(with = "duration_secs")]
    #[schemars(with = "f64")]
    pub retry_delay: Duration,
    /// Deadline for each attempt, in seconds.
    #[serde(with = "duration_secs")]
    #[schemars(with = "f64")]
    pub timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retries: DEFAULT_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl LaunchOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Total attempts a target may consume.
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Upper bound on the wall time spent on one target.
    pub fn worst_case_latency(&self) -> Duration {
        self.timeout * self.max_attempts() + self.retry_delay * self.retries
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
