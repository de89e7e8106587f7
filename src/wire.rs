//! LuxOS API wire codec.
//!
//! A request is one JSON object `{"command": <name>, "parameter": <joined>}`
//! written to a fresh TCP connection. The reply is one JSON document,
//! optionally terminated by a NUL byte, after which the firmware closes the
//! connection. Replies carry a `STATUS` envelope plus command specific payload
//! keys (`VERSION`, `POOLS`, `SESSION`, ...).

use std::fmt;

use log::trace;
use schemars::JsonSchema;
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::address::Address;
use crate::config::{MAX_REPLY_BYTES, PARAMETER_SEPARATOR, READ_CHUNK_SIZE, REPLY_TERMINATOR};
use crate::error::MinerError;

/// A scalar command parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Parameter {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::Bool(v) => write!(f, "{v}"),
            Parameter::Int(v) => write!(f, "{v}"),
            Parameter::Float(v) => write!(f, "{v}"),
            Parameter::Str(v) => f.write_str(v),
            Parameter::Null => f.write_str("null"),
        }
    }
}

impl From<&str> for Parameter {
    fn from(value: &str) -> Self {
        Parameter::Str(value.to_string())
    }
}

impl From<String> for Parameter {
    fn from(value: String) -> Self {
        Parameter::Str(value)
    }
}

impl From<bool> for Parameter {
    fn from(value: bool) -> Self {
        Parameter::Bool(value)
    }
}

impl From<i64> for Parameter {
    fn from(value: i64) -> Self {
        Parameter::Int(value)
    }
}

impl From<i32> for Parameter {
    fn from(value: i32) -> Self {
        Parameter::Int(value.into())
    }
}

impl From<u32> for Parameter {
    fn from(value: u32) -> Self {
        Parameter::Int(value.into())
    }
}

impl From<f64> for Parameter {
    fn from(value: f64) -> Self {
        Parameter::Float(value)
    }
}

impl<T: Into<Parameter>> From<Option<T>> for Parameter {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Parameter::Null)
    }
}

/// A named command with ordered parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, parameter: impl Into<Parameter>) -> Self {
        self.parameters.push(parameter.into());
        self
    }

    pub fn with_parameters<I, P>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Parameter>,
    {
        self.parameters.extend(parameters.into_iter().map(Into::into));
        self
    }

    /// Appends `key=value` parameters in the given order.
    pub fn with_pairs<I, K, V>(mut self, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: fmt::Display,
        V: Into<Parameter>,
    {
        self.parameters.extend(
            pairs
                .into_iter()
                .map(|(key, value)| Parameter::Str(format!("{key}={}", value.into()))),
        );
        self
    }

    /// Inserts a parameter in front of the others (session ids go first).
    pub fn prepend(&mut self, parameter: impl Into<Parameter>) {
        self.parameters.insert(0, parameter.into());
    }

    /// Parameters joined the way the firmware expects them, or `None` when
    /// there are none.
    pub fn joined_parameters(&self) -> Option<String> {
        if self.parameters.is_empty() {
            return None;
        }
        let joined = self
            .parameters
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(&PARAMETER_SEPARATOR.to_string());
        Some(joined)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parameter: Option<String>,
}

/// Serializes a command into request bytes.
pub fn encode(command: &Command) -> Result<Vec<u8>, MinerError> {
    let request = Request {
        command: command.name.clone(),
        parameter: command.joined_parameters(),
    };
    serde_json::to_vec(&request)
        .map_err(|e| MinerError::InternalServerError(format!("request encode error: {e}")))
}

/// Parses request bytes back into a command; parameters come back as strings.
pub fn decode_request(bytes: &[u8]) -> Result<Command, MinerError> {
    let request: Request = serde_json::from_slice(trim_frame(bytes))
        .map_err(|e| MinerError::InternalServerError(format!("request decode error: {e}")))?;
    let parameters = match request.parameter {
        Some(joined) if !joined.is_empty() => joined
            .split(PARAMETER_SEPARATOR)
            .map(Parameter::from)
            .collect(),
        _ => Vec::new(),
    };
    Ok(Command {
        name: request.command,
        parameters,
    })
}

/// First entry of the reply `STATUS` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Status {
    #[serde(rename = "STATUS")]
    pub status: String,
    #[serde(rename = "Code", default)]
    pub code: i64,
    #[serde(rename = "Msg", default)]
    pub msg: String,
    #[serde(rename = "Description", default)]
    pub description: String,
}

impl Status {
    /// `S` (success) and `I` (informational) are accepted outcomes.
    pub fn is_success(&self) -> bool {
        matches!(self.status.as_str(), "S" | "I")
    }
}

/// A well-formed reply: the raw payload plus its decoded status.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    payload: Map<String, Value>,
    status: Status,
}

impl Reply {
    /// True when the device accepted the command.
    pub fn is_valid(&self) -> bool {
        self.status.is_success()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn into_payload(self) -> Map<String, Value> {
        self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Fails with [`MinerError::MessageReply`] unless the reply is valid.
    pub fn ensure_valid(self, address: &Address) -> Result<Reply, MinerError> {
        if self.is_valid() {
            return Ok(self);
        }
        Err(MinerError::MessageReply {
            address: address.clone(),
            status: self.status.status.clone(),
            code: self.status.code,
            msg: self.status.msg.clone(),
        })
    }
}

fn trim_frame(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != REPLY_TERMINATOR && !b.is_ascii_whitespace())
        .map(|idx| idx + 1)
        .unwrap_or(0);
    &bytes[..end]
}

/// Parses a reply, checking that it is JSON and carries the envelope.
///
/// A rejected status is not an error here; see [`Reply::is_valid`].
pub fn parse_reply(address: &Address, bytes: &[u8]) -> Result<Reply, MinerError> {
    let malformed = |reason: String| MinerError::MessageMalformed {
        address: address.clone(),
        reason,
    };
    let invalid = |reason: &str| MinerError::MessageInvalid {
        address: address.clone(),
        reason: reason.to_string(),
    };

    let text = std::str::from_utf8(trim_frame(bytes))
        .map_err(|e| malformed(format!("reply is not utf-8: {e}")))?;
    let value: Value = serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
    let Value::Object(payload) = value else {
        return Err(invalid("reply is not a JSON object"));
    };

    if !payload.contains_key("id") {
        return Err(invalid("missing id from message"));
    }
    let first = payload
        .get("STATUS")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
        .ok_or_else(|| invalid("missing STATUS from message"))?;
    let status: Status =
        serde_json::from_value(first.clone()).map_err(|_| invalid("unreadable STATUS entry"))?;

    Ok(Reply { payload, status })
}

/// Parses a reply and requires a successful status.
pub fn decode(address: &Address, bytes: &[u8]) -> Result<Reply, MinerError> {
    parse_reply(address, bytes)?.ensure_valid(address)
}

/// Extracts the payload list stored under `key` and checks its length.
///
/// Returns `None` when `key` is absent and no minimum is required (the
/// firmware omits empty lists such as `POOLS`). With bounds `(1, 1)` the
/// single item is returned instead of the list.
pub fn validate(
    address: &Address,
    reply: &Reply,
    key: &str,
    min: Option<usize>,
    max: Option<usize>,
) -> Result<Option<Value>, MinerError> {
    if let (Some(min), Some(max)) = (min, max)
        && min > max
    {
        return Err(MinerError::InternalServerError(format!(
            "invalid arguments: min={min} > max={max}"
        )));
    }
    let invalid = |reason: String| MinerError::MessageInvalid {
        address: address.clone(),
        reason,
    };

    let Some(values) = reply.get(key) else {
        if min.unwrap_or(0) == 0 {
            return Ok(None);
        }
        return Err(invalid(format!("missing {key} from message")));
    };
    let Some(items) = values.as_array() else {
        return Err(MinerError::MessageMalformed {
            address: address.clone(),
            reason: format!("message reply doesn't contain list in '{key}'"),
        });
    };

    let n = items.len();
    if let Some(min) = min
        && n < min
    {
        return Err(invalid(format!("found too few items for '{key}' ({n} < {min})")));
    }
    if let Some(max) = max
        && n > max
    {
        return Err(invalid(format!("found too many items for '{key}' ({n} > {max})")));
    }

    if (n, min, max) == (1, Some(1), Some(1)) {
        return Ok(items.first().cloned());
    }
    Ok(Some(values.clone()))
}

/// Accumulates reply bytes until a complete document is available.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk; returns the complete frame once the terminator or a
    /// full JSON document has been seen.
    pub fn push(&mut self, address: &Address, chunk: &[u8]) -> Result<Option<Vec<u8>>, MinerError> {
        if let Some(pos) = chunk.iter().position(|b| *b == REPLY_TERMINATOR) {
            self.buffer.extend_from_slice(&chunk[..pos]);
            return Ok(Some(std::mem::take(&mut self.buffer)));
        }
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_REPLY_BYTES {
            return Err(MinerError::MessageMalformed {
                address: address.clone(),
                reason: format!("reply exceeds {MAX_REPLY_BYTES} bytes"),
            });
        }

        // An object or array can only be complete on a closing bracket.
        let mut content = self.buffer.iter().filter(|b| !b.is_ascii_whitespace());
        let first = content.next().copied();
        let last = self.buffer.iter().rev().find(|b| !b.is_ascii_whitespace()).copied();
        match (first, last) {
            (None, _) => return Ok(None),
            (Some(b'{' | b'['), Some(b'}' | b']')) => {}
            (Some(b'{' | b'['), _) => return Ok(None),
            _ => {}
        }

        let mut documents = serde_json::Deserializer::from_slice(&self.buffer).into_iter::<IgnoredAny>();
        match documents.next() {
            Some(Ok(_)) => Ok(Some(std::mem::take(&mut self.buffer))),
            Some(Err(e)) if e.is_eof() => Ok(None),
            // Syntax errors cannot be repaired by more bytes.
            Some(Err(_)) => Ok(Some(std::mem::take(&mut self.buffer))),
            None => Ok(None),
        }
    }

    /// Returns whatever was buffered when the peer closed the connection.
    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }
}

/// Reads one reply frame from `reader`.
pub async fn read_frame<R>(address: &Address, reader: &mut R) -> Result<Vec<u8>, MinerError>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| MinerError::Connection {
                address: address.clone(),
                reason: format!("read failed: {e}"),
            })?;
        if n == 0 {
            let frame = decoder.finish();
            trace!("{} closed the connection after {} bytes", address, frame.len());
            return Ok(frame);
        }
        trace!("{} read {} bytes", address, n);
        if let Some(frame) = decoder.push(address, &chunk[..n])? {
            return Ok(frame);
        }
    }
}
