use super::*;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

/// How much of an exchange a [`SessionRecorder`] keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum SessionRecordLevel {
    Off,
    /// Lifecycle and status only; reply payloads are replaced by `null`.
    KeyEventsOnly,
    #[default]
    Full,
}

/// One timestamped line of a recording.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionRecordEntry {
    /// Milliseconds since the Unix epoch.
    pub ts_ms: u128,
    pub event: SessionEvent,
}

/// Filters applied by [`SessionRecorder::normalize_jsonl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub keep_failures: bool,
    pub keep_session_events: bool,
    pub redact_session_ids: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            keep_failures: true,
            keep_session_events: true,
            redact_session_ids: true,
        }
    }
}

const REDACTED_SESSION_ID: &str = "<session-id>";

/// Something that happened on a session, in wire terms.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected {
        address: String,
    },
    CommandSent {
        command: String,
        /// Joined parameter string as it went on the wire.
        #[serde(default)]
        parameter: Option<String>,
    },
    ReplyReceived {
        command: String,
        valid: bool,
        #[serde(default)]
        reply: Value,
    },
    ExchangeFailed {
        command: String,
        error_kind: ErrorKind,
        reason: String,
    },
    LoggedOn {
        session_id: String,
    },
    LoggedOff {
        acknowledged: bool,
    },
    Closed {
        reason: String,
    },
}

impl SessionEvent {
    fn is_session_lifecycle(&self) -> bool {
        matches!(self, SessionEvent::LoggedOn { .. } | SessionEvent::LoggedOff { .. })
    }
}

/// Shared, cloneable sink for session events.
///
/// Clones append to the same buffer, so one recorder can be handed to many
/// sessions and read back afterwards.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    level: SessionRecordLevel,
    entries: Arc<Mutex<Vec<SessionRecordEntry>>>,
}

fn codec_error(what: &str, e: serde_json::Error) -> MinerError {
    MinerError::InternalServerError(format!("record {what} error: {e}"))
}

impl SessionRecorder {
    pub fn new(level: SessionRecordLevel) -> Self {
        Self::with_entries(level, Vec::new())
    }

    fn with_entries(level: SessionRecordLevel, entries: Vec<SessionRecordEntry>) -> Self {
        Self {
            level,
            entries: Arc::new(Mutex::new(entries)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<SessionRecordEntry>>, MinerError> {
        self.entries
            .lock()
            .map_err(|e| MinerError::InternalServerError(format!("record lock error: {e}")))
    }

    pub fn level(&self) -> SessionRecordLevel {
        self.level
    }

    /// Appends `event` unless the level filters it out.
    pub fn record_event(&self, event: SessionEvent) -> Result<(), MinerError> {
        let event = match (self.level, event) {
            (SessionRecordLevel::Off, _) => return Ok(()),
            (
                SessionRecordLevel::KeyEventsOnly,
                SessionEvent::ReplyReceived { command, valid, .. },
            ) => SessionEvent::ReplyReceived {
                command,
                valid,
                reply: Value::Null,
            },
            (_, event) => event,
        };
        let ts_ms = now_ms();
        self.lock()?.push(SessionRecordEntry { ts_ms, event });
        Ok(())
    }

    /// Copy of everything recorded so far.
    pub fn entries(&self) -> Result<Vec<SessionRecordEntry>, MinerError> {
        Ok(self.lock()?.clone())
    }

    pub fn clear(&self) -> Result<(), MinerError> {
        self.lock()?.clear();
        Ok(())
    }

    /// One JSON object per line, oldest first.
    pub fn to_jsonl(&self) -> Result<String, MinerError> {
        let lines = self
            .lock()?
            .iter()
            .map(|entry| serde_json::to_string(entry).map_err(|e| codec_error("encode", e)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(lines.join("\n"))
    }

    /// Loads a recording; blank lines are skipped.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, MinerError> {
        let entries = jsonl
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|e| codec_error("decode", e)))
            .collect::<Result<Vec<SessionRecordEntry>, _>>()?;
        Ok(Self::with_entries(SessionRecordLevel::Full, entries))
    }

    /// Rewrites a recording into a stable fixture.
    ///
    /// Entries are ordered by timestamp (ties keep file order), filtered
    /// according to `options`, and session ids can be replaced with a fixed
    /// placeholder so fixtures do not change between captures.
    pub fn normalize_jsonl(jsonl: &str, options: NormalizeOptions) -> Result<String, MinerError> {
        let mut entries = Self::from_jsonl(jsonl)?.entries()?;
        entries.sort_by_key(|entry| entry.ts_ms);

        entries.retain(|entry| match &entry.event {
            SessionEvent::ExchangeFailed { .. } => options.keep_failures,
            event if event.is_session_lifecycle() => options.keep_session_events,
            _ => true,
        });
        if options.redact_session_ids {
            for entry in &mut entries {
                if let SessionEvent::LoggedOn { session_id } = &mut entry.event {
                    *session_id = REDACTED_SESSION_ID.to_string();
                }
            }
        }

        Self::with_entries(SessionRecordLevel::Full, entries).to_jsonl()
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new(SessionRecordLevel::default())
    }
}

/// Serves recorded replies in order, without a miner.
#[derive(Debug, Clone)]
pub struct SessionReplayer {
    entries: Vec<SessionRecordEntry>,
    cursor: usize,
}

impl SessionReplayer {
    pub fn from_recorder(recorder: &SessionRecorder) -> Self {
        Self {
            entries: recorder.entries().unwrap_or_default(),
            cursor: 0,
        }
    }

    pub fn from_jsonl(jsonl: &str) -> Result<Self, MinerError> {
        SessionRecorder::from_jsonl(jsonl).map(|recorder| Self::from_recorder(&recorder))
    }

    /// Address of the first `connected` event.
    pub fn initial_address(&self) -> Option<Address> {
        self.entries.iter().find_map(|entry| match &entry.event {
            SessionEvent::Connected { address } => address.parse().ok(),
            _ => None,
        })
    }

    /// Returns the next recorded reply to `command` after the cursor.
    ///
    /// Names match case-insensitively. Replies recorded without payload
    /// cannot be replayed.
    pub fn replay_next(&mut self, command: &str) -> Result<Reply, MinerError> {
        let found = self.entries[self.cursor..]
            .iter()
            .enumerate()
            .find_map(|(offset, entry)| match &entry.event {
                SessionEvent::ReplyReceived {
                    command: recorded,
                    reply,
                    ..
                } if recorded.eq_ignore_ascii_case(command) => Some((offset, reply.clone())),
                _ => None,
            });
        let Some((offset, reply)) = found else {
            self.cursor = self.entries.len();
            return Err(MinerError::ReplayMismatch(format!(
                "no replayable reply found for command '{command}'"
            )));
        };
        self.cursor += offset + 1;

        if reply.is_null() {
            return Err(MinerError::ReplayMismatch(format!(
                "reply payload for '{command}' was not recorded"
            )));
        }
        let address = self
            .initial_address()
            .unwrap_or_else(|| Address::new("replay", 0));
        let bytes = serde_json::to_vec(&reply).map_err(|e| codec_error("encode", e))?;
        wire::parse_reply(&address, &bytes)
    }

    /// Replays `script` command by command; the first miss aborts.
    pub fn replay_script(&mut self, script: &[Command]) -> Result<Vec<Reply>, MinerError> {
        script
            .iter()
            .map(|command| self.replay_next(&command.name))
            .collect()
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOISY_FIXTURE: &str = r#"{"ts_ms":3,"event":{"kind":"logged_on","session_id":"abc123"}}
{"ts_ms":1,"event":{"kind":"connected","address":"10.0.0.1:4028"}}
{"ts_ms":2,"event":{"kind":"exchange_failed","command":"version","error_kind":"command_timeout","reason":"timeout"}}
{"ts_ms":4,"event":{"kind":"reply_received","command":"version","valid":true,"reply":{"STATUS":[{"STATUS":"S"}],"id":1}}}
{"ts_ms":5,"event":{"kind":"logged_off","acknowledged":true}}
"#;

    fn reply_event(command: &str, reply: Value) -> SessionEvent {
        SessionEvent::ReplyReceived {
            command: command.to_string(),
            valid: true,
            reply,
        }
    }

    #[test]
    fn recorder_jsonl_roundtrip() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::Closed {
                reason: "close_called".to_string(),
            })
            .expect("record close");

        let jsonl = recorder.to_jsonl().expect("encode jsonl");
        let restored = SessionRecorder::from_jsonl(&jsonl).expect("decode jsonl");
        let entries = restored.entries().expect("entries");

        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].event, SessionEvent::Closed { .. }));
    }

    #[test]
    fn replayer_returns_matching_reply() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Full);
        recorder
            .record_event(SessionEvent::Connected {
                address: "10.0.0.1:4028".to_string(),
            })
            .expect("record connect");
        recorder
            .record_event(reply_event(
                "version",
                json!({"STATUS": [{"STATUS": "S", "Code": 22}], "VERSION": [{"API": "3.7"}], "id": 1}),
            ))
            .expect("record reply");

        let mut replayer = SessionReplayer::from_recorder(&recorder);
        assert_eq!(replayer.initial_address(), Some(Address::new("10.0.0.1", 4028)));
        let reply = replayer.replay_next("version").expect("replay");

        assert!(reply.is_valid());
        assert_eq!(reply.status().code, 22);
    }

    #[test]
    fn replay_script_consumes_replies_in_order() {
        let recorder = SessionRecorder::default();
        for (command, code) in [("summary", 11), ("pools", 7), ("summary", 12)] {
            recorder
                .record_event(reply_event(
                    command,
                    json!({"STATUS": [{"STATUS": "S", "Code": code}], "id": 1}),
                ))
                .expect("record reply");
        }

        let mut replayer = SessionReplayer::from_recorder(&recorder);
        let script = [Command::new("summary"), Command::new("summary")];
        let replies = replayer.replay_script(&script).expect("replay script");
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].status().code, 11);
        assert_eq!(replies[1].status().code, 12);
    }

    #[test]
    fn replay_next_returns_error_when_command_not_found() {
        let recorder = SessionRecorder::default();
        recorder
            .record_event(reply_event("pools", json!({"STATUS": [{"STATUS": "S"}], "id": 1})))
            .expect("record reply");

        let mut replayer = SessionReplayer::from_recorder(&recorder);
        let err = match replayer.replay_next("version") {
            Ok(_) => panic!("missing replay should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, MinerError::ReplayMismatch(_)));
    }

    #[test]
    fn key_events_only_drops_reply_payloads() {
        let recorder = SessionRecorder::new(SessionRecordLevel::KeyEventsOnly);
        recorder
            .record_event(reply_event("version", json!({"STATUS": [{"STATUS": "S"}], "id": 1})))
            .expect("record reply");

        let entries = recorder.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            &entries[0].event,
            SessionEvent::ReplyReceived { reply, .. } if reply.is_null()
        ));

        let mut replayer = SessionReplayer::from_recorder(&recorder);
        assert!(matches!(
            replayer.replay_next("version"),
            Err(MinerError::ReplayMismatch(_))
        ));
    }

    #[test]
    fn off_level_records_nothing() {
        let recorder = SessionRecorder::new(SessionRecordLevel::Off);
        recorder
            .record_event(SessionEvent::LoggedOff { acknowledged: true })
            .expect("record logoff");
        assert!(recorder.entries().expect("entries").is_empty());
    }

    #[test]
    fn from_jsonl_accepts_empty_input() {
        let restored = SessionRecorder::from_jsonl("").expect("decode empty jsonl");
        assert!(restored.entries().expect("entries").is_empty());
    }

    #[test]
    fn recorder_clear_removes_all_entries() {
        let recorder = SessionRecorder::default();
        recorder
            .record_event(SessionEvent::LoggedOff { acknowledged: false })
            .expect("record logoff");
        recorder.clear().expect("clear");
        assert!(recorder.entries().expect("entries").is_empty());
    }

    #[test]
    fn normalize_jsonl_sorts_and_redacts_session_ids() {
        let normalized =
            SessionRecorder::normalize_jsonl(NOISY_FIXTURE, NormalizeOptions::default())
                .expect("normalize");
        let restored = SessionRecorder::from_jsonl(&normalized).expect("restore normalized");
        let entries = restored.entries().expect("entries");

        assert_eq!(entries.len(), 5);
        assert!(matches!(entries[0].event, SessionEvent::Connected { .. }));
        assert!(matches!(
            &entries[2].event,
            SessionEvent::LoggedOn { session_id } if session_id == REDACTED_SESSION_ID
        ));
        assert!(entries.windows(2).all(|w| w[0].ts_ms <= w[1].ts_ms));
    }

    #[test]
    fn normalize_jsonl_can_drop_failures_and_session_events() {
        let options = NormalizeOptions {
            keep_failures: false,
            keep_session_events: false,
            redact_session_ids: false,
        };
        let normalized =
            SessionRecorder::normalize_jsonl(NOISY_FIXTURE, options).expect("normalize");
        let restored = SessionRecorder::from_jsonl(&normalized).expect("restore normalized");
        let entries = restored.entries().expect("entries");
        assert_eq!(entries.len(), 2);
    }
}
