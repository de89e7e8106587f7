#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rluxos::address::Address;
use rluxos::catalog;
use rluxos::wire::{self, Command, FrameDecoder};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub const SESSION_ID: &str = "abc123";

/// How the fake miner answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Speak the protocol like a real miner.
    Normal,
    /// Read the request and never answer.
    Stall,
    /// Answer with bytes that are not JSON.
    Garbage,
    /// Answer with JSON that lacks the reply envelope.
    NoEnvelope,
    /// Refuse logon as if another session was active.
    Busy,
    /// Read the request, never answer, and count when the client hangs up.
    Hold,
}

#[derive(Debug, Default)]
struct State {
    requests: Vec<Command>,
    session: Option<String>,
    connections: usize,
    hangups: usize,
}

/// A miner API double listening on an ephemeral localhost port.
pub struct FakeMiner {
    pub address: Address,
    state: Arc<Mutex<State>>,
    handle: JoinHandle<()>,
}

impl FakeMiner {
    pub async fn start() -> Self {
        Self::start_with(Behavior::Normal).await
    }

    pub async fn start_with(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(State::default()));

        let shared = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                shared.lock().expect("state").connections += 1;
                let shared = Arc::clone(&shared);
                tokio::spawn(serve(stream, behavior, shared));
            }
        });

        Self {
            address: Address::new("127.0.0.1", port),
            state,
            handle,
        }
    }

    /// Command names received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        let state = self.state.lock().expect("state");
        state.requests.iter().map(|c| c.name.clone()).collect()
    }

    pub fn requests(&self) -> Vec<Command> {
        self.state.lock().expect("state").requests.clone()
    }

    pub fn active_session(&self) -> Option<String> {
        self.state.lock().expect("state").session.clone()
    }

    pub fn connections(&self) -> usize {
        self.state.lock().expect("state").connections
    }

    /// Connections whose client side was closed while held open.
    pub fn hangups(&self) -> usize {
        self.state.lock().expect("state").hangups
    }
}

impl Drop for FakeMiner {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, behavior: Behavior, state: Arc<Mutex<State>>) {
    let peer = Address::new("client", 0);
    let mut decoder = FrameDecoder::new();
    let mut chunk = [0u8; 1024];
    let frame = loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        match decoder.push(&peer, &chunk[..n]) {
            Ok(Some(frame)) => break frame,
            Ok(None) => continue,
            Err(_) => return,
        }
    };
    let Ok(command) = wire::decode_request(&frame) else {
        return;
    };
    state.lock().expect("state").requests.push(command.clone());

    let body = match behavior {
        Behavior::Stall => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return;
        }
        Behavior::Hold => {
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            state.lock().expect("state").hangups += 1;
            return;
        }
        Behavior::Garbage => b"this is not json".to_vec(),
        Behavior::NoEnvelope => br#"{"VERSION":[{"API":"3.7"}]}"#.to_vec(),
        Behavior::Normal | Behavior::Busy => {
            let reply = answer(&command, behavior, &state);
            serde_json::to_vec(&reply).expect("encode reply")
        }
    };

    let _ = stream.write_all(&body).await;
    let _ = stream.write_all(&[0]).await;
    let _ = stream.shutdown().await;
}

fn status(status: &str, code: i64, msg: &str) -> Value {
    json!([{"STATUS": status, "When": 1700000000, "Code": code, "Msg": msg, "Description": "LUXminer 2024.1.1"}])
}

fn answer(command: &Command, behavior: Behavior, state: &Arc<Mutex<State>>) -> Value {
    let mut state = state.lock().expect("state");
    let first = command.parameters.first().map(|p| p.to_string());

    match command.name.as_str() {
        "logon" => {
            if behavior == Behavior::Busy || state.session.is_some() {
                return json!({"STATUS": status("E", 402, "Another session is active"), "id": 1});
            }
            state.session = Some(SESSION_ID.to_string());
            json!({
                "STATUS": status("S", 248, "Logon ok"),
                "SESSION": [{"SessionID": SESSION_ID}],
                "id": 1
            })
        }
        "logoff" => {
            if first.is_some() && first == state.session {
                state.session = None;
                json!({"STATUS": status("S", 249, "Logoff ok"), "id": 1})
            } else {
                json!({"STATUS": status("E", 403, "Invalid session id"), "id": 1})
            }
        }
        "version" => json!({
            "STATUS": status("S", 22, "LUXminer versions"),
            "VERSION": [{"API": "3.7", "LUXminer": "2024.1.1", "Type": "Antminer S19"}],
            "id": 1
        }),
        "pools" => json!({
            "STATUS": status("S", 7, "2 Pool(s)"),
            "POOLS": [{"POOL": 0, "URL": "stratum+tcp://a"}, {"POOL": 1, "URL": "stratum+tcp://b"}],
            "id": 1
        }),
        name if catalog::logon_required(name) == Some(true) => {
            if first.is_some() && first == state.session {
                json!({"STATUS": status("S", 300, "Command ok"), "id": 1})
            } else {
                json!({"STATUS": status("E", 403, "Invalid session id"), "id": 1})
            }
        }
        _ => json!({"STATUS": status("E", 14, "Invalid command"), "id": 1}),
    }
}
