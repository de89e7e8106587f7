use super::*;

async fn connect(address: &Address) -> Result<TcpStream, MinerError> {
    let stream = TcpStream::connect((address.host.as_str(), address.port))
        .await
        .map_err(|e| MinerError::Connection {
            address: address.clone(),
            reason: e.to_string(),
        })?;
    trace!("{} TCP connection successful", address);
    Ok(stream)
}

/// Sends one request and reads one reply, consuming the connection.
async fn exchange(
    address: &Address,
    stream: Option<TcpStream>,
    request: &[u8],
) -> Result<Reply, MinerError> {
    let mut stream = match stream {
        Some(stream) => stream,
        None => connect(address).await?,
    };

    let write_failed = |e: std::io::Error| MinerError::Connection {
        address: address.clone(),
        reason: format!("write failed: {e}"),
    };
    stream.write_all(request).await.map_err(write_failed)?;
    stream.flush().await.map_err(write_failed)?;

    let frame = wire::read_frame(address, &mut stream).await?;
    wire::parse_reply(address, &frame)
}

impl Session {
    /// Connects to `address`; `timeout` bounds the connect and becomes the
    /// default deadline of later exchanges.
    pub async fn open(address: Address, timeout: Duration) -> Result<Session, MinerError> {
        let started = Instant::now();
        let stream = match tokio::time::timeout(timeout, connect(&address)).await {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(MinerError::CommandTimeout {
                    address,
                    elapsed_ms: started.elapsed().as_millis(),
                });
            }
        };
        debug!("{} session opened", address);

        Ok(Session {
            address,
            stream: Some(stream),
            sid: None,
            timeout,
            recorder: None,
        })
    }

    /// Binds a recorder; a `Connected` event is recorded right away.
    pub fn with_recorder(mut self, recorder: SessionRecorder) -> Self {
        let _ = recorder.record_event(SessionEvent::Connected {
            address: self.address.to_string(),
        });
        self.recorder = Some(recorder);
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The session id obtained by [`logon`](Self::logon), if any.
    pub fn session_id(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.sid.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn record(&self, event: SessionEvent) {
        if let Some(recorder) = self.recorder.as_ref() {
            let _ = recorder.record_event(event);
        }
    }

    /// One request/reply exchange with the session's default deadline.
    ///
    /// The reply status is not interpreted; see [`rexec`](Self::rexec).
    pub async fn roundtrip(&mut self, command: &Command) -> Result<Reply, MinerError> {
        self.roundtrip_with_timeout(command, self.timeout).await
    }

    /// One request/reply exchange bounded by `timeout`.
    ///
    /// On timeout the in-flight socket is dropped before returning, so the
    /// session stays usable and closable.
    pub async fn roundtrip_with_timeout(
        &mut self,
        command: &Command,
        timeout: Duration,
    ) -> Result<Reply, MinerError> {
        let request = wire::encode(command)?;
        self.record(SessionEvent::CommandSent {
            command: command.name.clone(),
            parameter: command.joined_parameters(),
        });
        trace!(
            "{} sending '{}'",
            self.address,
            String::from_utf8_lossy(&request)
        );

        let started = Instant::now();
        let stream = self.stream.take();
        let result = match tokio::time::timeout(timeout, exchange(&self.address, stream, &request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(MinerError::CommandTimeout {
                address: self.address.clone(),
                elapsed_ms: started.elapsed().as_millis(),
            }),
        };

        match &result {
            Ok(reply) => {
                debug!(
                    "{} '{}' replied {} in {}ms",
                    self.address,
                    command.name,
                    reply.status().status,
                    started.elapsed().as_millis()
                );
                self.record(SessionEvent::ReplyReceived {
                    command: command.name.clone(),
                    valid: reply.is_valid(),
                    reply: Value::Object(reply.payload().clone()),
                });
            }
            Err(err) => {
                debug!("{} '{}' failed: {}", self.address, command.name, err);
                self.record(SessionEvent::ExchangeFailed {
                    command: command.name.clone(),
                    error_kind: err.kind(),
                    reason: err.to_string(),
                });
            }
        }
        result
    }

    fn check_reply(&self, command: &str, reply: Reply) -> Result<Reply, MinerError> {
        if reply.is_valid() {
            return Ok(reply);
        }
        let status = reply.status();
        Err(MinerError::CommandFailed {
            address: self.address.clone(),
            command: command.to_string(),
            code: status.code,
            msg: status.msg.clone(),
        })
    }

    /// Executes one command and requires the device to accept it.
    ///
    /// Privileged commands (per the catalog) need a prior
    /// [`logon`](Self::logon); the session id is prepended to their
    /// parameters.
    pub async fn rexec(&mut self, mut command: Command, timeout: Duration) -> Result<Reply, MinerError> {
        if catalog::logon_required(&command.name).unwrap_or(false) {
            let Some(sid) = self.sid.clone() else {
                return Err(MinerError::SessionAlreadyActive {
                    address: self.address.clone(),
                    reason: format!("command '{}' requires logon", command.name),
                });
            };
            command.prepend(sid);
        }
        let reply = self.roundtrip_with_timeout(&command, timeout).await?;
        self.check_reply(&command.name, reply)
    }

    /// Performs the logon handshake and stores the session id.
    pub async fn logon(&mut self) -> Result<String, MinerError> {
        if self.sid.is_some() {
            return Err(MinerError::SessionAlreadyActive {
                address: self.address.clone(),
                reason: "session already logged on".to_string(),
            });
        }

        let reply = self.roundtrip(&Command::new("logon")).await?;

        // A second logon on the device answers code 402 without a SESSION.
        if reply.get("SESSION").is_none() && reply.status().code == 402 {
            return Err(MinerError::SessionAlreadyActive {
                address: self.address.clone(),
                reason: "another session is active".to_string(),
            });
        }
        let reply = self.check_reply("logon", reply)?;
        let session = wire::validate(&self.address, &reply, "SESSION", Some(1), Some(1))?;

        let sid = match session.as_ref().and_then(|s| s.get("SessionID")) {
            Some(Value::String(sid)) => sid.clone(),
            Some(Value::Number(sid)) => sid.to_string(),
            _ => {
                return Err(MinerError::SessionAlreadyActive {
                    address: self.address.clone(),
                    reason: "no SessionID in data".to_string(),
                });
            }
        };

        debug!("{} session id obtained", self.address);
        self.record(SessionEvent::LoggedOn {
            session_id: sid.clone(),
        });
        self.sid = Some(sid.clone());
        Ok(sid)
    }

    /// Releases the session id. A no-op when not logged on.
    ///
    /// The id is forgotten even when the device does not acknowledge.
    pub async fn logoff(&mut self) -> Result<(), MinerError> {
        let Some(sid) = self.sid.take() else {
            return Ok(());
        };
        let result = self
            .roundtrip(&Command::new("logoff").with_parameter(sid))
            .await
            .and_then(|reply| self.check_reply("logoff", reply));
        self.record(SessionEvent::LoggedOff {
            acknowledged: result.is_ok(),
        });
        result.map(|_| ())
    }

    /// Logs off (best effort) and closes the socket. Safe to call twice.
    pub async fn close(&mut self) {
        if self.sid.is_some()
            && let Err(e) = self.logoff().await
        {
            debug!("{} logoff during close failed: {}", self.address, e);
        }

        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.record(SessionEvent::Closed {
            reason: "close_called".to_string(),
        });
        debug!("{} session closed", self.address);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.sid.is_some() {
            debug!(
                "{} session dropped while logged on; the device will expire it",
                self.address
            );
        }
    }
}
