use super::*;

/// Opens a session, runs `f` on it, then logs off and closes it.
///
/// The cleanup runs whether `f` succeeds or fails. If the returned future is
/// dropped early (a caller deadline, an aborted batch task) the session is
/// dropped with it and its socket is closed; the device expires any
/// outstanding session id on its own.
pub async fn with_session<T, F>(
    address: Address,
    options: &ExecOptions,
    recorder: Option<SessionRecorder>,
    f: F,
) -> Result<T, MinerError>
where
    F: AsyncFnOnce(&mut Session) -> Result<T, MinerError>,
{
    let mut session = Session::open(address, options.timeout).await?;
    if let Some(recorder) = recorder {
        session = session.with_recorder(recorder);
    }

    let result = f(&mut session).await;
    if let Err(e) = &result {
        debug!("{} scoped operation failed: {}", session.address(), e);
    }
    session.close().await;
    result
}

/// Executes one command against `address`, handling logon/logoff when the
/// catalog marks the command as privileged.
///
/// `logon` is rejected before connecting: the session id would be lost when
/// this call returns. Use [`Session::logon`] or [`with_session`] instead.
pub async fn rexec(
    address: &Address,
    command: Command,
    options: &ExecOptions,
) -> Result<Reply, MinerError> {
    if command.name.eq_ignore_ascii_case("logon") {
        return Err(MinerError::SessionAlreadyActive {
            address: address.clone(),
            reason: "logon is only available through Session::logon".to_string(),
        });
    }
    let mut session = Session::open(address.clone(), options.timeout).await?;
    let result = async {
        if catalog::logon_required(&command.name).unwrap_or(false) {
            session.logon().await?;
        }
        session.rexec(command, options.timeout).await
    }
    .await;
    session.close().await;
    result
}

/// One-shot exchange without any session handling or status check.
pub async fn roundtrip(
    address: &Address,
    command: &Command,
    timeout: Duration,
) -> Result<Reply, MinerError> {
    let started = Instant::now();
    let mut session = Session::open(address.clone(), timeout).await?;
    let remaining = timeout.saturating_sub(started.elapsed());
    session.roundtrip_with_timeout(command, remaining).await
}
