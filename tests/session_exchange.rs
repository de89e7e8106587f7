mod common;

use std::time::{Duration, Instant};

use common::{Behavior, FakeMiner, SESSION_ID};
use rluxos::config::ExecOptions;
use rluxos::error::{ErrorKind, MinerError};
use rluxos::session::{
    Session, SessionEvent, SessionRecordLevel, SessionRecorder, SessionReplayer, rexec,
    roundtrip, with_session,
};
use rluxos::wire::{self, Command};

const TIMEOUT: Duration = Duration::from_secs(2);

fn options() -> ExecOptions {
    ExecOptions::default().with_timeout(TIMEOUT)
}

#[tokio::test]
async fn rexec_reads_unprivileged_command_without_logon() {
    let miner = FakeMiner::start().await;

    let reply = rexec(&miner.address, Command::new("version"), &options())
        .await
        .expect("version");

    assert!(reply.is_valid());
    assert_eq!(reply.status().code, 22);
    let version = wire::validate(&miner.address, &reply, "VERSION", Some(1), Some(1))
        .expect("validate")
        .expect("version entry");
    assert_eq!(version["API"], "3.7");
    assert_eq!(miner.commands(), vec!["version"]);
}

#[tokio::test]
async fn rexec_wraps_privileged_command_in_logon_and_logoff() {
    let miner = FakeMiner::start().await;

    let reply = rexec(
        &miner.address,
        Command::new("ledset").with_parameter("red").with_parameter("blink"),
        &options(),
    )
    .await
    .expect("ledset");

    assert_eq!(reply.status().code, 300);
    assert_eq!(miner.commands(), vec!["logon", "ledset", "logoff"]);
    let requests = miner.requests();
    let params = requests[1]
        .parameters
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>();
    assert_eq!(params, vec![SESSION_ID, "red", "blink"]);
    assert_eq!(requests[2].parameters[0].to_string(), SESSION_ID);
    assert_eq!(miner.active_session(), None);
}

#[tokio::test]
async fn busy_miner_refuses_logon_without_logoff() {
    let miner = FakeMiner::start_with(Behavior::Busy).await;

    let err = rexec(&miner.address, Command::new("ledset").with_parameter("off"), &options())
        .await
        .expect_err("busy miner");

    assert_eq!(err.kind(), ErrorKind::SessionAlreadyActive);
    assert!(!err.kind().is_retryable());
    assert_eq!(miner.commands(), vec!["logon"]);
}

#[tokio::test]
async fn one_shot_logon_is_refused_before_connecting() {
    let miner = FakeMiner::start().await;

    let err = rexec(&miner.address, Command::new("LOGON"), &options())
        .await
        .expect_err("logon through rexec");

    assert_eq!(err.kind(), ErrorKind::SessionAlreadyActive);
    assert_eq!(miner.connections(), 0);
    assert!(miner.commands().is_empty());
    assert_eq!(miner.active_session(), None);
}

#[tokio::test]
async fn one_shot_logoff_releases_a_leftover_session() {
    let miner = FakeMiner::start().await;
    let mut session = Session::open(miner.address.clone(), TIMEOUT)
        .await
        .expect("open");
    session.logon().await.expect("logon");
    drop(session);
    assert_eq!(miner.active_session().as_deref(), Some(SESSION_ID));

    let reply = rexec(
        &miner.address,
        Command::new("logoff").with_parameter(SESSION_ID),
        &options(),
    )
    .await
    .expect("logoff");

    assert!(reply.is_valid());
    assert_eq!(miner.commands(), vec!["logon", "logoff"]);
    assert_eq!(miner.active_session(), None);
}

#[tokio::test]
async fn scoped_session_logs_off_when_the_body_fails() {
    let miner = FakeMiner::start().await;

    let result = with_session(
        miner.address.clone(),
        &options(),
        None,
        async |session: &mut Session| -> Result<(), MinerError> {
            session.logon().await?;
            assert_eq!(session.session_id(), Some(SESSION_ID));
            Err(MinerError::InternalServerError("body failed".to_string()))
        },
    )
    .await;

    assert!(matches!(result, Err(MinerError::InternalServerError(_))));
    assert_eq!(miner.commands(), vec!["logon", "logoff"]);
    assert_eq!(miner.active_session(), None);
}

#[tokio::test]
async fn privileged_command_requires_logon() {
    let miner = FakeMiner::start().await;
    let mut session = Session::open(miner.address.clone(), TIMEOUT)
        .await
        .expect("open");

    let err = session
        .rexec(Command::new("fanset").with_parameter("speed=50"), TIMEOUT)
        .await
        .expect_err("no logon");
    session.close().await;

    assert_eq!(err.kind(), ErrorKind::SessionAlreadyActive);
    assert!(miner.commands().is_empty());
}

#[tokio::test]
async fn second_logon_on_the_same_session_is_rejected() {
    let miner = FakeMiner::start().await;
    let mut session = Session::open(miner.address.clone(), TIMEOUT)
        .await
        .expect("open");

    session.logon().await.expect("first logon");
    assert!(session.is_authenticated());
    let err = session.logon().await.expect_err("second logon");
    assert_eq!(err.kind(), ErrorKind::SessionAlreadyActive);

    session.close().await;
    assert!(!session.is_authenticated());
    assert_eq!(miner.commands(), vec!["logon", "logoff"]);
}

#[tokio::test]
async fn rejected_command_is_a_command_failure() {
    let miner = FakeMiner::start().await;

    let err = rexec(&miner.address, Command::new("frobnicate"), &options())
        .await
        .expect_err("unknown command");

    match err {
        MinerError::CommandFailed { command, code, .. } => {
            assert_eq!(command, "frobnicate");
            assert_eq!(code, 14);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn roundtrip_returns_rejections_unchecked() {
    let miner = FakeMiner::start().await;

    let reply = roundtrip(&miner.address, &Command::new("frobnicate"), TIMEOUT)
        .await
        .expect("roundtrip");
    assert!(!reply.is_valid());

    let err = reply.ensure_valid(&miner.address).expect_err("rejected");
    assert_eq!(err.kind(), ErrorKind::MessageReply);
    assert!(err.to_string().contains("Invalid command"));
}

#[tokio::test]
async fn stalled_miner_times_out() {
    let miner = FakeMiner::start_with(Behavior::Stall).await;
    let started = Instant::now();

    let err = roundtrip(&miner.address, &Command::new("version"), Duration::from_millis(150))
        .await
        .expect_err("stall");

    assert_eq!(err.kind(), ErrorKind::CommandTimeout);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn garbage_reply_is_malformed() {
    let miner = FakeMiner::start_with(Behavior::Garbage).await;

    let err = roundtrip(&miner.address, &Command::new("version"), TIMEOUT)
        .await
        .expect_err("garbage");
    assert_eq!(err.kind(), ErrorKind::MessageMalformed);
}

#[tokio::test]
async fn reply_without_envelope_is_invalid() {
    let miner = FakeMiner::start_with(Behavior::NoEnvelope).await;

    let err = roundtrip(&miner.address, &Command::new("version"), TIMEOUT)
        .await
        .expect_err("no envelope");
    assert_eq!(err.kind(), ErrorKind::MessageInvalid);
}

#[tokio::test]
async fn refused_connection_is_a_connection_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let err = rexec(
        &rluxos::Address::new("127.0.0.1", port),
        Command::new("version"),
        &options(),
    )
    .await
    .expect_err("refused");
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[tokio::test]
async fn recorded_session_replays_offline() {
    let miner = FakeMiner::start().await;
    let recorder = SessionRecorder::new(SessionRecordLevel::Full);

    with_session(
        miner.address.clone(),
        &options(),
        Some(recorder.clone()),
        async |session: &mut Session| {
            session.rexec(Command::new("version"), TIMEOUT).await?;
            session.rexec(Command::new("pools"), TIMEOUT).await
        },
    )
    .await
    .expect("session");

    let entries = recorder.entries().expect("entries");
    assert!(matches!(entries[0].event, SessionEvent::Connected { .. }));
    assert!(matches!(
        entries.last().map(|e| &e.event),
        Some(SessionEvent::Closed { .. })
    ));

    let jsonl = recorder.to_jsonl().expect("jsonl");
    drop(miner);

    let mut replayer = SessionReplayer::from_jsonl(&jsonl).expect("replayer");
    let replies = replayer
        .replay_script(&[Command::new("version"), Command::new("pools")])
        .expect("replay");
    assert_eq!(replies[0].status().code, 22);
    let pools = wire::validate(&replayer_address(&replayer), &replies[1], "POOLS", Some(2), None)
        .expect("validate pools");
    assert!(pools.is_some());
}

fn replayer_address(replayer: &SessionReplayer) -> rluxos::Address {
    replayer.initial_address().expect("recorded address")
}
