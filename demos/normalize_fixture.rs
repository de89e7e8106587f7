use rluxos::session::{NormalizeOptions, SessionEvent, SessionRecorder, SessionReplayer};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::process;

fn print_usage() {
    eprintln!(
        "Usage: cargo run --example normalize_fixture -- <recording.jsonl> <fixture.jsonl> [--drop-failures] [--drop-session] [--keep-session-ids]"
    );
}

fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::Connected { .. } => "connected",
        SessionEvent::CommandSent { .. } => "command_sent",
        SessionEvent::ReplyReceived { .. } => "reply_received",
        SessionEvent::ExchangeFailed { .. } => "exchange_failed",
        SessionEvent::LoggedOn { .. } => "logged_on",
        SessionEvent::LoggedOff { .. } => "logged_off",
        SessionEvent::Closed { .. } => "closed",
    }
}

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        print_usage();
        process::exit(2);
    }
    let (input, output) = (&args[1], &args[2]);

    let mut options = NormalizeOptions::default();
    for flag in &args[3..] {
        match flag.as_str() {
            "--drop-failures" => options.keep_failures = false,
            "--drop-session" => options.keep_session_events = false,
            "--keep-session-ids" => options.redact_session_ids = false,
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            unknown => {
                eprintln!("Unknown flag: {unknown}");
                print_usage();
                process::exit(2);
            }
        }
    }

    let recording = fs::read_to_string(input).unwrap_or_else(|err| {
        eprintln!("Failed to read recording '{input}': {err}");
        process::exit(1);
    });
    let fixture = SessionRecorder::normalize_jsonl(&recording, options).unwrap_or_else(|err| {
        eprintln!("Failed to normalize recording: {err}");
        process::exit(1);
    });

    // Re-load the fixture to report what it holds and which replies replay.
    let recorder = SessionRecorder::from_jsonl(&fixture).unwrap_or_else(|err| {
        eprintln!("Normalized fixture does not load back: {err}");
        process::exit(1);
    });
    let entries = recorder.entries().unwrap_or_default();
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut replayable = Vec::new();
    for entry in &entries {
        *counts.entry(event_name(&entry.event)).or_default() += 1;
        if let SessionEvent::ReplyReceived { command, .. } = &entry.event {
            replayable.push(command.clone());
        }
    }

    let mut replayer = SessionReplayer::from_recorder(&recorder);
    for command in &replayable {
        if let Err(err) = replayer.replay_next(command) {
            eprintln!("warning: reply for '{command}' will not replay: {err}");
        }
    }

    if let Err(err) = fs::write(output, &fixture) {
        eprintln!("Failed to write fixture '{output}': {err}");
        process::exit(1);
    }

    for (name, count) in counts {
        println!("{name:>16} {count}");
    }
    println!("Fixture with {} event(s) written to {output}", entries.len());
}
