use rluxos::address::{ParsePolicy, iter_ip_ranges, load_addresses_from_csv};
use rluxos::config::{DEFAULT_PORT, ExecOptions, LaunchOptions};
use rluxos::launch::{LaunchResult, Launcher};
use rluxos::session::rexec;
use rluxos::wire::{self, Command};
use std::env;
use std::process;
use std::time::Duration;

fn print_usage() {
    eprintln!(
        "Usage: cargo run --example fleet_version -- <range-expression | @list.csv> [--batch N] [--retries N] [--timeout SECS]"
    );
}

fn parse_flag<T: std::str::FromStr>(name: &str, value: Option<&String>) -> T {
    match value.and_then(|v| v.parse().ok()) {
        Some(value) => value,
        None => {
            eprintln!("Invalid or missing value for {name}");
            print_usage();
            process::exit(2);
        }
    }
}

/// A finite, non-negative number of seconds.
fn parse_timeout(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(2);
    }

    let mut options = LaunchOptions::default();
    let mut rest = args.iter().skip(2);
    while let Some(flag) = rest.next() {
        match flag.as_str() {
            "--batch" => options.batch_size = parse_flag("--batch", rest.next()),
            "--retries" => options.retries = parse_flag("--retries", rest.next()),
            "--timeout" => {
                let secs: f64 = parse_flag("--timeout", rest.next());
                options.timeout = parse_timeout(secs).unwrap_or_else(|| {
                    eprintln!("Invalid value for --timeout: {secs}");
                    print_usage();
                    process::exit(2);
                });
            }
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

    let target = &args[1];
    let addresses = match target.strip_prefix('@') {
        Some(path) => load_addresses_from_csv(path, DEFAULT_PORT, ParsePolicy::Strict),
        None => iter_ip_ranges(target, DEFAULT_PORT).collect(),
    };
    let addresses = match addresses {
        Ok(addresses) => addresses,
        Err(err) => {
            eprintln!("Failed to resolve targets: {err}");
            process::exit(1);
        }
    };

    let exec = ExecOptions::default().with_timeout(options.timeout);
    let report = Launcher::new(options)
        .on_progress(|result: &LaunchResult<serde_json::Value>| match result.failure() {
            None => eprintln!("{} ok", result.address),
            Some(failure) => eprintln!("{} {}", result.address, failure),
        })
        .run(addresses, move |address| {
            let exec = exec.clone();
            async move {
                let reply = rexec(&address, Command::new("version"), &exec).await?;
                let version = wire::validate(&address, &reply, "VERSION", Some(1), Some(1))?;
                Ok(version.unwrap_or_default())
            }
        })
        .await;

    for result in report.successes() {
        if let Some(version) = result.data() {
            println!("{}\t{}", result.address, version);
        }
    }
    println!(
        "{} ok, {} failed in {}ms",
        report.successes().count(),
        report.failures().count(),
        report.elapsed.as_millis()
    );
    if !report.is_success() {
        process::exit(1);
    }
}
