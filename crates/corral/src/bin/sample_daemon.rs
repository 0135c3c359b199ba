//! Scriptable daemon used as a fixture by the corral test suites.
//!
//! It reads its channel wiring from the environment the factory injects,
//! then behaves as the flags describe: open a port late, write a pid file
//! once startup is complete, publish events on a schedule, forward log
//! records, ignore the graceful stop signal, or exit on its own with a chosen
//! code.

use std::fs;
use std::io::{self, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use corral_config::LogLevel;
use corral_wire::{DaemonEnvironment, EventPublisher, ForwardingLayer, FrameError};
use serde_json::json;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOGGER: &str = "sample";
const TICK: Duration = Duration::from_millis(10);

/// One scheduled event: `TAG` or `TAG@MILLIS`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Emit {
    tag: String,
    after: Duration,
}

fn parse_emit(raw: &str) -> Result<Emit, String> {
    let (tag, after) = match raw.rsplit_once('@') {
        Some((tag, delay)) => {
            let millis: u64 = delay
                .parse()
                .map_err(|error| format!("invalid delay in '{raw}': {error}"))?;
            (tag, Duration::from_millis(millis))
        }
        None => (raw, Duration::ZERO),
    };
    if tag.is_empty() {
        return Err(format!("empty tag in '{raw}'"));
    }
    Ok(Emit {
        tag: tag.to_owned(),
        after,
    })
}

/// One log record: `LEVEL:MESSAGE`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LogLine {
    level: LogLevel,
    message: String,
}

fn parse_log(raw: &str) -> Result<LogLine, String> {
    let (name, message) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected LEVEL:MESSAGE, got '{raw}'"))?;
    let level = name
        .parse::<LogLevel>()
        .map_err(|error| format!("invalid level in '{raw}': {error}"))?;
    Ok(LogLine {
        level,
        message: message.to_owned(),
    })
}

/// Command-line interface of the sample daemon.
#[derive(Parser, Debug)]
#[command(name = "corral-sample-daemon")]
struct Cli {
    /// Accepts TCP connections on `127.0.0.1:PORT`.
    #[arg(long, value_name = "PORT")]
    listen_port: Option<u16>,
    /// Delay before the listening socket is opened.
    #[arg(long, value_name = "MS", default_value_t = 0)]
    listen_delay_ms: u64,
    /// Writes the process id to this file once signal handlers are installed
    /// and startup output and records have been sent.
    #[arg(long, value_name = "PATH")]
    pidfile: Option<PathBuf>,
    /// Publishes an event with this tag, optionally after a delay.
    #[arg(long, value_name = "TAG[@MS]", value_parser = parse_emit)]
    emit: Vec<Emit>,
    /// Forwards one log record.
    #[arg(long, value_name = "LEVEL:MESSAGE", value_parser = parse_log)]
    log: Vec<LogLine>,
    /// Forwards this many numbered info records in order.
    #[arg(long, value_name = "COUNT", default_value_t = 0)]
    log_burst: u32,
    /// Keeps running when asked to terminate gracefully.
    #[arg(long)]
    ignore_sigterm: bool,
    /// Exits on its own after this delay.
    #[arg(long, value_name = "MS")]
    exit_after_ms: Option<u64>,
    /// Exit code used when exiting on its own.
    #[arg(long, default_value_t = 0)]
    exit_code: u8,
    /// Line written to standard output at startup.
    #[arg(long = "stdout", value_name = "LINE")]
    stdout_lines: Vec<String>,
    /// Line written to standard error at startup.
    #[arg(long = "stderr", value_name = "LINE")]
    stderr_lines: Vec<String>,
}

#[derive(Debug, Error)]
enum SampleError {
    #[error("failed to write {stream}: {source}")]
    Output {
        stream: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("failed to write pid file: {0}")]
    PidFile(#[source] io::Error),
    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
    #[error("failed to connect to a channel: {0}")]
    Channel(#[source] FrameError),
    #[error("failed to listen on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(error) => {
            // stderr may itself be closed; the exit code still reports failure.
            writeln!(io::stderr().lock(), "corral-sample-daemon: {error}").ok();
            ExitCode::from(70)
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode, SampleError> {
    let environment = DaemonEnvironment::from_env().unwrap_or_else(|error| {
        writeln!(io::stderr().lock(), "running without channels: {error}").ok();
        DaemonEnvironment::new("sample-daemon")
    });

    let terminate = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&terminate)).map_err(SampleError::Signals)?;
    }

    if let Some(forwarder) = environment.connect_logs().map_err(SampleError::Channel)? {
        tracing_subscriber::registry()
            .with(ForwardingLayer::new(Arc::new(forwarder)))
            .try_init()
            .ok();
    }
    let publisher = environment.connect_events().map_err(SampleError::Channel)?;

    write_lines(io::stdout(), "stdout", &cli.stdout_lines)?;
    write_lines(io::stderr(), "stderr", &cli.stderr_lines)?;
    for line in &cli.log {
        forward(line.level, &line.message);
    }
    for index in 0..cli.log_burst {
        forward(LogLevel::Info, &format!("burst {index}"));
    }
    // Signal handlers are in place and startup output is sent by now.
    if let Some(path) = &cli.pidfile {
        fs::write(path, format!("{}\n", std::process::id())).map_err(SampleError::PidFile)?;
    }

    let started = Instant::now();
    let mut listener = None;
    let mut pending: Vec<&Emit> = cli.emit.iter().collect();
    let exit_after = cli.exit_after_ms.map(Duration::from_millis);

    loop {
        let elapsed = started.elapsed();
        if listener.is_none()
            && let Some(port) = cli.listen_port
            && elapsed >= Duration::from_millis(cli.listen_delay_ms)
        {
            listener = Some(listen(port)?);
        }
        pending.retain(|emit| {
            if elapsed < emit.after {
                return true;
            }
            publish(publisher.as_ref(), &emit.tag);
            false
        });
        if exit_after.is_some_and(|limit| elapsed >= limit) {
            forward(LogLevel::Info, "exiting on schedule");
            return Ok(ExitCode::from(cli.exit_code));
        }
        if terminate.swap(false, Ordering::SeqCst) {
            if cli.ignore_sigterm {
                forward(LogLevel::Warn, "ignoring termination request");
            } else {
                publish(publisher.as_ref(), "sample/stopping");
                forward(LogLevel::Info, "terminating on request");
                return Ok(ExitCode::SUCCESS);
            }
        }
        thread::sleep(TICK);
    }
}

fn write_lines(mut stream: impl Write, name: &'static str, lines: &[String]) -> Result<(), SampleError> {
    let wrap = |source| SampleError::Output {
        stream: name,
        source,
    };
    for line in lines {
        writeln!(stream, "{line}").map_err(wrap)?;
    }
    stream.flush().map_err(wrap)
}

fn listen(port: u16) -> Result<thread::JoinHandle<()>, SampleError> {
    let socket = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .map_err(|source| SampleError::Listen { port, source })?;
    Ok(thread::spawn(move || {
        for stream in socket.incoming().flatten() {
            drop(stream);
        }
    }))
}

fn publish(channel: Option<&EventPublisher>, tag: &str) {
    let Some(publisher) = channel else {
        return;
    };
    if let Err(error) = publisher.publish(tag, json!({ "pid": std::process::id() })) {
        forward(LogLevel::Warn, &format!("failed to publish '{tag}': {error}"));
    }
}

fn forward(level: LogLevel, message: &str) {
    match level {
        LogLevel::Trace => tracing::trace!(target: LOGGER, "{message}"),
        LogLevel::Debug => tracing::debug!(target: LOGGER, "{message}"),
        LogLevel::Info => tracing::info!(target: LOGGER, "{message}"),
        LogLevel::Warn => tracing::warn!(target: LOGGER, "{message}"),
        LogLevel::Error => tracing::error!(target: LOGGER, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("ready", "ready", 0)]
    #[case("job/1/complete@250", "job/1/complete", 250)]
    #[case("mail@host@10", "mail@host", 10)]
    fn parses_scheduled_events(#[case] raw: &str, #[case] tag: &str, #[case] millis: u64) {
        let emit = parse_emit(raw).expect("valid emit");
        assert_eq!(emit.tag, tag);
        assert_eq!(emit.after, Duration::from_millis(millis));
    }

    #[rstest]
    #[case("@10")]
    #[case("tag@soon")]
    fn rejects_bad_events(#[case] raw: &str) {
        assert!(parse_emit(raw).is_err());
    }

    #[test]
    fn parses_log_lines() {
        let line = parse_log("warning:disk: nearly full").expect("valid log");
        assert_eq!(line.level, LogLevel::Warn);
        assert_eq!(line.message, "disk: nearly full");
        assert!(parse_log("loud:hello").is_err());
        assert!(parse_log("no separator").is_err());
    }
}
