//! Log forwarding from real daemons into the session's sink.
#![cfg(unix)]

mod support;

use std::time::Duration;

use corral::LogRecord;
use corral_config::{LogLevel, SessionConfig};
use rstest::rstest;

use support::{Harness, config, sample, settled};

fn messages(records: &[LogRecord]) -> Vec<&str> {
    records.iter().map(|record| record.message.as_str()).collect()
}

#[test]
fn records_from_one_daemon_arrive_in_order() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let handle = harness
        .factory
        .spawn(
            settled("master-1", &dir)
                .args(["--log-burst", "200"])
                .forward_logs(true)
                .build()
                .expect("valid spec"),
        )
        .expect("ready");
    handle.stop(Duration::from_secs(2)).expect("stop");

    let records = harness.logs.records_for("master-1");
    let burst: Vec<&str> = messages(&records)
        .into_iter()
        .filter(|message| message.starts_with("burst "))
        .collect();
    let expected: Vec<String> = (0..200).map(|index| format!("burst {index}")).collect();
    assert_eq!(burst, expected);
    assert!(records.iter().all(|record| record.logger == "sample"));
}

#[rstest]
#[case::default_threshold(LogLevel::Info, &["kept warn", "kept info"][..])]
#[case::errors_only(LogLevel::Error, &[][..])]
#[case::everything(LogLevel::Trace, &["kept warn", "kept info", "debug detail"][..])]
fn forward_level_filters_records(#[case] level: LogLevel, #[case] expected: &[&str]) {
    let harness = Harness::with_config(config().with_forward_level(level));
    let dir = tempfile::tempdir().expect("temp dir");
    let handle = harness
        .factory
        .spawn(
            settled("filtered", &dir)
                .args(["--log", "warn:kept warn", "--log", "info:kept info", "--log", "debug:debug detail"])
                .forward_logs(true)
                .build()
                .expect("valid spec"),
        )
        .expect("ready");
    handle.stop(Duration::from_secs(2)).expect("stop");

    let records = harness.logs.records_for("filtered");
    let startup: Vec<&str> = messages(&records)
        .into_iter()
        .filter(|message| message.contains("kept") || message.contains("detail"))
        .collect();
    assert_eq!(startup, expected);
    assert!(records.iter().all(|record| record.level.passes(level)));
}

#[test]
fn prefix_is_prepended() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let handle = harness
        .factory
        .spawn(
            settled("minion-1", &dir)
                .args(["--log", "error:key rejected"])
                .log_prefix("minion-1")
                .forward_logs(true)
                .build()
                .expect("valid spec"),
        )
        .expect("ready");
    handle.stop(Duration::from_secs(2)).expect("stop");

    let records = harness.logs.records_for("minion-1");
    let rejected = records
        .iter()
        .find(|record| record.level == LogLevel::Error)
        .expect("error record");
    assert_eq!(rejected.message, "[minion-1] key rejected");
}

#[test]
fn concurrent_daemons_keep_their_own_order() {
    let harness = Harness::new();
    let dir = tempfile::tempdir().expect("temp dir");
    let handles: Vec<_> = ["left", "right"]
        .into_iter()
        .map(|id| {
            harness
                .factory
                .spawn(
                    settled(id, &dir)
                        .args(["--log-burst", "100"])
                        .forward_logs(true)
                        .build()
                        .expect("valid spec"),
                )
                .expect("ready")
        })
        .collect();
    for handle in &handles {
        handle.stop(Duration::from_secs(2)).expect("stop");
    }

    for id in ["left", "right"] {
        let records = harness.logs.records_for(id);
        let burst: Vec<&str> = messages(&records)
            .into_iter()
            .filter(|message| message.starts_with("burst "))
            .collect();
        let expected: Vec<String> = (0..100).map(|index| format!("burst {index}")).collect();
        assert_eq!(burst, expected, "{id} lost or reordered records");
    }
    assert_eq!(harness.session().logs().malformed_frames(), 0);
}

#[test]
fn unforwarded_daemons_send_nothing() {
    let harness = Harness::with_config(SessionConfig::default());
    let handle = harness
        .factory
        .spawn(
            sample("mute")
                .args(["--log", "error:not forwarded"])
                .build()
                .expect("valid spec"),
        )
        .expect("ready");
    handle.stop(Duration::from_secs(2)).expect("stop");
    assert!(harness.logs.records_for("mute").is_empty());
    assert_eq!(harness.session().logs().accepted_connections(), 0);
}
