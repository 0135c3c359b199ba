//! Spawning, readiness, and termination of real daemon processes.
#![cfg(unix)]

mod support;

use std::time::{Duration, Instant};

use corral::{ProcessState, ReadinessCheck, SpawnError, StartFailure, ports};
use rstest::{fixture, rstest};

use support::{Harness, SETTLE, alive, sample, settled};

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

#[rstest]
fn becomes_ready_once_the_port_opens(harness: Harness) {
    let port = ports::unused_local_port().expect("free port");
    let spec = sample("master-1")
        .args(["--listen-port", &port.to_string(), "--listen-delay-ms", "200"])
        .readiness(ReadinessCheck::tcp_port(port))
        .build()
        .expect("valid spec");

    let started = Instant::now();
    let handle = harness
        .factory
        .spawn_with_timeout(spec, Duration::from_secs(2))
        .expect("daemon becomes ready");
    let waited = started.elapsed();

    assert!(waited >= Duration::from_millis(150), "ready too early: {waited:?}");
    assert!(waited < Duration::from_secs(2), "ready too late: {waited:?}");
    assert_eq!(handle.state(), ProcessState::Running);
    assert!(handle.is_running());
    assert_eq!(harness.session().active_daemons(), vec!["master-1".to_owned()]);

    handle.stop(Duration::from_secs(2)).expect("stop");
    assert_eq!(handle.state(), ProcessState::Stopped);
    assert!(harness.session().active_daemons().is_empty());
    let result = handle.result().expect("result after stop");
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(
        harness.reporter.events_for("master-1"),
        vec!["starting", "started", "ready", "stopping", "stopped"]
    );
}

#[rstest]
fn never_ready_daemon_times_out_and_is_killed(harness: Harness) {
    let port = ports::unused_local_port().expect("free port");
    let spec = sample("minion-1")
        .readiness(ReadinessCheck::tcp_port(port))
        .build()
        .expect("valid spec");

    let started = Instant::now();
    let error = harness
        .factory
        .spawn_with_timeout(spec, Duration::from_secs(1))
        .expect_err("port never opens");
    let waited = started.elapsed();

    assert!(waited >= Duration::from_secs(1), "gave up early: {waited:?}");
    assert!(waited < Duration::from_secs(4), "gave up late: {waited:?}");
    let SpawnError::Readiness(timeout) = error else {
        panic!("expected a readiness timeout, got {error:?}");
    };
    assert_eq!(timeout.daemon_id, "minion-1");
    assert_eq!(timeout.attempts, 1);
    assert_eq!(timeout.pending, vec![format!("port tcp://127.0.0.1:{port}")]);
    let pid = timeout.pid.expect("pid recorded");
    assert!(!alive(pid), "process {pid} survived a failed spawn");
    assert!(harness.session().active_daemons().is_empty());
    assert_eq!(
        harness.reporter.events_for("minion-1"),
        vec!["starting", "started", "stopping", "failed", "stopped", "attempt_failed"]
    );
}

#[rstest]
fn early_exit_fails_fast_with_output(harness: Harness) {
    let port = ports::unused_local_port().expect("free port");
    let spec = sample("syndic-1")
        .args(["--exit-after-ms", "50", "--exit-code", "3", "--stderr", "bad config"])
        .readiness(ReadinessCheck::tcp_port(port))
        .build()
        .expect("valid spec");

    let started = Instant::now();
    let error = harness
        .factory
        .spawn_with_timeout(spec, SETTLE)
        .expect_err("daemon exits");
    assert!(started.elapsed() < Duration::from_secs(5));
    let SpawnError::Exited {
        status,
        attempts,
        stderr_tail,
        ..
    } = error
    else {
        panic!("expected an early exit, got {error:?}");
    };
    assert_eq!(status.code, Some(3));
    assert_eq!(attempts, 1);
    assert!(stderr_tail.contains(&"bad config".to_owned()));
}

#[rstest]
fn failed_attempts_are_retried(harness: Harness) {
    let spec = sample("flaky")
        .args(["--exit-after-ms", "20", "--exit-code", "1"])
        .readiness(ReadinessCheck::tcp_port(ports::unused_local_port().expect("free port")))
        .max_start_attempts(3)
        .build()
        .expect("valid spec");

    let error = harness.factory.spawn(spec).expect_err("never ready");
    assert!(matches!(error, SpawnError::Exited { attempts: 3, .. }));
    let events = harness.reporter.events_for("flaky");
    assert_eq!(events.iter().filter(|event| *event == "starting").count(), 3);
    assert_eq!(events.iter().filter(|event| *event == "attempt_failed").count(), 3);
}

#[rstest]
fn missing_executable_is_not_retried(harness: Harness) {
    let spec = corral::DaemonSpec::builder("ghost", "/nonexistent/salt-master")
        .max_start_attempts(3)
        .build()
        .expect("valid spec");
    let error = harness.factory.spawn(spec).expect_err("cannot launch");
    let SpawnError::Start(start) = error else {
        panic!("expected a start error, got {error:?}");
    };
    assert!(matches!(start.reason, StartFailure::NotFound(_)));
    assert_eq!(
        harness
            .reporter
            .events_for("ghost")
            .iter()
            .filter(|event| *event == "starting")
            .count(),
        1
    );
    assert!(harness.session().active_daemons().is_empty());
}

#[rstest]
fn pid_file_readiness(harness: Harness) {
    let dir = tempfile::tempdir().expect("temp dir");
    let pidfile = dir.path().join("minion.pid");
    let spec = sample("minion-pid")
        .arg("--pidfile")
        .arg(pidfile.display().to_string())
        .readiness(ReadinessCheck::pid_file(&pidfile))
        .build()
        .expect("valid spec");
    let handle = harness.factory.spawn(spec).expect("ready");
    let written = std::fs::read_to_string(&pidfile).expect("pid file");
    assert_eq!(written.trim().parse::<u32>().ok(), handle.pid());
}

#[rstest]
fn stubborn_daemon_is_killed_after_grace(harness: Harness) {
    let dir = tempfile::tempdir().expect("temp dir");
    let spec = settled("stubborn", &dir)
        .arg("--ignore-sigterm")
        .build()
        .expect("valid spec");
    let handle = harness.factory.spawn(spec).expect("ready");
    let pid = handle.pid().expect("pid");

    let started = Instant::now();
    handle.stop(Duration::from_millis(300)).expect("forced stop");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!alive(pid));
    let result = handle.result().expect("result");
    assert_eq!(result.exit_code, None);
    assert_eq!(result.signal, Some(9));
}

#[rstest]
fn stop_is_idempotent(harness: Harness) {
    let handle = harness
        .factory
        .spawn(sample("twice").build().expect("valid spec"))
        .expect("ready");
    handle.stop(Duration::from_secs(1)).expect("first stop");
    handle.stop(Duration::from_secs(1)).expect("second stop");
    assert_eq!(handle.state(), ProcessState::Stopped);
    assert_eq!(
        harness
            .reporter
            .events_for("twice")
            .iter()
            .filter(|event| *event == "stopped")
            .count(),
        1
    );
}

#[rstest]
fn dropping_the_handle_stops_the_daemon(harness: Harness) {
    let handle = harness
        .factory
        .spawn(sample("scoped").build().expect("valid spec"))
        .expect("ready");
    let pid = handle.pid().expect("pid");
    drop(handle);
    assert!(!alive(pid));
    assert!(harness.session().active_daemons().is_empty());
}

#[rstest]
fn captured_output_is_kept(harness: Harness) {
    let dir = tempfile::tempdir().expect("temp dir");
    let handle = harness
        .factory
        .spawn(
            settled("chatty", &dir)
                .args(["--stdout", "line one", "--stdout", "line two", "--stderr", "warned"])
                .build()
                .expect("valid spec"),
        )
        .expect("ready");
    handle.stop(Duration::from_secs(2)).expect("stop");
    let result = handle.result().expect("result");
    assert_eq!(result.stdout, vec!["line one".to_owned(), "line two".to_owned()]);
    assert_eq!(result.stderr, vec!["warned".to_owned()]);
    assert_eq!(result.cmdline.first().map(String::as_str), Some(support::SAMPLE_DAEMON));
}

#[rstest]
fn duplicate_live_ids_are_rejected(harness: Harness) {
    let first = harness
        .factory
        .spawn(sample("master-1").build().expect("valid spec"))
        .expect("ready");
    let error = harness
        .factory
        .spawn(sample("master-1").build().expect("valid spec"))
        .expect_err("duplicate id");
    assert!(matches!(error, SpawnError::DuplicateId(ref id) if id == "master-1"));
    first.stop(Duration::from_secs(1)).expect("stop");

    let again = harness
        .factory
        .spawn(sample("master-1").build().expect("valid spec"))
        .expect("id free after stop");
    drop(again);
}

#[test]
fn teardown_sweeps_leaked_daemons() {
    let harness = Harness::new();
    let handle = harness
        .factory
        .spawn(sample("leaked").build().expect("valid spec"))
        .expect("ready");
    let pid = handle.pid().expect("pid");
    std::mem::forget(handle);

    let report = harness.session().teardown();
    assert_eq!(report.swept, vec!["leaked".to_owned()]);
    assert!(report.failures.is_empty());
    assert!(!alive(pid));
    assert!(harness.reporter.lines().contains(&"swept 1".to_owned()));

    let error = harness
        .factory
        .spawn(sample("late").build().expect("valid spec"))
        .expect_err("session closed");
    assert!(matches!(error, SpawnError::SessionClosed(_)));
}
