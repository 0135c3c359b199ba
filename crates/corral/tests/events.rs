//! Event channel behaviour against real daemons.
#![cfg(unix)]

mod support;

use std::time::Duration;

use corral::{ReadinessCheck, TagPattern};
use rstest::{fixture, rstest};

use support::{Harness, SETTLE, sample, settled};

#[fixture]
fn harness() -> Harness {
    Harness::new()
}

#[rstest]
fn handle_waits_for_a_matching_event(harness: Harness) {
    let handle = harness
        .factory
        .spawn(
            sample("minion-1")
                .args(["--emit", "job/1/progress@300", "--emit", "job/1/complete@400"])
                .forward_events(true)
                .build()
                .expect("valid spec"),
        )
        .expect("ready");

    let record = handle
        .wait_for_event("job/*/complete", SETTLE)
        .expect("completion event");
    assert_eq!(record.daemon_id, "minion-1");
    assert_eq!(record.tag, "job/1/complete");
    assert_eq!(record.data["pid"].as_u64(), handle.pid().map(u64::from));
    assert_eq!(handle.events_since_start("job/1/*").len(), 2);
}

#[rstest]
fn event_readiness_sees_events_fired_before_the_first_poll(harness: Harness) {
    let handle = harness
        .factory
        .spawn(
            sample("master-1")
                .args(["--emit", "salt/master/ready"])
                .forward_events(true)
                .readiness(ReadinessCheck::event("salt/master/ready"))
                .build()
                .expect("valid spec"),
        )
        .expect("ready on event");
    assert_eq!(handle.events_since_start("salt/master/ready").len(), 1);
}

#[rstest]
fn handle_waits_only_for_its_own_daemon(harness: Harness) {
    let noisy = harness
        .factory
        .spawn(
            sample("noisy")
                .args(["--emit", "heartbeat@100"])
                .forward_events(true)
                .build()
                .expect("valid spec"),
        )
        .expect("ready");
    let quiet = harness
        .factory
        .spawn(
            sample("quiet")
                .args(["--emit", "heartbeat@600"])
                .forward_events(true)
                .build()
                .expect("valid spec"),
        )
        .expect("ready");

    let record = quiet
        .wait_for_event("heartbeat", SETTLE)
        .expect("own heartbeat");
    assert_eq!(record.daemon_id, "quiet");
    drop(noisy);
}

#[rstest]
fn waiting_without_a_match_times_out(harness: Harness) {
    let handle = harness
        .factory
        .spawn(sample("silent").forward_events(true).build().expect("valid spec"))
        .expect("ready");
    let error = handle
        .wait_for_event("never/happens", Duration::from_millis(200))
        .expect_err("no such event");
    assert_eq!(error.pattern, "never/happens");
    assert_eq!(error.daemon_id.as_deref(), Some("silent"));
    assert!(!error.listener_closed);
}

#[rstest]
fn every_subscriber_receives_each_event(harness: Harness) {
    let events = harness.session().events();
    let first = events.subscribe(TagPattern::prefix("deploy/"));
    let second = events.subscribe("deploy/*");

    let handle = harness
        .factory
        .spawn(
            sample("deployer")
                .args(["--emit", "deploy/done@100"])
                .forward_events(true)
                .build()
                .expect("valid spec"),
        )
        .expect("ready");

    let one = events.wait_for(&first, SETTLE).expect("first subscriber");
    let two = events.wait_for(&second, SETTLE).expect("second subscriber");
    assert_eq!(one, two);
    assert_eq!(one.daemon_id, "deployer");
    drop(handle);
}

#[rstest]
fn stopping_daemon_can_still_publish(harness: Harness) {
    let dir = tempfile::tempdir().expect("temp dir");
    let handle = harness
        .factory
        .spawn(
            settled("graceful", &dir)
                .forward_events(true)
                .build()
                .expect("valid spec"),
        )
        .expect("ready");
    let subscription = handle.subscribe("sample/stopping");
    handle.stop(Duration::from_secs(2)).expect("stop");
    let record = harness
        .session()
        .events()
        .wait_for(&subscription, SETTLE)
        .expect("farewell event");
    assert_eq!(record.daemon_id, "graceful");
}

#[rstest]
fn channels_are_only_wired_when_declared(harness: Harness) {
    let events = harness.session().events();
    let subscription = events.subscribe("unwired/*");
    let handle = harness
        .factory
        .spawn(
            sample("unwired")
                .args(["--emit", "unwired/ping@50"])
                .build()
                .expect("valid spec"),
        )
        .expect("ready");
    assert!(events.wait_for(&subscription, Duration::from_millis(400)).is_err());
    assert_eq!(events.malformed_frames(), 0);
    drop(handle);
}
