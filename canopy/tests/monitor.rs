//! Peer liveness monitoring over a (k=2, N=4) tree: one-shot reports,
//! streaming idle transitions driven by the pause toggle, leaf behavior,
//! and cleanup when a subscriber disconnects without cancelling.

mod common;

use canopy::Nodeid;
use common::{launch, rpc_wait, STEP_TIMEOUT};
use serde_json::json;

#[test]
fn one_shot_monitor_reports_children() {
    let instance = launch(4, 2);

    let reply = instance.on_rank(0, |broker| {
        rpc_wait(broker, "overlay.monitor", json!({}), Nodeid::Any).expect("monitor rpc")
    });
    let children = reply["children"].as_array().expect("children array");
    assert_eq!(children.len(), 2);
    assert_eq!(
        children[0],
        json!({ "rank": 1, "connected": true, "idle": false })
    );
    assert_eq!(
        children[1],
        json!({ "rank": 2, "connected": true, "idle": false })
    );

    instance.shutdown();
}

#[test]
fn leaf_monitor_fails_with_nodata() {
    let instance = launch(4, 2);

    // Rank 3 has no children; the monitor has nothing to report.
    let err = instance.on_rank(0, |broker| {
        broker
            .rpc("overlay.monitor", None, Nodeid::Rank(3))
            .expect("send")
            .wait_within(STEP_TIMEOUT)
            .expect_err("leaf monitor has no data")
    });
    assert_eq!(err.errnum(), 61);

    instance.shutdown();
}

#[test]
fn streaming_monitor_sees_pause_transitions() {
    let instance = launch(4, 2);

    // Subscribe on rank 0 and keep the future on its thread via the remote
    // driver; every step returns the next delta.
    let initial = instance.on_rank(0, |broker| {
        let (fut, _tag) = broker
            .rpc_streaming("overlay.monitor", Some(&json!({})), Nodeid::Any)
            .expect("subscribe");
        let first = fut
            .wait_within(STEP_TIMEOUT)
            .expect("initial monitor payload");
        let initial = first.payload_json().expect("payload").clone();

        // Pause rank 1: the test-pause keepalive marks it idle immediately.
        broker
            .request_noreply("overlay.pause", None, Nodeid::Rank(1))
            .expect("pause");
        let delta = fut.wait_within(STEP_TIMEOUT).expect("idle delta");
        let idle = delta.payload_json().expect("payload").clone();

        // Unpause: drained traffic clears the idle state.
        broker
            .request_noreply("overlay.pause", None, Nodeid::Rank(1))
            .expect("unpause");
        let delta = fut.wait_within(STEP_TIMEOUT).expect("busy delta");
        let busy = delta.payload_json().expect("payload").clone();

        (initial, idle, busy)
    });

    let (initial, idle, busy) = initial;
    assert_eq!(initial["children"].as_array().map(Vec::len), Some(2));

    assert_eq!(idle["rank"], 1);
    assert_eq!(idle["connected"], true);
    assert_eq!(idle["idle"], true);
    let reason = idle["reason"].as_str().expect("reason string");
    assert!(reason.starts_with("idle for "), "reason was {reason:?}");

    assert_eq!(busy["rank"], 1);
    assert_eq!(busy["idle"], false);
    assert_eq!(busy["reason"], "no longer idle");

    instance.shutdown();
}

#[test]
fn cancel_ends_a_streaming_monitor() {
    let instance = launch(4, 2);

    let pending_before = monitor_pending(&instance, 0);
    instance.on_rank(0, |broker| {
        let (fut, tag) = broker
            .rpc_streaming("overlay.monitor", Some(&json!({})), Nodeid::Any)
            .expect("subscribe");
        fut.wait_within(STEP_TIMEOUT).expect("initial payload");
        broker
            .rpc_cancel("overlay.monitor-cancel", Nodeid::Any, tag)
            .expect("cancel");
    });
    instance.poll_rank(0, "subscription to be cancelled", move |b| {
        b.overlay().pending_monitor_count() == pending_before
    });

    instance.shutdown();
}

#[test]
fn subscriber_disconnect_cleans_up_pending_requests() {
    let instance = launch(4, 2);

    let pending_before = monitor_pending(&instance, 0);

    // Rank 1 subscribes to rank 0's monitor, then goes away without
    // cancelling.
    instance.on_rank(1, |broker| {
        let (fut, _tag) = broker
            .rpc_streaming("overlay.monitor", Some(&json!({})), Nodeid::Rank(0))
            .expect("subscribe");
        fut.wait_within(STEP_TIMEOUT).expect("initial payload");
    });
    instance.poll_rank(0, "subscription to land", move |b| {
        b.overlay().pending_monitor_count() == pending_before + 1
    });

    instance.shutdown_rank(1);
    instance.poll_rank(0, "pending count to return to baseline", move |b| {
        b.overlay().pending_monitor_count() == pending_before
    });

    instance.shutdown();
}

fn monitor_pending(instance: &common::Instance, rank: u32) -> usize {
    instance.on_rank(rank, |b| b.overlay().pending_monitor_count())
}
