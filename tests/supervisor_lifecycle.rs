//! Lifecycle behaviour against the in-memory fake tool.

mod common;

use std::time::Duration;

use serde_json::json;

use common::{eventually, supervisor_with, test_config, FakeBehavior, FakeStrategy};
use toolhost::supervisor::{
    ClientTier, DiagnosticSource, EnvOverrides, ErrorKind, SupervisorError, SupervisorEvent,
    SupervisorState, ToolFacade,
};

// ─── Start ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_starts_share_one_launch() {
    let fake = FakeStrategy::new(
        ClientTier::Persistent,
        FakeBehavior {
            spawn_delay: Duration::from_millis(50),
            ..FakeBehavior::default()
        },
    );
    let (sup, _sink) = supervisor_with(test_config(), &[fake.clone()]);

    let (a, b, c) = tokio::join!(sup.start(), sup.start(), sup.start());

    assert_eq!(fake.stats.spawns(), 1);
    assert_eq!(sup.launch_count(), 1);
    for outcome in [a, b, c] {
        assert_eq!(outcome.unwrap(), ClientTier::Persistent);
    }
    assert_eq!(sup.state(), SupervisorState::Ready);
    assert!(sup.is_alive().await);
}

#[tokio::test]
async fn concurrent_failed_starts_share_one_error() {
    let fake = FakeStrategy::new(
        ClientTier::Persistent,
        FakeBehavior {
            spawn_error: true,
            spawn_delay: Duration::from_millis(20),
            ..FakeBehavior::default()
        },
    );
    let (sup, _sink) = supervisor_with(test_config(), &[fake.clone()]);

    let (a, b) = tokio::join!(sup.start(), sup.start());
    assert_eq!(fake.stats.spawns(), 1);
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert_eq!(a.to_string(), b.to_string());
    assert_eq!(a.kind(), ErrorKind::LaunchFailure);
    assert_eq!(sup.state(), SupervisorState::Failed);
    assert_eq!(sup.active_tier(), ClientTier::None);
}

#[tokio::test]
async fn start_when_ready_returns_active_tier() {
    let fake = FakeStrategy::healthy(ClientTier::Managed);
    let (sup, _sink) = supervisor_with(test_config(), &[fake.clone()]);

    assert_eq!(sup.start().await.unwrap(), ClientTier::Managed);
    assert_eq!(sup.start().await.unwrap(), ClientTier::Managed);
    assert_eq!(fake.stats.spawns(), 1);
    assert_eq!(sup.generation(), 1);
}

#[tokio::test]
async fn handshake_sends_initialized_notification() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let (sup, _sink) = supervisor_with(test_config(), &[fake.clone()]);
    sup.start().await.unwrap();

    assert!(eventually(|| fake.stats.count("notifications/initialized") == 1).await);
    assert_eq!(fake.stats.received()[0], "initialize");
    let info = sup.server_info().unwrap();
    assert_eq!(info.name.as_deref(), Some("fake-tool"));
}

// ─── Fallback ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fallback_stops_at_first_successful_tier() {
    let a = FakeStrategy::new(
        ClientTier::Persistent,
        FakeBehavior {
            handshake: false,
            ..FakeBehavior::default()
        },
    );
    let b = FakeStrategy::healthy(ClientTier::Managed);
    let c = FakeStrategy::healthy(ClientTier::Legacy);
    let (sup, sink) = supervisor_with(test_config(), &[a.clone(), b.clone(), c.clone()]);

    assert_eq!(sup.start().await.unwrap(), ClientTier::Managed);
    assert_eq!(sup.active_tier(), ClientTier::Managed);

    assert_eq!(a.stats.spawns(), 1);
    assert_eq!(b.stats.spawns(), 1);
    assert_eq!(c.stats.spawns(), 0);
    assert!(a.stats.kills() >= 1, "failed tier's process must be killed");

    let events = sink.events();
    assert!(events.iter().any(|e| matches!(
        e,
        SupervisorEvent::StrategyFailed { tier: ClientTier::Persistent, reason } if reason.contains("timed out")
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        SupervisorEvent::TierActivated { tier: ClientTier::Managed, .. }
    )));
}

#[tokio::test]
async fn exhausted_chain_reports_every_attempt() {
    let a = FakeStrategy::new(
        ClientTier::Persistent,
        FakeBehavior {
            spawn_error: true,
            ..FakeBehavior::default()
        },
    );
    let b = FakeStrategy::new(
        ClientTier::Legacy,
        FakeBehavior {
            handshake: false,
            ..FakeBehavior::default()
        },
    );
    let (sup, _sink) = supervisor_with(test_config(), &[a, b]);

    match sup.start().await {
        Err(SupervisorError::AllStrategiesFailed { attempts }) => {
            assert_eq!(attempts.len(), 2);
            assert!(attempts[0].starts_with("persistent/fake"));
            assert!(attempts[1].contains("fake tool: starting"), "stderr attached: {}", attempts[1]);
        }
        other => panic!("expected AllStrategiesFailed, got {other:?}"),
    }
    assert_eq!(sup.state(), SupervisorState::Failed);
    assert_eq!(sup.active_tier(), ClientTier::None);
    assert!(!sup.is_alive().await);
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn out_of_order_responses_reach_their_callers() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let (sup, _sink) = supervisor_with(test_config(), &[fake]);
    sup.start().await.unwrap();

    let slow = sup.request(
        "tools/call",
        Some(json!({"name": "slow", "arguments": {"ms": 150, "tag": "first"}})),
        None,
    );
    let fast = sup.request(
        "tools/call",
        Some(json!({"name": "slow", "arguments": {"ms": 10, "tag": "second"}})),
        None,
    );
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(slow.unwrap()["content"][0]["text"], "slow:first");
    assert_eq!(fast.unwrap()["content"][0]["text"], "slow:second");
    assert_eq!(sup.pending_requests(), 0);
}

#[tokio::test]
async fn request_timeout_only_fails_that_request() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let (sup, _sink) = supervisor_with(test_config(), &[fake]);
    sup.start().await.unwrap();

    let err = sup
        .request(
            "tools/call",
            Some(json!({"name": "hang", "arguments": {}})),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestTimeout);
    assert_eq!(sup.pending_requests(), 0);

    // Process and other requests are unaffected.
    assert!(sup.is_ready());
    let ok = sup
        .request("tools/call", Some(json!({"name": "ping", "arguments": {}})), None)
        .await
        .unwrap();
    assert_eq!(ok["content"][0]["text"], "ok:ping");
}

#[tokio::test]
async fn child_output_reaches_the_sink() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let (sup, sink) = supervisor_with(test_config(), &[fake]);
    sup.start().await.unwrap();

    assert!(
        eventually(|| {
            let lines = sink.lines();
            lines.iter().any(|(s, l)| *s == DiagnosticSource::Stdout && l.contains("listening"))
                && lines.iter().any(|(s, l)| *s == DiagnosticSource::Stderr && l.contains("starting"))
        })
        .await
    );
}

// ─── Stop ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_rejects_pending_and_is_idempotent() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let (sup, sink) = supervisor_with(test_config(), &[fake.clone()]);
    sup.start().await.unwrap();

    let mut pending = Vec::new();
    for _ in 0..2 {
        let sup = sup.clone();
        pending.push(tokio::spawn(async move {
            sup.request("tools/call", Some(json!({"name": "hang", "arguments": {}})), None)
                .await
        }));
    }
    assert!(eventually(|| sup.pending_requests() == 2).await);

    sup.stop().await;

    for task in pending {
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Stopping, "got {err}");
    }
    assert_eq!(fake.stats.terminations(), 1);
    assert!(!sup.is_alive().await);
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert_eq!(sup.active_tier(), ClientTier::None);

    sup.stop().await;
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert_eq!(fake.stats.terminations(), 1);

    let events = sink.events();
    assert!(events.contains(&SupervisorEvent::StateChanged {
        from: "ready",
        to: "stopping"
    }));
    assert!(events.contains(&SupervisorEvent::StateChanged {
        from: "stopping",
        to: "idle"
    }));
}

#[tokio::test]
async fn stop_kills_process_that_ignores_terminate() {
    let fake = FakeStrategy::new(
        ClientTier::Persistent,
        FakeBehavior {
            ignore_terminate: true,
            ..FakeBehavior::default()
        },
    );
    let (sup, _sink) = supervisor_with(test_config(), &[fake.clone()]);
    sup.start().await.unwrap();

    sup.stop().await;

    assert_eq!(fake.stats.terminations(), 1);
    assert!(fake.stats.kills() >= 1);
    assert!(!sup.is_alive().await);
    assert_eq!(sup.state(), SupervisorState::Idle);
}

#[tokio::test]
async fn stop_during_start_waits_then_stops() {
    let fake = FakeStrategy::new(
        ClientTier::Persistent,
        FakeBehavior {
            spawn_delay: Duration::from_millis(50),
            ..FakeBehavior::default()
        },
    );
    let (sup, _sink) = supervisor_with(test_config(), &[fake.clone()]);

    let starter = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.start().await })
    };
    assert!(eventually(|| sup.state() == SupervisorState::Starting).await);
    sup.stop().await;

    assert!(starter.await.unwrap().is_ok());
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_alive().await);
}

#[tokio::test]
async fn requests_after_stop_are_not_ready() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let (sup, _sink) = supervisor_with(test_config(), &[fake]);
    sup.start().await.unwrap();
    sup.stop().await;

    let err = sup.request("tools/list", None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);
}

// ─── Restart & Crash ─────────────────────────────────────────────────────────

#[tokio::test]
async fn restart_injects_new_credentials_and_fails_pending() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let (sup, _sink) = supervisor_with(test_config(), &[fake.clone()]);
    sup.set_overrides(EnvOverrides::new().set("ACCESS_TOKEN", "old1").set("TENANT_ID", "t1"));
    sup.start().await.unwrap();

    let hung = {
        let sup = sup.clone();
        tokio::spawn(async move {
            sup.request("tools/call", Some(json!({"name": "hang", "arguments": {}})), None)
                .await
        })
    };
    assert!(eventually(|| sup.pending_requests() == 1).await);

    let tier = sup
        .restart_with_new_credentials(EnvOverrides::new().set("ACCESS_TOKEN", "new2"))
        .await
        .unwrap();
    assert_eq!(tier, ClientTier::Persistent);

    let err = hung.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Stopping);

    assert_eq!(fake.stats.spawns(), 2);
    assert_eq!(sup.generation(), 2);
    let bundles = fake.stats.bundles.lock().unwrap().clone();
    assert_eq!(bundles[0].get("ACCESS_TOKEN"), Some("old1"));
    assert_eq!(bundles[1].get("ACCESS_TOKEN"), Some("new2"));
    assert_eq!(bundles[1].get("TENANT_ID"), Some("t1"));
}

#[tokio::test]
async fn crash_rejects_pending_and_returns_to_idle() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let (sup, sink) = supervisor_with(test_config(), &[fake.clone()]);
    sup.start().await.unwrap();

    let err = sup
        .request("tools/call", Some(json!({"name": "crash", "arguments": {}})), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProcessCrash);

    assert!(eventually(|| sup.state() == SupervisorState::Idle).await);
    assert_eq!(sup.active_tier(), ClientTier::None);
    assert!(sink
        .events()
        .iter()
        .any(|e| matches!(e, SupervisorEvent::ProcessExited { pending_rejected: 1, .. })));

    // The façade brings up a fresh process on the next call.
    let facade = ToolFacade::new(sup.clone(), &test_config());
    let result = facade.call_tool("ping", json!({})).await.unwrap();
    assert_eq!(result.result["content"][0]["text"], "ok:ping");
    assert_eq!(fake.stats.spawns(), 2);
}

#[tokio::test]
async fn missing_required_credential_is_a_configuration_error() {
    let fake = FakeStrategy::healthy(ClientTier::Persistent);
    let mut config = test_config();
    config
        .environment
        .requirements
        .push(toolhost::supervisor::environment::EnvRequirement {
            key: "TOOLHOST_TEST_REQUIRED_TOKEN".into(),
            when: None,
        });
    let (sup, _sink) = supervisor_with(config, &[fake.clone()]);

    let err = sup.start().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains("TOOLHOST_TEST_REQUIRED_TOKEN"));
    assert_eq!(fake.stats.spawns(), 0);

    sup.set_overrides(EnvOverrides::new().set("TOOLHOST_TEST_REQUIRED_TOKEN", "abc"));
    assert_eq!(sup.start().await.unwrap(), ClientTier::Persistent);
}
