//! End-to-end runs of the reporter against the in-memory gateway.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Barrier;
use tokio::task::JoinSet;

use tally_core::gateway::{ReportingGateway, SessionFinish, SessionStart};
use tally_core::ids::SessionId;
use tally_core::TestStatus;
use tally_engine::mock::{MockGateway, MockResponse};
use tally_engine::{Reporter, ReporterOptions, SessionCoordinator};

fn reporter(mock: &Arc<MockGateway>, options: ReporterOptions) -> Reporter {
    let gateway: Arc<dyn ReportingGateway> = Arc::clone(mock) as Arc<dyn ReportingGateway>;
    Reporter::new(gateway, options).unwrap()
}

fn no_metadata() -> BTreeMap<String, String> {
    BTreeMap::new()
}

/// Three bundles overlap and finish out of order; the session is finished
/// once, after the last one.
#[tokio::test]
async fn overlapping_bundles_finalize_once() {
    let mock = Arc::new(MockGateway::new());
    let reporter = reporter(&mock, ReporterOptions::default());

    for bundle in ["b1", "b2", "b3"] {
        reporter.on_bundle_start(bundle);
    }
    for bundle in ["b1", "b2", "b3"] {
        let group = format!("{bundle}-Suite");
        reporter.on_group_start(&group, &group, None);
        reporter.on_case_start(&format!("{group}/t"), "t", &group, no_metadata());
        reporter.on_case_finish(&format!("{group}/t"), TestStatus::Passed, Vec::new());
        reporter.on_group_finish(&group, None);
    }

    reporter.on_bundle_finish("b2");
    reporter.flush().await;
    assert!(mock.session_finishes().is_empty());

    reporter.on_bundle_finish("b1");
    reporter.flush().await;
    assert!(mock.session_finishes().is_empty());
    assert!(!reporter.coordinator().is_finalized());

    reporter.on_bundle_finish("b3");
    reporter.flush().await;

    assert_eq!(mock.session_creates(), 1);
    assert_eq!(mock.session_finishes().len(), 1);
    assert!(reporter.coordinator().is_finalized());
    assert_eq!(reporter.stats().sessions_finalized, 1);
    assert_eq!(reporter.stats().items_finished, 6);
}

/// Worst result wins across groups.
#[tokio::test]
async fn session_status_is_worst_of_all_cases() {
    let mock = Arc::new(MockGateway::new());
    let reporter = reporter(&mock, ReporterOptions::default());

    reporter.on_bundle_start("app");
    for (group, result) in [
        ("X", TestStatus::Passed),
        ("Y", TestStatus::Failed),
        ("Z", TestStatus::Skipped),
    ] {
        reporter.on_group_start(group, group, None);
        let case = format!("{group}/case");
        reporter.on_case_start(&case, &format!("{group}-case"), group, no_metadata());
        reporter.on_case_finish(&case, result, Vec::new());
        reporter.on_group_finish(group, None);
    }
    reporter.on_bundle_finish("app");
    reporter.flush().await;

    let id = reporter.session_id();
    assert_eq!(mock.session_status(id.as_str()), Some(TestStatus::Failed));
    assert_eq!(
        mock.finished_items(),
        vec![
            ("X".to_string(), TestStatus::Passed),
            ("X-case".to_string(), TestStatus::Passed),
            ("Y".to_string(), TestStatus::Failed),
            ("Y-case".to_string(), TestStatus::Failed),
            ("Z".to_string(), TestStatus::Skipped),
            ("Z-case".to_string(), TestStatus::Skipped),
        ]
    );
}

/// The session already exists remotely; create reports a conflict, which
/// counts as ready, and later items still go through.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn existing_session_conflict_counts_as_ready() {
    let mock = Arc::new(MockGateway::with_existing_session("ci-launch-7"));
    let options = ReporterOptions {
        session_id: Some(SessionId::from_raw("ci-launch-7")),
        ..Default::default()
    };
    let reporter = reporter(&mock, options);

    reporter.on_bundle_start("b1");
    reporter.on_bundle_start("b2");
    reporter.on_group_start("G", "G", None);
    reporter.on_case_start("G/t", "t", "G", no_metadata());
    reporter.on_case_finish("G/t", TestStatus::Passed, Vec::new());
    reporter.on_group_finish("G", None);
    reporter.on_bundle_finish("b1");
    reporter.on_bundle_finish("b2");
    reporter.flush().await;

    assert!(reporter.coordinator().is_ready());
    assert!(reporter.coordinator().is_finalized());
    assert!(mock.session_creates() >= 1);
    assert_eq!(reporter.stats().gateway_failures, 0);
    assert_eq!(mock.session_status("ci-launch-7"), Some(TestStatus::Passed));
}

/// Two processes share one supplied session id. Both see the session as
/// ready, both report into it, and the remote session is finished once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_session_across_processes() {
    let mock = Arc::new(MockGateway::new());
    let options = ReporterOptions {
        session_id: Some(SessionId::from_raw("shared-launch")),
        ..Default::default()
    };
    let first = reporter(&mock, options.clone());
    let second = reporter(&mock, options);

    first.on_bundle_start("ios");
    second.on_bundle_start("android");
    first.on_group_start("IosSuite", "IosSuite", None);
    second.on_group_start("AndroidSuite", "AndroidSuite", None);
    first.on_case_start("IosSuite/t", "ios-t", "IosSuite", no_metadata());
    second.on_case_start("AndroidSuite/t", "android-t", "AndroidSuite", no_metadata());
    first.on_case_finish("IosSuite/t", TestStatus::Passed, Vec::new());
    second.on_case_finish("AndroidSuite/t", TestStatus::Failed, Vec::new());
    first.on_group_finish("IosSuite", None);
    second.on_group_finish("AndroidSuite", None);
    first.flush().await;
    second.flush().await;

    assert_eq!(first.session_id(), second.session_id());
    assert!(first.coordinator().is_ready());
    assert!(second.coordinator().is_ready());
    assert_eq!(mock.session_creates(), 2);
    assert_eq!(mock.created_items().len(), 4);

    first.on_bundle_finish("ios");
    first.flush().await;
    second.on_bundle_finish("android");
    second.flush().await;

    // The later finisher gets a conflict, which is still a clean finalize
    assert_eq!(
        mock.session_finishes(),
        vec![
            ("shared-launch".to_string(), TestStatus::Passed),
            ("shared-launch".to_string(), TestStatus::Failed),
        ]
    );
    assert_eq!(mock.session_status("shared-launch"), Some(TestStatus::Passed));
    assert!(first.coordinator().is_finalized());
    assert!(second.coordinator().is_finalized());
    assert_eq!(first.stats().gateway_failures + second.stats().gateway_failures, 0);
}

/// Two processes race to create one supplied session, each with many
/// concurrent callers. Callers in one process share a single create; the
/// process that loses the remote race gets a conflict and is ready anyway.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_session_creates_with_conflict_all_see_ready() {
    let mock = Arc::new(MockGateway::new());
    // Whichever process calls first finishes first; the other hits the conflict
    mock.script_session(MockResponse::delayed(Duration::from_millis(20), MockResponse::Ok));
    mock.script_session(MockResponse::delayed(Duration::from_millis(60), MockResponse::Ok));
    let processes: Vec<Arc<SessionCoordinator>> = (0..2)
        .map(|_| Arc::new(SessionCoordinator::new(Some(SessionId::from_raw("race-launch")))))
        .collect();

    let barrier = Arc::new(Barrier::new(20));
    let mut racers = JoinSet::new();
    for (process, coordinator) in processes.iter().enumerate() {
        for _ in 0..10 {
            let coordinator = Arc::clone(coordinator);
            let mock = Arc::clone(&mock);
            let barrier = Arc::clone(&barrier);
            racers.spawn(async move {
                barrier.wait().await;
                let start = SessionStart {
                    id: coordinator.get_or_create_id(),
                    name: "race".into(),
                    start_time: Utc::now(),
                    attributes: BTreeMap::new(),
                };
                let result = coordinator
                    .ensure_session_started(move || async move { mock.create_session(&start).await })
                    .await;
                (process, result, coordinator.get_or_create_id(), coordinator.try_begin_finalize())
            });
        }
    }

    let mut finalize_claims = [0usize; 2];
    while let Some(joined) = racers.join_next().await {
        let (process, result, id, claimed) = joined.unwrap();
        assert!(result.is_ok(), "racer in process {process} failed: {result:?}");
        assert_eq!(id.as_str(), "race-launch");
        if claimed {
            finalize_claims[process] += 1;
        }
    }

    assert_eq!(mock.session_creates(), 2);
    assert!(processes.iter().all(|c| c.is_ready()));
    assert_eq!(finalize_claims, [1, 1]);

    // Each process finishes once; the second finish is the conflict
    let finish = SessionFinish {
        end_time: Utc::now(),
        status: TestStatus::Passed,
    };
    let id = SessionId::from_raw("race-launch");
    assert!(mock.finish_session(&id, &finish).await.is_ok());
    assert!(mock.finish_session(&id, &finish).await.unwrap_err().is_conflict());
    assert_eq!(mock.session_finishes().len(), 2);
}

/// A slow group create outlasts the ready timeout. The case under it is
/// dropped with a registry timeout; unrelated work is reported normally.
#[tokio::test(start_paused = true)]
async fn slow_parent_times_out_dependent_case() {
    let mock = Arc::new(MockGateway::new());
    mock.script_item("Slow", MockResponse::delayed(Duration::from_secs(1), MockResponse::Ok));
    let options = ReporterOptions {
        call_timeout: Duration::from_secs(2),
        ready_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let reporter = reporter(&mock, options);

    reporter.on_bundle_start("app");
    reporter.on_group_start("Slow", "Slow", None);
    reporter.on_group_start("Fast", "Fast", None);
    reporter.on_case_start("Slow/c", "slow-case", "Slow", no_metadata());
    reporter.on_case_start("Fast/c", "fast-case", "Fast", no_metadata());
    reporter.on_case_finish("Slow/c", TestStatus::Failed, Vec::new());
    reporter.on_case_finish("Fast/c", TestStatus::Passed, Vec::new());
    reporter.on_group_finish("Slow", None);
    reporter.on_group_finish("Fast", None);
    reporter.on_bundle_finish("app");
    reporter.flush().await;

    let stats = reporter.stats();
    assert_eq!(stats.registry_timeouts, 1);
    assert!(mock.item_named("slow-case").is_none());
    assert_eq!(mock.item_named("fast-case").unwrap().status, Some(TestStatus::Passed));
    assert_eq!(mock.item_named("Fast").unwrap().status, Some(TestStatus::Passed));
    // The group itself eventually appears and is closed with its children's result
    assert_eq!(mock.item_named("Slow").unwrap().status, Some(TestStatus::Failed));
    assert_eq!(
        mock.session_status(reporter.session_id().as_str()),
        Some(TestStatus::Failed)
    );
    assert_eq!(reporter.active_operations(), 0);
}

/// Many cases across many groups, with a slow gateway, all land.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn high_fan_out_loses_nothing() {
    let mock = Arc::new(MockGateway::with_latency(Duration::from_millis(2)));
    let reporter = reporter(&mock, ReporterOptions::default());

    reporter.on_bundle_start("app");
    for g in 0..10 {
        let group = format!("G{g}");
        reporter.on_group_start(&group, &group, None);
        for c in 0..20 {
            reporter.on_case_start(&format!("{group}/{c}"), &format!("{group}-{c}"), &group, no_metadata());
        }
    }
    for g in 0..10 {
        let group = format!("G{g}");
        for c in 0..20 {
            let result = if c == 7 { TestStatus::Skipped } else { TestStatus::Passed };
            reporter.on_case_finish(&format!("{group}/{c}"), result, Vec::new());
        }
        reporter.on_group_finish(&group, None);
    }
    reporter.on_bundle_finish("app");
    reporter.flush().await;

    let stats = reporter.stats();
    assert_eq!(stats.items_created, 210);
    assert_eq!(stats.items_finished, 210);
    assert_eq!(stats.gateway_failures, 0);
    assert!(reporter.peak_operations() > 10);
    assert_eq!(
        mock.session_status(reporter.session_id().as_str()),
        Some(TestStatus::Skipped)
    );
}
