//! Throttling: the pause gate, deferred work and the re-drive on resume.

use skysync_cloud::{RemoteCall, RemoteError};
use skysync_engine::SyncState;
use skysync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn rate_limit_defers_work_until_resume() {
    let h = Harness::new(business_schema());
    h.create_zone();
    h.cloud.inject(
        RemoteCall::ModifyRecords,
        RemoteError::rate_limited(Duration::from_secs(30)),
    );

    h.insert("Company", &[("name", "Acme".into())]);
    let report = h.engine.process_local_changes().await;
    assert!(report.deferred);
    assert!(h.engine.pause().is_paused());
    assert!(h.engine.has_deferred_changes());
    assert_eq!(h.engine.state(), SyncState::Paused);
    assert_eq!(h.engine.stats().pauses, 1);
    assert_eq!(h.sink.count(), 0);

    // While paused nothing reaches the network.
    let calls = h.cloud.total_calls();
    h.insert("Company", &[("name", "Beta".into())]);
    let report = h.engine.process_local_changes().await;
    assert!(report.deferred);
    let pull = h.engine.pull().await;
    assert!(pull.skipped);
    assert_eq!(h.cloud.total_calls(), calls);

    let task = Arc::clone(&h.engine).spawn();
    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(h.engine.pause().resume_count(), 1);
    assert!(!h.engine.has_deferred_changes());
    assert_eq!(h.cloud.call_count(RemoteCall::ModifyRecords), 2);
    assert_eq!(h.cloud.call_count(RemoteCall::FetchDatabaseChanges), 1);
    let mut names: Vec<String> = h
        .remote_records_of("Company")
        .iter()
        .filter_map(|r| match r.get("name") {
            Some(skysync_cloud::RecordValue::Text(name)) => Some(name.clone()),
            _ => None,
        })
        .collect();
    names.sort();
    assert_eq!(names, vec!["Acme".to_string(), "Beta".to_string()]);

    // One resume, one re-drive.
    let calls = h.cloud.total_calls();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.cloud.total_calls(), calls);
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn provisioning_waits_for_the_pause() {
    let h = Harness::new(business_schema());
    h.cloud.inject(
        RemoteCall::CreateZone,
        RemoteError::rate_limited(Duration::from_secs(10)),
    );

    h.insert("Company", &[("name", "Acme".into())]);
    let report = h.engine.process_local_changes().await;
    assert!(report.deferred);
    assert_eq!(h.cloud.call_count(RemoteCall::CreateZone), 1);
    assert!(h.remote_records().is_empty());

    tokio::time::sleep(Duration::from_secs(11)).await;
    let resumed = h.engine.resume().await;
    assert_eq!(resumed.pull.errors, 0);

    assert_eq!(h.cloud.call_count(RemoteCall::CreateZone), 2);
    assert_eq!(h.engine.stats().provisions, 1);
    assert_eq!(h.remote_records_of("Company").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn service_unavailable_without_hint_uses_default_delay() {
    let h = Harness::new(business_schema());
    h.create_zone();
    h.cloud.inject(
        RemoteCall::FetchDatabaseChanges,
        RemoteError::ServiceUnavailable { retry_after: None },
    );

    let report = h.engine.pull().await;
    assert!(report.skipped);
    let remaining = h.engine.pause().remaining().unwrap();
    assert!(remaining <= h.engine.config().pause.default_delay);
    assert!(remaining > Duration::from_secs(29));
}
