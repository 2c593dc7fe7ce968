//! Integration tests for the sync engine against the in-memory cloud.

use skysync_cloud::{DatabaseScope, Partition, RecordValue, ReferenceAction, RemoteCall};
use skysync_engine::{database_subscription_id, ChangeTokenStore, ErrorModule, PushReport, SyncEvent};
use skysync_store::Value;
use skysync_testkit::prelude::*;

fn text(value: Option<&RecordValue>) -> Option<&str> {
    match value {
        Some(RecordValue::Text(s)) => Some(s.as_str()),
        _ => None,
    }
}

// ============================================================================
// Push and provisioning
// ============================================================================

#[tokio::test]
async fn first_push_provisions_the_zone() {
    let h = Harness::new(business_schema());
    let acme = h.insert("Company", &[("name", "Acme".into())]);

    h.engine.process_local_changes().await;

    assert!(h.cloud.has_zone(DatabaseScope::Private, &Harness::zone()));
    let companies = h.remote_records_of("Company");
    assert_eq!(companies.len(), 1);
    assert_eq!(text(companies[0].get("name")), Some("Acme"));
    assert_eq!(h.engine.stats().provisions, 1);
    assert_eq!(h.cloud.call_count(RemoteCall::CreateZone), 1);
    assert_eq!(h.sink.count(), 0);

    let subscriptions = h.cloud.subscriptions(DatabaseScope::Private);
    assert!(subscriptions
        .iter()
        .any(|s| s.id == database_subscription_id(DatabaseScope::Private)));

    // The server's change tag was written back to the object.
    let object = h.store().get(acme).unwrap();
    let blob = object.bytes("privateRecordData").expect("system fields");
    let local = skysync_cloud::Record::from_system_fields(blob).unwrap();
    assert_eq!(local.id(), companies[0].id());
    assert_eq!(local.change_tag(), companies[0].change_tag());
}

#[tokio::test]
async fn push_reports_lifecycle_events() {
    let h = Harness::new(business_schema());
    h.create_zone();
    let mut events = h.engine.subscribe_events();

    h.insert("Company", &[("name", "Acme".into())]);
    let report = h.engine.process_local_changes().await;

    assert_eq!(report.saved, 1);
    assert_eq!(events.try_recv().unwrap(), SyncEvent::WillSyncToCloud);
    assert_eq!(events.try_recv().unwrap(), SyncEvent::DidSyncToCloud);
}

#[tokio::test]
async fn large_binary_travels_as_asset() {
    let h = Harness::with_config(business_schema(), |c| c.with_asset_threshold(16));
    h.create_zone();
    let logo = vec![7u8; 64];
    h.insert(
        "Company",
        &[("name", "Acme".into()), ("logo", Value::from(logo.clone()))],
    );

    h.engine.process_local_changes().await;

    let record = h.remote_records_of("Company").remove(0);
    assert!(matches!(record.get("logo"), Some(RecordValue::Asset(_))));
    let leftovers = std::fs::read_dir(&h.engine.config().temp_dir).unwrap().count();
    assert_eq!(leftovers, 0, "asset temp files are removed after the push");

    let other = h.another_device(business_schema());
    other.engine.pull().await;
    let acme = other.find_one("Company", "name", "Acme");
    assert_eq!(acme.bytes("logo").map(|b| b.to_vec()), Some(logo));
}

#[tokio::test]
async fn deleted_zone_is_provisioned_again() {
    let h = Harness::new(business_schema());
    h.create_zone();
    let acme = h.insert("Company", &[("name", "Acme".into())]);
    h.engine.process_local_changes().await;
    assert_eq!(h.engine.stats().provisions, 0);

    h.cloud.delete_zone(DatabaseScope::Private, &Harness::zone());
    h.update(acme, "name", "Acme Corp");
    h.engine.process_local_changes().await;

    assert_eq!(h.engine.stats().provisions, 1);
    let companies = h.remote_records_of("Company");
    assert_eq!(companies.len(), 1);
    assert_eq!(text(companies[0].get("name")), Some("Acme Corp"));
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn excluded_entity_is_never_pushed() {
    let h = Harness::new(business_schema());
    h.create_zone();
    assert_eq!(h.engine.sync_schema().excluded(), ["Draft".to_string()]);

    h.insert("Draft", &[("body", "not for the cloud".into())]);
    h.engine.process_local_changes().await;

    assert_eq!(h.cloud.call_count(RemoteCall::ModifyRecords), 0);
    assert!(h.remote_records().is_empty());
}

#[tokio::test]
async fn ordered_relationship_is_reported_and_skipped() {
    let h = Harness::new(ordered_schema());
    h.create_zone();
    let mut ctx = h.store().new_context();
    let playlist = ctx.insert("Playlist").unwrap();
    ctx.set(playlist, "title", "Road trip").unwrap();
    let song = ctx.insert("Song").unwrap();
    ctx.set(song, "title", "Highway").unwrap();
    ctx.add_to_many(playlist, "songs", song).unwrap();
    ctx.save().unwrap();

    let report = h.engine.process_local_changes().await;

    assert_eq!(report.errors, 1);
    assert_eq!(report.saved, 1);
    assert!(h.sink.contains("ordered to-many"));
    assert_eq!(h.sink.count_for(ErrorModule::PushToCloud), 1);
    assert_eq!(h.remote_records_of("Song").len(), 1);
    assert!(h.remote_records_of("Playlist").is_empty());
}

// ============================================================================
// Pull
// ============================================================================

#[tokio::test]
async fn pulled_changes_are_not_echoed() {
    let h = Harness::new(business_schema());
    h.insert("Company", &[("name", "Acme".into())]);
    h.engine.process_local_changes().await;

    let other = h.another_device(business_schema());
    let report = other.engine.pull().await;
    assert_eq!(report.applied, 1);
    other.find_one("Company", "name", "Acme");

    let writes = h.cloud.call_count(RemoteCall::ModifyRecords);
    let push = other.engine.process_local_changes().await;
    assert_eq!(push, PushReport::default());
    assert_eq!(h.cloud.call_count(RemoteCall::ModifyRecords), writes);

    // Nothing new remotely, so a second pull applies nothing.
    let again = other.engine.pull().await;
    assert_eq!(again.applied, 0);
    assert_eq!(other.store().count("Company"), 1);
}

#[tokio::test]
async fn related_objects_arrive_linked() {
    let h = Harness::new(business_schema());
    h.create_zone();
    let mut ctx = h.store().new_context();
    let acme = ctx.insert("Company").unwrap();
    ctx.set(acme, "name", "Acme").unwrap();
    for name in ["Ada", "Bob"] {
        let employee = ctx.insert("Employee").unwrap();
        ctx.set(employee, "name", name).unwrap();
        ctx.set_to_one(employee, "company", Some(acme)).unwrap();
        ctx.add_to_many(acme, "employees", employee).unwrap();
    }
    ctx.save().unwrap();
    h.engine.process_local_changes().await;

    let employees = h.remote_records_of("Employee");
    assert_eq!(employees.len(), 2);
    for record in &employees {
        match record.get("company") {
            Some(RecordValue::Reference(r)) => assert_eq!(r.action, ReferenceAction::DeleteSelf),
            other => panic!("expected a company reference, got {other:?}"),
        }
    }

    let other = h.another_device(business_schema());
    assert_eq!(
        other.engine.graph().order,
        vec!["Company".to_string(), "Employee".to_string()]
    );
    let report = other.engine.pull().await;
    assert_eq!(report.applied, 3);
    assert_eq!(report.unresolved, 0);
    assert_eq!(report.pending_per_pass, vec![2]);

    let company = other.find_one("Company", "name", "Acme");
    assert_eq!(company.to_many("employees").len(), 2);
    let ada = other.find_one("Employee", "name", "Ada");
    assert_eq!(ada.to_one("company"), Some(company.id()));
}

#[tokio::test]
async fn cascaded_deletes_reach_other_devices() {
    let h = Harness::new(business_schema());
    h.create_zone();
    let mut ctx = h.store().new_context();
    let acme = ctx.insert("Company").unwrap();
    ctx.set(acme, "name", "Acme").unwrap();
    for name in ["Ada", "Bob"] {
        let employee = ctx.insert("Employee").unwrap();
        ctx.set(employee, "name", name).unwrap();
        ctx.set_to_one(employee, "company", Some(acme)).unwrap();
        ctx.add_to_many(acme, "employees", employee).unwrap();
    }
    ctx.save().unwrap();
    h.engine.process_local_changes().await;

    let other = h.another_device(business_schema());
    other.engine.pull().await;
    assert_eq!(other.store().count("Employee"), 2);

    h.delete(acme);
    let push = h.engine.process_local_changes().await;
    assert_eq!(push.deleted, 3);
    assert!(h.remote_records().is_empty());

    let report = other.engine.pull().await;
    assert_eq!(report.deleted, 3);
    assert_eq!(other.store().count("Company"), 0);
    assert_eq!(other.store().count("Employee"), 0);
}

#[tokio::test]
async fn mutual_references_resolve_in_extra_passes() {
    let h = Harness::new(cyclic_schema());
    h.create_zone();
    let mut ctx = h.store().new_context();
    let author = ctx.insert("Author").unwrap();
    ctx.set(author, "name", "Le Guin").unwrap();
    let book = ctx.insert("Book").unwrap();
    ctx.set(book, "title", "The Dispossessed").unwrap();
    ctx.set_to_one(author, "favorite", Some(book)).unwrap();
    ctx.set_to_one(book, "author", Some(author)).unwrap();
    ctx.save().unwrap();
    h.engine.process_local_changes().await;

    let other = h.another_device(cyclic_schema());
    assert_eq!(other.engine.graph().longest_cycle, 2);
    let report = other.engine.pull().await;

    assert_eq!(report.pending_per_pass.len(), other.engine.graph().passes());
    assert!(report
        .pending_per_pass
        .windows(2)
        .all(|pair| pair[0] >= pair[1]));
    assert_eq!(report.pending_per_pass.last(), Some(&0));
    assert_eq!(report.unresolved, 0);

    let author = other.find_one("Author", "name", "Le Guin");
    let book = other.find_one("Book", "title", "The Dispossessed");
    assert_eq!(author.to_one("favorite"), Some(book.id()));
    assert_eq!(book.to_one("author"), Some(author.id()));
}

#[tokio::test]
async fn expired_tokens_fall_back_to_full_fetch() {
    let h = Harness::new(business_schema());
    let acme = h.insert("Company", &[("name", "Acme".into())]);
    h.engine.process_local_changes().await;

    let other = h.another_device(business_schema());
    other.engine.pull().await;
    assert_eq!(other.engine.tokens().len(), 2);

    h.cloud.expire_tokens();
    h.update(acme, "name", "Acme Corp");
    h.engine.process_local_changes().await;

    let report = other.engine.pull().await;
    assert_eq!(report.errors, 0);
    assert_eq!(other.sink.count(), 0);
    other.find_one("Company", "name", "Acme Corp");
    assert_eq!(other.store().count("Company"), 1);
    assert!(other
        .engine
        .tokens()
        .get(&Partition::Zone(DatabaseScope::Private, Harness::zone()))
        .is_some());
}

#[tokio::test]
async fn tokens_are_persisted_after_each_page() {
    let h = Harness::new(business_schema());
    for i in 0..5 {
        h.insert("Company", &[("name", format!("Company {i}").into())]);
    }
    h.engine.process_local_changes().await;

    let other = h.another_device_with(business_schema(), |c| c.with_pull_page_size(2));
    let report = other.engine.pull().await;
    assert_eq!(report.applied, 5);

    let key = &other.engine.config().token_storage_key;
    let stored = ChangeTokenStore::load(other.storage.as_ref(), key);
    assert_eq!(stored.entries(), other.engine.tokens().entries());
    assert!(!stored.is_empty());
}

#[tokio::test]
async fn references_resolve_across_pages() {
    let h = Harness::new(business_schema());
    h.create_zone();
    let mut ctx = h.store().new_context();
    let acme = ctx.insert("Company").unwrap();
    ctx.set(acme, "name", "Acme").unwrap();
    for name in ["Ada", "Bob", "Cy"] {
        let employee = ctx.insert("Employee").unwrap();
        ctx.set(employee, "name", name).unwrap();
        ctx.set_to_one(employee, "company", Some(acme)).unwrap();
        ctx.add_to_many(acme, "employees", employee).unwrap();
    }
    ctx.save().unwrap();
    h.engine.process_local_changes().await;

    // One record per page: every reference points into another page.
    let other = h.another_device_with(business_schema(), |c| c.with_pull_page_size(1));
    let report = other.engine.pull().await;

    assert_eq!(report.applied, 4);
    assert_eq!(report.unresolved, 0);
    assert_eq!(report.errors, 0);
    let company = other.find_one("Company", "name", "Acme");
    assert_eq!(company.to_many("employees").len(), 3);
    for name in ["Ada", "Bob", "Cy"] {
        let employee = other.find_one("Employee", "name", name);
        assert_eq!(employee.to_one("company"), Some(company.id()));
    }
}

#[tokio::test]
async fn stale_write_wins_over_server_version() {
    let h = Harness::new(business_schema());
    let acme = h.insert("Company", &[("name", "Acme".into())]);
    h.engine.process_local_changes().await;

    let other = h.another_device(business_schema());
    other.engine.pull().await;
    let theirs = other.find_one("Company", "name", "Acme");
    other.update(theirs.id(), "name", "Beta");
    other.engine.process_local_changes().await;

    // This device still holds the first change tag.
    h.update(acme, "name", "Gamma");
    let report = h.engine.process_local_changes().await;

    assert_eq!(report.conflicts, 1);
    assert_eq!(report.saved, 1);
    assert_eq!(h.engine.stats().conflicts_resolved, 1);
    let companies = h.remote_records_of("Company");
    assert_eq!(companies.len(), 1);
    assert_eq!(text(companies[0].get("name")), Some("Gamma"));
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn refused_record_does_not_hold_back_its_siblings() {
    let h = Harness::new(business_schema());
    let acme = h.insert("Company", &[("name", "Acme".into())]);
    h.engine.process_local_changes().await;

    // Another client removes the record this device still holds a tag for.
    let record = h.remote_records_of("Company").remove(0);
    h.cloud
        .write(DatabaseScope::Private, Vec::new(), vec![record.id().clone()])
        .unwrap();

    let mut ctx = h.store().new_context();
    ctx.set(acme, "name", "Acme Corp").unwrap();
    let beta = ctx.insert("Company").unwrap();
    ctx.set(beta, "name", "Beta").unwrap();
    ctx.save().unwrap();
    let report = h.engine.process_local_changes().await;

    assert_eq!(report.saved, 1);
    assert_eq!(report.errors, 1);
    assert_eq!(h.sink.count_for(ErrorModule::PushToCloud), 1);
    let names: Vec<_> = h
        .remote_records_of("Company")
        .iter()
        .filter_map(|r| text(r.get("name")).map(str::to_string))
        .collect();
    assert_eq!(names, vec!["Beta".to_string()]);
}

#[tokio::test]
async fn purged_zone_clears_local_data_without_reupload() {
    let h = Harness::new(business_schema());
    h.insert("Company", &[("name", "Acme".into())]);
    h.engine.process_local_changes().await;
    let writes = h.cloud.call_count(RemoteCall::ModifyRecords);

    h.cloud.purge_zone(DatabaseScope::Private, &Harness::zone());
    let report = h.engine.pull().await;

    assert_eq!(report.purged_zones, 1);
    assert_eq!(h.store().count("Company"), 0);
    h.engine.process_local_changes().await;
    assert_eq!(h.cloud.call_count(RemoteCall::ModifyRecords), writes);
    assert_eq!(h.cloud.call_count(RemoteCall::CreateZone), 1);
}

#[tokio::test]
async fn public_records_arrive_through_notifications() {
    let h = Harness::new(public_schema());
    let other = h.another_device_with(public_schema(), |c| {
        c.with_scopes([DatabaseScope::Public])
    });

    let post = h.insert("Post", &[("title", "Hello".into())]);
    let push = h.engine.process_local_changes().await;
    assert_eq!(push.saved, 1);

    let report = other.engine.pull().await;
    assert_eq!(report.applied, 1);
    other.find_one("Post", "title", "Hello");
    assert!(other.cloud.call_count(RemoteCall::FetchNotifications) >= 1);
    assert_eq!(other.cloud.call_count(RemoteCall::FetchDatabaseChanges), 0);

    h.delete(post);
    h.engine.process_local_changes().await;
    let report = other.engine.pull().await;
    assert_eq!(report.deleted, 1);
    assert_eq!(other.store().count("Post"), 0);
}
