//! Asset cache state machine against the in-memory cloud.

use skysync_cloud::{
    Asset, DatabaseScope, LongLivedRequest, RecordValue, RemoteCall, RemoteError, RemoteStore,
};
use skysync_engine::{CacheState, ErrorModule, RemoteStatus};
use skysync_store::ObjectId;
use skysync_testkit::prelude::*;
use std::time::Duration;

async fn settle(h: &Harness) {
    h.engine.process_local_changes().await;
    h.engine.cache().wait_idle().await;
    h.engine.process_local_changes().await;
}

fn photo(h: &Harness, caption: &str) -> ObjectId {
    h.insert("Photo", &[("caption", caption.into())])
}

#[tokio::test]
async fn new_objects_start_local() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;

    assert_eq!(h.engine.cache().state(id), Some(CacheState::Local));
    let object = h.store().get(id).unwrap();
    assert!(object.text("recordName").is_some());
    assert_eq!(h.remote_records_of("Photo").len(), 1);
}

#[tokio::test]
async fn upload_unload_download_cycle() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;
    let payload = b"pixels and more pixels".to_vec();
    let path = h.engine.cache().store_payload(id, &payload).unwrap();

    h.engine.cache().request(id, CacheState::Upload).unwrap();
    settle(&h).await;

    assert_eq!(h.engine.cache().state(id), Some(CacheState::Cached));
    assert_eq!(
        h.engine.cache().remote_status(id),
        Some(RemoteStatus::Available)
    );
    let object = h.store().get(id).unwrap();
    assert_eq!(
        object.value("uploadProgress").and_then(|v| v.as_double()),
        Some(1.0)
    );
    assert!(object.value("operationID").is_none_or(|v| v.is_null()));
    let record = h.remote_records_of("Photo").remove(0);
    assert!(matches!(record.get("asset"), Some(RecordValue::Asset(_))));
    assert_eq!(
        record.get("remoteStatus"),
        Some(&RecordValue::Text("available".into()))
    );

    h.engine.cache().request(id, CacheState::Unload).unwrap();
    h.engine.process_local_changes().await;

    assert_eq!(h.engine.cache().state(id), Some(CacheState::Remote));
    assert!(!path.exists());
    let object = h.store().get(id).unwrap();
    assert_eq!(
        object.value("uploadProgress").and_then(|v| v.as_double()),
        Some(0.0)
    );
    assert_eq!(
        object.value("downloadProgress").and_then(|v| v.as_double()),
        Some(0.0)
    );

    h.engine.cache().request(id, CacheState::Download).unwrap();
    settle(&h).await;

    assert_eq!(h.engine.cache().state(id), Some(CacheState::Cached));
    assert_eq!(std::fs::read(&path).unwrap(), payload);
    assert_eq!(h.sink.count(), 0);
}

#[tokio::test]
async fn download_waits_for_remote_availability() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;

    let other = h.another_device(photo_schema());
    other.engine.pull().await;
    let theirs = other.find_one("Photo", "caption", "Sunset").id();
    assert_eq!(other.engine.cache().state(theirs), Some(CacheState::Remote));

    other.engine.cache().request(theirs, CacheState::Download).unwrap();
    other.engine.process_local_changes().await;
    assert_eq!(other.engine.cache().active_transfers(), 0);
    assert_eq!(
        other.engine.cache().state(theirs),
        Some(CacheState::Download)
    );
    assert_eq!(other.cloud.call_count(RemoteCall::StartOperation), 0);

    h.engine.cache().store_payload(id, b"raw sensor data").unwrap();
    h.engine.cache().request(id, CacheState::Upload).unwrap();
    settle(&h).await;

    other.engine.pull().await;
    assert_eq!(
        other.engine.cache().remote_status(theirs),
        Some(RemoteStatus::Available)
    );
    settle(&other).await;

    assert_eq!(other.engine.cache().state(theirs), Some(CacheState::Cached));
    let path = other.engine.cache().payload_path(theirs).unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"raw sensor data");
}

#[tokio::test]
async fn upload_without_payload_falls_back_to_local() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;

    h.engine.cache().request(id, CacheState::Upload).unwrap();
    settle(&h).await;

    assert_eq!(h.engine.cache().state(id), Some(CacheState::Local));
    let object = h.store().get(id).unwrap();
    assert!(object.text("lastErrorMessage").is_some());
    assert_eq!(h.sink.count_for(ErrorModule::CacheToCloud), 1);
}

#[tokio::test]
async fn failed_upload_is_retried() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;
    h.engine.cache().store_payload(id, b"pixels").unwrap();
    h.cloud.inject(
        RemoteCall::StartOperation,
        RemoteError::Network("connection reset".into()),
    );

    h.engine.cache().request(id, CacheState::Upload).unwrap();
    settle(&h).await;
    assert_eq!(h.engine.cache().state(id), Some(CacheState::Local));
    assert!(h.sink.contains("connection reset"));

    let rearmed = h.engine.cache().retry_failed_uploads().unwrap();
    assert_eq!(rearmed, 1);
    settle(&h).await;

    assert_eq!(h.engine.cache().state(id), Some(CacheState::Cached));
    let object = h.store().get(id).unwrap();
    assert!(object.value("lastErrorMessage").is_none_or(|v| v.is_null()));
}

#[tokio::test]
async fn throttled_upload_pauses_without_reporting() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;
    h.engine.cache().store_payload(id, b"pixels").unwrap();
    h.cloud.inject(
        RemoteCall::StartOperation,
        RemoteError::rate_limited(Duration::from_secs(5)),
    );

    h.engine.cache().request(id, CacheState::Upload).unwrap();
    settle(&h).await;

    assert!(h.engine.pause().is_paused());
    assert_eq!(h.engine.cache().state(id), Some(CacheState::Local));
    assert_eq!(h.sink.count_for(ErrorModule::CacheToCloud), 0);
    // The message stays so the retry scan re-arms the upload.
    let object = h.store().get(id).unwrap();
    assert!(object.text("lastErrorMessage").is_some());
}

#[tokio::test]
async fn failed_download_falls_back_to_remote() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;
    h.engine.cache().store_payload(id, b"pixels").unwrap();
    h.engine.cache().request(id, CacheState::Upload).unwrap();
    settle(&h).await;
    h.engine.cache().request(id, CacheState::Unload).unwrap();
    h.engine.process_local_changes().await;
    assert_eq!(h.engine.cache().state(id), Some(CacheState::Remote));

    h.cloud.inject(
        RemoteCall::StartOperation,
        RemoteError::Network("connection reset".into()),
    );
    h.engine.cache().request(id, CacheState::Download).unwrap();
    settle(&h).await;

    assert_eq!(h.engine.cache().state(id), Some(CacheState::Remote));
    assert_eq!(h.sink.count_for(ErrorModule::CacheFromCloud), 1);
    let object = h.store().get(id).unwrap();
    assert!(object.value("operationID").is_none_or(|v| v.is_null()));
    assert_eq!(
        object.value("downloadProgress").and_then(|v| v.as_double()),
        Some(0.0)
    );
}

#[tokio::test]
async fn interrupted_upload_reattaches_on_start() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;
    let path = h.engine.cache().store_payload(id, b"pixels").unwrap();

    // A previous run started the upload and exited while it was running.
    let mut record = h.remote_records_of("Photo").remove(0).system_fields_only();
    record.set("asset", RecordValue::Asset(Asset::new(&path)));
    let operation = h
        .cloud
        .start_operation(LongLivedRequest::Upload {
            scope: DatabaseScope::Private,
            record,
        })
        .await
        .unwrap();
    let mut ctx = h.store().new_background_context();
    ctx.set(id, "cacheState", "uploading").unwrap();
    ctx.set(id, "operationID", operation.as_str()).unwrap();
    ctx.save().unwrap();
    let starts = h.cloud.call_count(RemoteCall::StartOperation);

    h.engine.start().await;
    h.engine.cache().wait_idle().await;

    assert_eq!(h.engine.cache().state(id), Some(CacheState::Cached));
    assert_eq!(h.cloud.call_count(RemoteCall::StartOperation), starts);
    let object = h.store().get(id).unwrap();
    assert!(object.value("operationID").is_none_or(|v| v.is_null()));
    let record = h.remote_records_of("Photo").remove(0);
    assert!(matches!(record.get("asset"), Some(RecordValue::Asset(_))));
}

#[tokio::test]
async fn deleting_an_object_removes_its_payload() {
    let h = Harness::new(photo_schema());
    h.create_zone();
    let id = photo(&h, "Sunset");
    h.engine.process_local_changes().await;
    let path = h.engine.cache().store_payload(id, b"pixels").unwrap();

    h.delete(id);
    h.engine.process_local_changes().await;

    assert!(!path.exists());
    assert!(h.remote_records_of("Photo").is_empty());
}
