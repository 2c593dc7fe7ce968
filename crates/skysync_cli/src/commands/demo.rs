//! Demo command implementation.
//!
//! Two devices share an in-memory cloud. The first creates notes and pushes
//! them, the second pulls them.

use serde::Serialize;
use skysync_cloud::{DatabaseScope, MemoryCloud, RemoteStore};
use skysync_engine::{SyncConfig, SyncEngine};
use skysync_store::{AttributeDescriptor, AttributeType, EntityDescriptor, LocalStore, Schema};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Outcome of the demo round trip.
#[derive(Debug, Serialize)]
pub struct DemoResult {
    /// Notes created on the first device.
    pub created: usize,
    /// Records saved remotely.
    pub pushed: usize,
    /// Zones provisioned on the way.
    pub provisioned: u64,
    /// Records stored in the cloud.
    pub remote_records: usize,
    /// Records applied on the second device.
    pub pulled: usize,
    /// Change tokens held by the second device.
    pub tokens: usize,
    /// Titles as seen by the second device.
    pub titles: Vec<String>,
}

fn schema() -> Schema {
    Schema::new().with_entity(
        EntityDescriptor::new("Note")
            .with_attribute(AttributeDescriptor::new("recordName", AttributeType::Text))
            .with_attribute(AttributeDescriptor::new("ownerName", AttributeType::Text))
            .with_attribute(AttributeDescriptor::new(
                "privateRecordData",
                AttributeType::Bytes,
            ))
            .with_attribute(AttributeDescriptor::new("title", AttributeType::Text)),
    )
}

fn device(
    cloud: &Arc<MemoryCloud>,
    dir: &Path,
) -> Result<SyncEngine, Box<dyn std::error::Error>> {
    let store = LocalStore::new(schema())?;
    let remote: Arc<dyn RemoteStore> = cloud.clone();
    let engine = SyncEngine::builder(store, remote)
        .with_config(SyncConfig::new("Demo").with_data_dir(dir))
        .build()?;
    Ok(engine)
}

/// Runs the demo command.
pub fn run(notes: usize, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(round_trip(notes))?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Creates `notes` notes on one device and pulls them on another.
pub async fn round_trip(notes: usize) -> Result<DemoResult, Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let cloud = Arc::new(MemoryCloud::with_asset_dir(dir.path().join("cloud")));
    let first = device(&cloud, &dir.path().join("first"))?;
    let second = device(&cloud, &dir.path().join("second"))?;

    let mut ctx = first.store().new_context();
    for i in 1..=notes {
        let id = ctx.insert("Note")?;
        ctx.set(id, "title", format!("Note {i}"))?;
    }
    ctx.save()?;
    info!(notes, "created notes on the first device");

    let push = first.process_local_changes().await;
    let pull = second.pull().await;

    let mut titles: Vec<String> = second
        .store()
        .fetch("Note", &skysync_store::Predicate::All)?
        .iter()
        .filter_map(|note| note.text("title").map(str::to_string))
        .collect();
    titles.sort();

    Ok(DemoResult {
        created: notes,
        pushed: push.saved,
        provisioned: first.stats().provisions,
        remote_records: cloud
            .records(DatabaseScope::Private, &first.config().zone())
            .len(),
        pulled: pull.applied,
        tokens: second.tokens().len(),
        titles,
    })
}

fn print_text_output(result: &DemoResult) {
    println!("Demo Round Trip");
    println!("===============");
    println!();
    println!("Created:         {}", result.created);
    println!("Pushed:          {}", result.pushed);
    println!("Provisioned:     {}", result.provisioned);
    println!("Remote records:  {}", result.remote_records);
    println!("Pulled:          {}", result.pulled);
    println!("Tokens:          {}", result.tokens);
    println!();
    for title in &result.titles {
        println!("  {title}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notes_reach_the_second_device() {
        let result = round_trip(3).await.unwrap();
        assert_eq!(result.pushed, 3);
        assert_eq!(result.provisioned, 1);
        assert_eq!(result.remote_records, 3);
        assert_eq!(result.pulled, 3);
        assert_eq!(result.tokens, 2);
        assert_eq!(result.titles, vec!["Note 1", "Note 2", "Note 3"]);
    }
}
