//! Zone provisioning.
//!
//! A write to a zone that was never created fails with `ZoneNotFound`. The
//! engine then creates the zone, saves the change subscriptions and uploads
//! every sync-enabled object of that zone, ignoring known change tags.

use crate::error::{ErrorModule, SyncError, SyncResult};
use crate::push::{PushReport, Pusher};
use crate::shared::Shared;
use skysync_cloud::{DatabaseScope, Partition, Subscription, SubscriptionKind, ZoneId};
use tracing::{info, warn};

/// Subscription ID for database-wide changes of a scope.
pub fn database_subscription_id(scope: DatabaseScope) -> String {
    format!("skysync.{scope}")
}

/// Subscription ID for public records of one type.
pub fn query_subscription_id(record_type: &str) -> String {
    format!("skysync.public.{record_type}")
}

/// Creates `zone`, subscribes to changes and uploads all of its objects.
pub(crate) async fn provision(
    shared: &Shared,
    pusher: &Pusher,
    scope: DatabaseScope,
    zone: &ZoneId,
) -> SyncResult<PushReport> {
    shared.pause.check()?;
    info!(%scope, %zone, "provisioning zone");
    let partition = Partition::Zone(scope, zone.clone());

    if let Err(e) = shared.remote.create_zone(scope, zone).await {
        shared.handle_remote_error(&e, &partition, ErrorModule::PushToCloud);
        return Err(e.into());
    }
    for subscription in subscriptions(shared, scope) {
        let scope = match subscription.kind {
            SubscriptionKind::Query(_) => DatabaseScope::Public,
            _ => scope,
        };
        if let Err(e) = shared.remote.save_subscription(scope, subscription).await {
            // A missing subscription only costs push wake-ups; keep going.
            warn!(%scope, error = %e, "could not save subscription");
            shared.report(&SyncError::Remote(e), ErrorModule::PushToCloud);
        }
    }

    let report = pusher.upload_all(Some((scope, zone))).await;
    shared.stats.write().provisions += 1;
    info!(%scope, %zone, saved = report.saved, "zone provisioned");
    Ok(report)
}

fn subscriptions(shared: &Shared, scope: DatabaseScope) -> Vec<Subscription> {
    let mut subscriptions = vec![Subscription {
        id: database_subscription_id(scope),
        kind: SubscriptionKind::Database,
    }];
    if shared.config.scopes.contains(&DatabaseScope::Public) {
        for entity in shared.converter.schema().entities() {
            if entity.service.private_record_data.is_none() {
                subscriptions.push(Subscription {
                    id: query_subscription_id(&entity.name),
                    kind: SubscriptionKind::Query(entity.name.clone()),
                });
            }
        }
    }
    subscriptions
}
