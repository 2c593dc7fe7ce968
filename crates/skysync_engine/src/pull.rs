//! Pull pipeline.
//!
//! Private and shared databases are pulled zone by zone: database changes
//! name the zones to visit, zone changes deliver full records. The public
//! database has no zone feed; notifications name the records, which are then
//! fetched by ID. Every page is applied in one sync context and saved before
//! its token is persisted, so a crash mid-pull refetches at most one page.
//!
//! Within a page, records are converted in dependency order. Types on a
//! cycle are converted again up to `longest_cycle` times; each pass can only
//! resolve references, never add new unresolved ones. References whose
//! targets have not arrived yet are carried from page to page of the same
//! partition and only count as unresolved once the partition is done.

use crate::convert::{PendingReferences, Upsert};
use crate::error::{ErrorModule, SyncError, SyncResult};
use crate::events::SyncEvent;
use crate::recovery::RecoveryAction;
use crate::shared::Shared;
use crate::state::SyncState;
use skysync_cloud::{DatabaseScope, NotificationKind, Partition, Record, RecordId, RemoteError, ZoneId};
use skysync_store::Context;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of one pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Records inserted or updated locally.
    pub applied: usize,
    /// Objects deleted because their record was deleted.
    pub deleted: usize,
    /// Zones whose local objects were purged.
    pub purged_zones: usize,
    /// Unresolved references after each conversion pass, summed over pages.
    pub pending_per_pass: Vec<usize>,
    /// References still unresolved after the last pass.
    pub unresolved: usize,
    /// Errors reported to the error sink.
    pub errors: usize,
    /// The pull stopped early because sync is paused.
    pub skipped: bool,
    /// Zones that must be provisioned.
    pub needs_provision: Vec<(DatabaseScope, ZoneId)>,
}

impl PullReport {
    fn add_passes(&mut self, passes: &[usize]) {
        if self.pending_per_pass.len() < passes.len() {
            self.pending_per_pass.resize(passes.len(), 0);
        }
        for (total, count) in self.pending_per_pass.iter_mut().zip(passes) {
            *total += count;
        }
    }
}

/// The pull side of the engine.
pub(crate) struct Puller {
    shared: Arc<Shared>,
    gate: tokio::sync::Mutex<()>,
}

impl Puller {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Pulls every configured database.
    pub(crate) async fn pull(&self) -> PullReport {
        let _guard = self.gate.lock().await;
        let shared = &self.shared;
        if let Err(e) = shared.pause.check() {
            debug!(error = %e, "pull skipped");
            return PullReport {
                skipped: true,
                ..PullReport::default()
            };
        }

        shared.set_state(SyncState::Pulling);
        shared.emit(SyncEvent::WillSyncFromCloud);
        let mut report = PullReport::default();
        for scope in shared.config.scopes.clone() {
            if shared.pause.is_paused() {
                report.skipped = true;
                break;
            }
            match scope {
                DatabaseScope::Public => self.pull_public(&mut report).await,
                _ => self.pull_database(scope, &mut report).await,
            }
        }

        shared.stats.write().records_pulled += report.applied as u64;
        info!(
            applied = report.applied,
            deleted = report.deleted,
            unresolved = report.unresolved,
            errors = report.errors,
            "pull finished"
        );
        shared.emit(SyncEvent::DidSyncFromCloud);
        shared.settle(report.errors > 0);
        report
    }

    async fn pull_database(&self, scope: DatabaseScope, report: &mut PullReport) {
        let shared = &self.shared;
        let partition = Partition::Database(scope);
        let mut retried = false;
        loop {
            let since = shared.tokens.get(&partition);
            let changes = match shared
                .remote
                .fetch_database_changes(scope, since, shared.config.pull_page_size)
                .await
            {
                Ok(changes) => changes,
                Err(RemoteError::ChangeTokenExpired) if !retried => {
                    retried = true;
                    shared.handle_remote_error(
                        &RemoteError::ChangeTokenExpired,
                        &partition,
                        ErrorModule::PullFromCloud,
                    );
                    continue;
                }
                Err(e) => {
                    self.fail(&e, &partition, report);
                    return;
                }
            };

            for zone in changes.purged_zones.iter().chain(&changes.deleted_zones) {
                match shared.purge_local(scope, zone) {
                    Ok(_) => report.purged_zones += 1,
                    Err(e) => {
                        shared.report(&e, ErrorModule::PullFromCloud);
                        report.errors += 1;
                    }
                }
            }

            let mut complete = true;
            for zone in &changes.changed_zones {
                if !self.pull_zone(scope, zone, report).await {
                    complete = false;
                }
            }
            // The database token only moves once every zone caught up.
            if !complete {
                return;
            }
            shared.tokens.set(partition.clone(), changes.token);
            self.save_tokens(report);
            if !changes.more_coming {
                return;
            }
        }
    }

    /// Pulls one zone page by page. Returns false if the zone did not catch up.
    async fn pull_zone(&self, scope: DatabaseScope, zone: &ZoneId, report: &mut PullReport) -> bool {
        let mut carried = PendingReferences::new();
        let caught_up = self.pull_zone_pages(scope, zone, &mut carried, report).await;
        self.settle(carried, report);
        caught_up
    }

    async fn pull_zone_pages(
        &self,
        scope: DatabaseScope,
        zone: &ZoneId,
        carried: &mut PendingReferences,
        report: &mut PullReport,
    ) -> bool {
        let shared = &self.shared;
        let partition = Partition::Zone(scope, zone.clone());
        let mut retried = false;
        loop {
            if shared.pause.is_paused() {
                report.skipped = true;
                return false;
            }
            let since = shared.tokens.get(&partition);
            let page = match shared
                .remote
                .fetch_zone_changes(scope, zone, since, shared.config.pull_page_size)
                .await
            {
                Ok(page) => page,
                Err(RemoteError::ChangeTokenExpired) if !retried => {
                    retried = true;
                    shared.handle_remote_error(
                        &RemoteError::ChangeTokenExpired,
                        &partition,
                        ErrorModule::PullFromCloud,
                    );
                    continue;
                }
                Err(e) => {
                    self.fail(&e, &partition, report);
                    return false;
                }
            };

            debug!(
                %partition,
                changed = page.changed.len(),
                deleted = page.deleted.len(),
                "applying zone page"
            );
            if let Err(e) = self.apply_page(scope, &page.changed, &page.deleted, carried, report) {
                shared.report(&e, ErrorModule::PullFromCloud);
                report.errors += 1;
                return false;
            }
            shared.tokens.set(partition.clone(), page.token);
            self.save_tokens(report);
            if !page.more_coming {
                return true;
            }
        }
    }

    async fn pull_public(&self, report: &mut PullReport) {
        let mut carried = PendingReferences::new();
        self.pull_public_pages(&mut carried, report).await;
        self.settle(carried, report);
    }

    async fn pull_public_pages(&self, carried: &mut PendingReferences, report: &mut PullReport) {
        let shared = &self.shared;
        let partition = Partition::Database(DatabaseScope::Public);
        let desired_keys = shared.converter.schema().desired_keys();
        let mut retried = false;
        loop {
            if shared.pause.is_paused() {
                report.skipped = true;
                return;
            }
            let since = shared.tokens.get(&partition);
            let batch = match shared
                .remote
                .fetch_notifications(since, shared.config.pull_page_size)
                .await
            {
                Ok(batch) => batch,
                Err(RemoteError::ChangeTokenExpired) if !retried => {
                    retried = true;
                    shared.handle_remote_error(
                        &RemoteError::ChangeTokenExpired,
                        &partition,
                        ErrorModule::PullFromCloud,
                    );
                    continue;
                }
                Err(e) => {
                    self.fail(&e, &partition, report);
                    return;
                }
            };

            // Only the latest notification per record matters.
            let mut latest: BTreeMap<RecordId, NotificationKind> = BTreeMap::new();
            for notification in batch.notifications {
                latest.insert(notification.record_id, notification.kind);
            }
            let (deleted, changed): (Vec<RecordId>, Vec<RecordId>) = {
                let (deleted, changed): (Vec<_>, Vec<_>) = latest
                    .into_iter()
                    .partition(|(_, kind)| *kind == NotificationKind::Deleted);
                (
                    deleted.into_iter().map(|(id, _)| id).collect(),
                    changed.into_iter().map(|(id, _)| id).collect(),
                )
            };

            let records = if changed.is_empty() {
                Vec::new()
            } else {
                match shared
                    .remote
                    .fetch_records(DatabaseScope::Public, &changed, Some(desired_keys.as_slice()))
                    .await
                {
                    Ok(records) => records,
                    Err(e) => {
                        self.fail(&e, &partition, report);
                        return;
                    }
                }
            };
            if let Err(e) = self.apply_page(DatabaseScope::Public, &records, &deleted, carried, report) {
                shared.report(&e, ErrorModule::PullFromCloud);
                report.errors += 1;
                return;
            }
            shared.tokens.set(partition.clone(), batch.token);
            self.save_tokens(report);
            if !batch.more_coming {
                return;
            }
        }
    }

    /// Applies one page of changes in a single sync context.
    ///
    /// References still missing their target stay in `carried` for the
    /// following pages.
    fn apply_page(
        &self,
        scope: DatabaseScope,
        records: &[Record],
        deleted: &[RecordId],
        carried: &mut PendingReferences,
        report: &mut PullReport,
    ) -> SyncResult<()> {
        let shared = &self.shared;
        let converter = &shared.converter;
        let graph = &shared.graph;

        let mut by_type: BTreeMap<&str, Vec<&Record>> = BTreeMap::new();
        for record in records {
            if !converter.schema().is_enabled(record.record_type()) {
                let error = SyncError::missing_service_attributes(record.record_type());
                shared.report(&error, ErrorModule::PullFromCloud);
                report.errors += 1;
                continue;
            }
            by_type.entry(record.record_type()).or_default().push(record);
        }
        let mut order: Vec<&str> = graph
            .order
            .iter()
            .map(String::as_str)
            .filter(|name| by_type.contains_key(name))
            .collect();
        for name in by_type.keys() {
            if !order.contains(name) {
                order.push(*name);
            }
        }

        let mut ctx = shared.store.new_background_context();
        let mut pending = PendingReferences::new();
        let mut passes = Vec::new();
        let mut converted = Vec::new();

        for name in &order {
            for record in by_type.get(name).into_iter().flatten() {
                match self.upsert(&mut ctx, record, scope, &mut pending, report)? {
                    Some(Upsert::Inserted(id)) | Some(Upsert::Updated(id)) => converted.push(id),
                    _ => {}
                }
            }
        }
        let applied = converted.len();
        passes.push(pending.len());

        if graph.is_cyclic() {
            for _ in 0..graph.longest_cycle {
                let mut fresh = PendingReferences::new();
                for name in order.iter().filter(|name| graph.cyclic.contains(**name)) {
                    for record in by_type.get(name).into_iter().flatten() {
                        if let Some(upsert) = self.upsert(&mut ctx, record, scope, &mut fresh, report)? {
                            pending.forget(upsert.id());
                        }
                    }
                }
                pending.append(fresh);
                passes.push(pending.len());
            }
        }
        // A record converted again replaces what earlier pages left for it.
        for id in converted {
            carried.forget(id);
        }
        carried.append(pending);
        let attached = carried.attach(&mut ctx, converter)?;

        let mut removed = 0;
        for record_id in deleted {
            for entity in converter.schema().entities() {
                if let Some(object) = converter.lookup(&ctx, &entity.name, &record_id.name)? {
                    ctx.delete(object.id())?;
                    removed += 1;
                }
            }
        }

        ctx.save()?;
        debug!(applied, removed, attached, waiting = carried.len(), ?passes, "page applied");
        report.applied += applied;
        report.deleted += removed;
        report.add_passes(&passes);
        Ok(())
    }

    /// Resolves what a partition left pending once its pages are done.
    fn settle(&self, mut carried: PendingReferences, report: &mut PullReport) {
        if carried.is_empty() {
            return;
        }
        let shared = &self.shared;
        let mut ctx = shared.store.new_background_context();
        let settled = carried
            .resolve(&mut ctx, &shared.converter)
            .and_then(|outcome| {
                ctx.save()?;
                Ok(outcome)
            });
        match settled {
            Ok(outcome) => report.unresolved += outcome.unresolved,
            Err(e) => {
                shared.report(&e, ErrorModule::PullFromCloud);
                report.errors += 1;
            }
        }
    }

    /// Converts one record. Schema errors are reported and skip the record;
    /// anything else aborts the page.
    fn upsert(
        &self,
        ctx: &mut Context,
        record: &Record,
        scope: DatabaseScope,
        pending: &mut PendingReferences,
        report: &mut PullReport,
    ) -> SyncResult<Option<Upsert>> {
        match self.shared.converter.to_entity(ctx, record, scope, pending) {
            Ok(upsert) => Ok(Some(upsert)),
            Err(e) if e.is_schema_error() => {
                self.shared.report(&e, ErrorModule::PullFromCloud);
                report.errors += 1;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn fail(&self, error: &RemoteError, partition: &Partition, report: &mut PullReport) {
        match self
            .shared
            .handle_remote_error(error, partition, ErrorModule::PullFromCloud)
        {
            RecoveryAction::Provision { scope, zone } => {
                if !report.needs_provision.contains(&(scope, zone.clone())) {
                    report.needs_provision.push((scope, zone));
                }
            }
            RecoveryAction::Pause(_) => report.skipped = true,
            RecoveryAction::Purge { .. } => report.purged_zones += 1,
            RecoveryAction::Surface => report.errors += 1,
            RecoveryAction::ResetToken(_) | RecoveryAction::Ignore => {}
        }
    }

    fn save_tokens(&self, report: &mut PullReport) {
        if let Err(e) = self.shared.save_tokens() {
            self.shared.report(&e, ErrorModule::PullFromCloud);
            report.errors += 1;
        }
    }
}

impl std::fmt::Debug for Puller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Puller").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_are_summed_per_index() {
        let mut report = PullReport::default();
        report.add_passes(&[3, 1]);
        report.add_passes(&[2, 0]);
        report.add_passes(&[1]);
        assert_eq!(report.pending_per_pass, vec![6, 1]);
    }
}
