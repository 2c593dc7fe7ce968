//! State shared by the pipelines and the cache manager.

use crate::config::SyncConfig;
use crate::convert::Converter;
use crate::error::{ErrorModule, SyncError, SyncResult};
use crate::events::{ErrorSink, SyncEvent};
use crate::graph::GraphOrder;
use crate::pause::PauseGate;
use crate::recovery::{classify, RecoveryAction};
use crate::state::{SyncState, SyncStats};
use crate::tokens::{ChangeTokenStore, KeyValueStorage};
use parking_lot::{Mutex, RwLock};
use skysync_cloud::{DatabaseScope, Partition, RemoteError, RemoteStore, ZoneId};
use skysync_store::{LocalStore, Predicate};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub(crate) struct Shared {
    pub(crate) store: LocalStore,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) converter: Converter,
    pub(crate) graph: GraphOrder,
    pub(crate) tokens: ChangeTokenStore,
    pub(crate) storage: Arc<dyn KeyValueStorage>,
    pub(crate) pause: Arc<PauseGate>,
    pub(crate) sink: Arc<dyn ErrorSink>,
    pub(crate) events: broadcast::Sender<SyncEvent>,
    pub(crate) state: RwLock<SyncState>,
    pub(crate) stats: RwLock<SyncStats>,
    /// Held while minting record identities so that two writers never give
    /// one object two record names.
    pub(crate) identity_lock: Mutex<()>,
}

impl Shared {
    pub(crate) fn emit(&self, event: SyncEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    /// Returns to a resting state after an operation.
    pub(crate) fn settle(&self, had_errors: bool) {
        let state = if self.pause.is_paused() {
            SyncState::Paused
        } else if had_errors {
            SyncState::Error
        } else {
            SyncState::Idle
        };
        self.set_state(state);
        self.stats.write().last_sync_time = Some(Instant::now());
    }

    pub(crate) fn report(&self, error: &SyncError, module: ErrorModule) {
        {
            let mut stats = self.stats.write();
            stats.errors += 1;
            stats.last_error = Some(error.to_string());
        }
        self.sink.report(error, module);
    }

    pub(crate) fn save_tokens(&self) -> SyncResult<()> {
        self.tokens
            .save(self.storage.as_ref(), &self.config.token_storage_key)
    }

    pub(crate) fn pause_for(&self, retry_after: Option<std::time::Duration>) {
        let delay = self.config.pause.delay_for(retry_after);
        self.pause.pause_for(delay);
        self.stats.write().pauses += 1;
    }

    /// Runs the local part of the recovery for a remote failure.
    ///
    /// Provisioning needs network access and is left to the caller.
    pub(crate) fn handle_remote_error(
        &self,
        error: &RemoteError,
        partition: &Partition,
        module: ErrorModule,
    ) -> RecoveryAction {
        let action = classify(error, partition, &self.config.pause);
        debug!(%partition, %module, ?action, %error, "classified remote error");
        match &action {
            RecoveryAction::Pause(delay) => {
                self.pause.pause_for(*delay);
                self.stats.write().pauses += 1;
            }
            RecoveryAction::ResetToken(partition) => {
                self.tokens.set(partition.clone(), None);
                if let Err(e) = self.save_tokens() {
                    self.report(&e, module);
                }
            }
            RecoveryAction::Purge { scope, zone } => {
                if let Err(e) = self.purge_local(*scope, zone) {
                    self.report(&e, module);
                }
            }
            RecoveryAction::Provision { .. } | RecoveryAction::Ignore => {}
            RecoveryAction::Surface => self.report(&SyncError::Remote(error.clone()), module),
        }
        action
    }

    /// Deletes every local object stored in a zone and forgets its tokens.
    pub(crate) fn purge_local(&self, scope: DatabaseScope, zone: &ZoneId) -> SyncResult<usize> {
        let mut ctx = self.store.new_background_context();
        let mut purged = 0;
        for entity in self.converter.schema().entities() {
            for object in ctx.fetch(&entity.name, &Predicate::All)? {
                let placement = match self.converter.placement(&object) {
                    Ok(Some(placement)) => placement,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(entity = %entity.name, error = %e, "undecodable system fields");
                        continue;
                    }
                };
                if placement.scope == scope
                    && &placement.record.id().zone == zone
                    && ctx.exists(object.id())
                {
                    ctx.delete(object.id())?;
                    purged += 1;
                }
            }
        }
        ctx.save()?;
        self.tokens.remove_zone(zone);
        self.save_tokens()?;
        info!(%scope, %zone, purged, "purged local objects of zone");
        Ok(purged)
    }
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("state", &*self.state.read())
            .field("tokens", &self.tokens.len())
            .field("paused", &self.pause.is_paused())
            .finish()
    }
}
