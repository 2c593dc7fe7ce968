//! Classification of remote failures into corrective actions.
//!
//! | Failure | Action |
//! |---|---|
//! | zone missing (owned, non-public) | provision the zone, upload everything |
//! | zone missing (shared) or purged | purge local data, no re-upload |
//! | change token expired | clear the partition's token and refetch |
//! | rate limited, unavailable, busy | close the pause gate |
//! | operation cancelled | ignore |
//! | anything else | report to the error sink |

use crate::config::PauseConfig;
use skysync_cloud::{DatabaseScope, Partition, RemoteError, ZoneId};
use std::time::Duration;

/// What the engine does about a remote failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Create the zone and its subscriptions, then upload all objects.
    Provision {
        /// Database scope.
        scope: DatabaseScope,
        /// Zone to create.
        zone: ZoneId,
    },
    /// Delete local objects of the zone and forget its tokens.
    Purge {
        /// Database scope.
        scope: DatabaseScope,
        /// Purged zone.
        zone: ZoneId,
    },
    /// Clear the partition's token so the next fetch starts over.
    ResetToken(Partition),
    /// Pause all network work.
    Pause(Duration),
    /// Benign; drop silently.
    Ignore,
    /// Report to the error sink.
    Surface,
}

impl RecoveryAction {
    /// Returns true if the engine recovers without reporting.
    pub fn is_recovered(&self) -> bool {
        !matches!(self, RecoveryAction::Surface)
    }
}

/// Classifies a remote failure that hit `partition`.
pub fn classify(error: &RemoteError, partition: &Partition, pause: &PauseConfig) -> RecoveryAction {
    let scope = partition.scope();
    match error {
        RemoteError::ZoneNotFound { zone } => {
            if zone.is_owned() && scope != DatabaseScope::Public {
                RecoveryAction::Provision {
                    scope,
                    zone: zone.clone(),
                }
            } else {
                RecoveryAction::Purge {
                    scope,
                    zone: zone.clone(),
                }
            }
        }
        RemoteError::UserDeletedZone { zone } => RecoveryAction::Purge {
            scope,
            zone: zone.clone(),
        },
        RemoteError::ChangeTokenExpired => RecoveryAction::ResetToken(partition.clone()),
        RemoteError::OperationCancelled => RecoveryAction::Ignore,
        e if e.is_throttle() => RecoveryAction::Pause(pause.delay_for(e.retry_after())),
        RemoteError::PartialFailure(items) => {
            // A zone-level failure inside a batch decides for the whole batch.
            if let Some(zonal) = items.values().find(|e| {
                matches!(
                    e,
                    RemoteError::ZoneNotFound { .. } | RemoteError::UserDeletedZone { .. }
                )
            }) {
                return classify(zonal, partition, pause);
            }
            if !items.is_empty() && items.values().all(RemoteError::is_throttle) {
                return RecoveryAction::Pause(pause.delay_for(error.retry_after()));
            }
            if !items.is_empty() && items.values().all(|e| matches!(e, RemoteError::OperationCancelled)) {
                return RecoveryAction::Ignore;
            }
            RecoveryAction::Surface
        }
        _ => RecoveryAction::Surface,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skysync_cloud::RecordId;
    use std::collections::BTreeMap;

    fn private_zone() -> Partition {
        Partition::Zone(DatabaseScope::Private, ZoneId::owned("Main"))
    }

    #[test]
    fn missing_owned_zone_is_provisioned() {
        let action = classify(
            &RemoteError::ZoneNotFound {
                zone: ZoneId::owned("Main"),
            },
            &private_zone(),
            &PauseConfig::default(),
        );
        assert_eq!(
            action,
            RecoveryAction::Provision {
                scope: DatabaseScope::Private,
                zone: ZoneId::owned("Main")
            }
        );
    }

    #[test]
    fn missing_shared_zone_is_purged() {
        let zone = ZoneId::new("Team", "someone-else");
        let action = classify(
            &RemoteError::ZoneNotFound { zone: zone.clone() },
            &Partition::Zone(DatabaseScope::Shared, zone.clone()),
            &PauseConfig::default(),
        );
        assert_eq!(
            action,
            RecoveryAction::Purge {
                scope: DatabaseScope::Shared,
                zone
            }
        );
    }

    #[test]
    fn throttles_pause_with_server_delay() {
        let pause = PauseConfig::new(Duration::from_secs(30));
        assert_eq!(
            classify(&RemoteError::rate_limited(Duration::from_secs(5)), &private_zone(), &pause),
            RecoveryAction::Pause(Duration::from_secs(5))
        );
        assert_eq!(
            classify(
                &RemoteError::ServiceUnavailable { retry_after: None },
                &private_zone(),
                &pause
            ),
            RecoveryAction::Pause(Duration::from_secs(30))
        );
    }

    #[test]
    fn partial_failures() {
        let zone = ZoneId::owned("Main");
        let mut items = BTreeMap::new();
        items.insert(
            RecordId::new("a", zone.clone()),
            RemoteError::rate_limited(Duration::from_secs(3)),
        );
        items.insert(
            RecordId::new("b", zone.clone()),
            RemoteError::rate_limited(Duration::from_secs(8)),
        );
        let pause = PauseConfig::default();
        assert_eq!(
            classify(&RemoteError::PartialFailure(items.clone()), &private_zone(), &pause),
            RecoveryAction::Pause(Duration::from_secs(8))
        );

        items.insert(
            RecordId::new("c", zone.clone()),
            RemoteError::UserDeletedZone { zone: zone.clone() },
        );
        assert!(matches!(
            classify(&RemoteError::PartialFailure(items), &private_zone(), &pause),
            RecoveryAction::Purge { .. }
        ));
    }

    #[test]
    fn other_errors() {
        let pause = PauseConfig::default();
        assert_eq!(
            classify(&RemoteError::OperationCancelled, &private_zone(), &pause),
            RecoveryAction::Ignore
        );
        assert_eq!(
            classify(&RemoteError::ChangeTokenExpired, &private_zone(), &pause),
            RecoveryAction::ResetToken(private_zone())
        );
        let surfaced = classify(&RemoteError::Network("reset".into()), &private_zone(), &pause);
        assert_eq!(surfaced, RecoveryAction::Surface);
        assert!(!surfaced.is_recovered());
    }
}
