//! Property-based test generators using proptest.

use proptest::prelude::*;
use skysync_cloud::{ChangeToken, DatabaseScope, Partition, ZoneId};

/// Strategy for record names.
pub fn record_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9][a-zA-Z0-9_-]{0,35}").expect("Invalid regex")
}

/// Strategy for zones, owned or shared by another user.
pub fn zone_strategy() -> impl Strategy<Value = ZoneId> {
    (
        prop::string::string_regex("[A-Z][a-z]{0,11}").expect("Invalid regex"),
        prop::option::of(prop::string::string_regex("_[a-f0-9]{8}").expect("Invalid regex")),
    )
        .prop_map(|(name, owner)| match owner {
            Some(owner) => ZoneId::new(name, owner),
            None => ZoneId::owned(name),
        })
}

/// Strategy for partitions of every kind.
pub fn partition_strategy() -> impl Strategy<Value = Partition> {
    prop_oneof![
        Just(DatabaseScope::Private).prop_map(Partition::Database),
        Just(DatabaseScope::Shared).prop_map(Partition::Database),
        Just(DatabaseScope::Public).prop_map(Partition::Database),
        zone_strategy().prop_map(|zone| Partition::Zone(DatabaseScope::Private, zone)),
        zone_strategy().prop_map(|zone| Partition::Zone(DatabaseScope::Shared, zone)),
    ]
}

/// Strategy for opaque change tokens.
pub fn change_token_strategy() -> impl Strategy<Value = ChangeToken> {
    prop::collection::vec(any::<u8>(), 1..32).prop_map(|bytes| ChangeToken::from_bytes(bytes))
}

/// Entity names `E0`, `E1`, ... for generated graphs.
pub fn entity_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("E{i}")).collect()
}

/// Strategy for directed graphs over up to `max_vertices` entities, as a
/// vertex count and an edge list of index pairs.
pub fn graph_strategy(max_vertices: usize) -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1..=max_vertices.max(1)).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::vec((0..n, 0..n), 0..n * 2),
        )
    })
}
