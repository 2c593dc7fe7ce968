//! Property tests for dependency graph ordering and change-token bookkeeping.

use proptest::prelude::*;
use skysync_engine::{ChangeTokenStore, DependencyGraph};
use skysync_testkit::generators::{
    change_token_strategy, entity_names, graph_strategy, partition_strategy,
};

proptest! {
    #[test]
    fn order_is_a_permutation_respecting_edges((n, edges) in graph_strategy(8)) {
        let names = entity_names(n);
        let mut graph = DependencyGraph::new();
        for name in &names {
            graph.add_vertex(name);
        }
        for (from, to) in &edges {
            graph.add_edge(&names[*from], &names[*to]);
        }
        let order = graph.analyze();

        let mut sorted = order.order.clone();
        sorted.sort();
        let mut expected = names.clone();
        expected.sort();
        prop_assert_eq!(sorted, expected);

        prop_assert_eq!(order.cyclic.is_empty(), order.longest_cycle == 0);
        prop_assert!(order.longest_cycle <= n);
        if !order.is_cyclic() {
            let position = |name: &str| order.order.iter().position(|o| o == name).unwrap();
            for (from, to) in &edges {
                prop_assert!(position(&names[*to]) < position(&names[*from]));
            }
        }
    }

    #[test]
    fn removing_a_zone_keeps_other_cursors(
        entries in prop::collection::vec((partition_strategy(), change_token_strategy()), 1..16),
        pick in any::<prop::sample::Index>(),
    ) {
        let tokens = ChangeTokenStore::new();
        for (partition, token) in &entries {
            tokens.set(partition.clone(), Some(token.clone()));
        }
        let before = tokens.entries();
        let victim = pick.get(&entries).0.zone().cloned();

        if let Some(zone) = &victim {
            tokens.remove_zone(zone);
        }
        for (partition, token) in before {
            let removed = victim.is_some() && partition.zone() == victim.as_ref();
            prop_assert_eq!(tokens.get(&partition).is_none(), removed);
            if !removed {
                prop_assert_eq!(tokens.get(&partition), Some(token));
            }
        }
    }
}
