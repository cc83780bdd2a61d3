//! Property-based tests of the network over random fact sets.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use proptest::prelude::*;

use oxirs_rete::{
    CountingSink, MemoryDataset, Node, NodeInterner, Quad, ReteNetwork, ReteRule, RuleId,
    TokenActivable,
};

struct World {
    interner: NodeInterner,
    graph: Node,
    subjects: Vec<Node>,
    properties: Vec<Node>,
}

fn world() -> World {
    let mut interner = NodeInterner::new();
    let graph = interner.iri("g");
    let subjects = (0..6)
        .map(|i| interner.iri(format!("n{i}")))
        .collect::<Vec<_>>();
    let properties = (0..3)
        .map(|i| interner.iri(format!("p{i}")))
        .collect::<Vec<_>>();
    World {
        interner,
        graph,
        subjects,
        properties,
    }
}

/// Raw facts as (subject, property, object) indices into the small vocab.
fn facts_strategy(max: usize) -> impl Strategy<Value = Vec<(usize, usize, usize)>> {
    prop::collection::vec((0usize..6, 0usize..3, 0usize..6), 0..max)
}

fn materialize(world: &World, raw: &[(usize, usize, usize)]) -> Vec<Quad> {
    let unique: HashSet<Quad> = raw
        .iter()
        .map(|&(s, p, o)| {
            Quad::new(
                world.subjects[s],
                world.properties[p],
                world.subjects[o],
                world.graph,
            )
        })
        .collect();
    unique.into_iter().collect()
}

/// A two-pattern join rule with a single-pattern negation, exercising the
/// join, binder and negative paths at once.
fn build_network(world: &mut World) -> (ReteNetwork, Rc<RefCell<CountingSink>>, RuleId) {
    let x = world.interner.variable("x");
    let y = world.interner.variable("y");
    let z = world.interner.variable("z");
    let mut network = ReteNetwork::new();
    let sink = Rc::new(RefCell::new(CountingSink::new()));
    let boxed: Box<dyn TokenActivable> = Box::new(sink.clone());
    let rule = network
        .add_rule(
            ReteRule::new(
                vec![
                    Quad::new(x, world.properties[0], y, world.graph),
                    Quad::new(y, world.properties[1], z, world.graph),
                ],
                vec![vec![Quad::new(x, world.properties[2], y, world.graph)]],
                boxed,
            ),
            &MemoryDataset::new(),
        )
        .unwrap();
    (network, sink, rule)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Firing a batch and then retracting it restores the exact state.
    #[test]
    fn round_trip_restores_the_network(
        base in facts_strategy(20),
        extra in facts_strategy(12),
    ) {
        let mut world = world();
        let (mut network, _sink, rule) = build_network(&mut world);

        let base = materialize(&world, &base);
        let base_set: HashSet<Quad> = base.iter().copied().collect();
        let extra: Vec<Quad> = materialize(&world, &extra)
            .into_iter()
            .filter(|fact| !base_set.contains(fact))
            .collect();

        network.fire(&base);
        let stats_before = network.stats();
        let status_before =
            serde_json::to_value(network.match_status(rule, &world.interner)).unwrap();

        network.fire(&extra);
        network.unfire(&extra);

        prop_assert_eq!(network.stats(), stats_before);
        let status_after =
            serde_json::to_value(network.match_status(rule, &world.interner)).unwrap();
        prop_assert_eq!(status_after, status_before);
    }

    /// One batched fire converges to the same state as singleton fires in
    /// the generated order.
    #[test]
    fn batched_and_singleton_fire_agree(raw in facts_strategy(20)) {
        let mut world_a = world();
        let (mut batched, sink_a, rule_a) = build_network(&mut world_a);
        let facts = materialize(&world_a, &raw);
        batched.fire(&facts);

        let mut world_b = world();
        let (mut singleton, sink_b, rule_b) = build_network(&mut world_b);
        for &fact in &facts {
            singleton.fire_fact(fact);
        }

        prop_assert_eq!(sink_a.borrow().active(), sink_b.borrow().active());
        prop_assert_eq!(batched.stats(), singleton.stats());
        let status_a = serde_json::to_value(batched.match_status(rule_a, &world_a.interner)).unwrap();
        let status_b =
            serde_json::to_value(singleton.match_status(rule_b, &world_b.interner)).unwrap();
        prop_assert_eq!(status_a, status_b);
    }

    /// Retracting facts one by one mirrors the batched retraction.
    #[test]
    fn batched_and_singleton_unfire_agree(raw in facts_strategy(16)) {
        let mut world_a = world();
        let (mut batched, _, rule_a) = build_network(&mut world_a);
        let facts = materialize(&world_a, &raw);
        batched.fire(&facts);
        batched.unfire(&facts);

        let mut world_b = world();
        let (mut singleton, _, rule_b) = build_network(&mut world_b);
        singleton.fire(&facts);
        for &fact in &facts {
            singleton.unfire_fact(fact);
        }

        prop_assert_eq!(batched.stats(), singleton.stats());
        let status_a = serde_json::to_value(batched.match_status(rule_a, &world_a.interner)).unwrap();
        let status_b =
            serde_json::to_value(singleton.match_status(rule_b, &world_b.interner)).unwrap();
        prop_assert_eq!(status_a, status_b);
        prop_assert_eq!(batched.stats().tokens, 1);
    }
}
