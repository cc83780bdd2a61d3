//! The RETE network: rule compilation, fact injection and propagation.
//!
//! The network owns the alpha graph, the beta-node arena and the token pool,
//! and drives every activation synchronously: a call to [`ReteNetwork::fire`]
//! or [`ReteNetwork::add_rule`] returns only once all cascading downstream
//! effects, including output-sink notifications, have completed. The
//! structure is not safe for concurrent mutation; callers must serialize
//! mutating calls through a single writer.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, trace};

use crate::alpha::{AlphaGraph, AlphaId};
use crate::beta::{
    BetaMemory, BetaNode, BetaNodeId, JoinNode, NccEntryNode, NccExitNode, NccTokenData,
    NegativeJoinNode, OutputNode,
};
use crate::joins::{self, Binder, JoinMatch, JoinTest};
use crate::model::{check_pattern, Node, NodeInterner, PatternError, Quad, QuadField};
use crate::status::{MatchStatus, MatchStatusStep};
use crate::store::{Changeset, FactStore};
use crate::token::{TokenActivable, TokenId, TokenPool};

/// Identifier of a compiled rule.
pub type RuleId = usize;

/// A rule to compile into the network: ordered positive patterns, negative
/// conjunctions, and the sink notified of full matches and unmatches.
pub struct ReteRule {
    pub positives: Vec<Quad>,
    pub negatives: Vec<Vec<Quad>>,
    pub output: Box<dyn TokenActivable>,
}

impl ReteRule {
    pub fn new(
        positives: Vec<Quad>,
        negatives: Vec<Vec<Quad>>,
        output: Box<dyn TokenActivable>,
    ) -> Self {
        Self {
            positives,
            negatives,
            output,
        }
    }
}

/// Compiled form of one pattern: the tests to run against the upstream
/// token and the binders extracting new variables.
#[derive(Debug, Default, Clone)]
struct JoinData {
    tests: Vec<JoinTest>,
    binders: Vec<Binder>,
}

/// Classifies each field of a pattern against the variables bound so far.
///
/// A variable bound by an earlier pattern yields a bound test; a variable
/// already seen in an earlier field of this same pattern yields an unbound
/// (intra-fact) test; a fresh variable yields a binder and joins the bound
/// set once the pattern is done.
fn join_data_for(pattern: &Quad, bound: &mut Vec<Node>) -> JoinData {
    let mut data = JoinData::default();
    let mut local: Vec<(Node, QuadField)> = Vec::new();
    for field in QuadField::ALL {
        let node = pattern.field(field);
        if !node.is_variable() {
            continue;
        }
        if bound.contains(&node) {
            data.tests.push(JoinTest::Bound {
                variable: node,
                field,
            });
        } else if let Some(&(_, first)) = local.iter().find(|(v, _)| *v == node) {
            data.tests.push(JoinTest::Unbound {
                left: first,
                right: field,
            });
        } else {
            data.binders.push(Binder {
                variable: node,
                field,
            });
            local.push((node, field));
        }
    }
    bound.extend(local.iter().map(|(v, _)| *v));
    data
}

/// The compiled shape of one rule, kept for status reporting and removal.
struct RuleData {
    positives: Vec<Quad>,
    positive_joins: Vec<BetaNodeId>,
    /// Negative-side nodes in creation order: a lone negative join per
    /// single-pattern condition; entry, joins, exit per conjunction.
    negative_nodes: Vec<BetaNodeId>,
    output: BetaNodeId,
    attach_point: BetaNodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Memory,
    Join,
    Negative,
    NccEntry,
    NccExit,
    Output,
}

/// Counts of the network's live structures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReteStats {
    pub rules: usize,
    pub alpha_memories: usize,
    pub alpha_facts: usize,
    pub beta_memories: usize,
    pub join_nodes: usize,
    pub negative_nodes: usize,
    pub ncc_nodes: usize,
    pub tokens: usize,
}

impl fmt::Display for ReteStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rules: {}, α: {} ({} facts), β: {} memories, {} joins, {} negatives, {} ncc, tokens: {}",
            self.rules,
            self.alpha_memories,
            self.alpha_facts,
            self.beta_memories,
            self.join_nodes,
            self.negative_nodes,
            self.ncc_nodes,
            self.tokens
        )
    }
}

/// An incremental RETE network over quads.
pub struct ReteNetwork {
    alpha: AlphaGraph,
    nodes: HashMap<BetaNodeId, BetaNode>,
    next_node: BetaNodeId,
    tokens: TokenPool,
    root: BetaNodeId,
    rules: HashMap<RuleId, RuleData>,
    next_rule: RuleId,
    /// Tokens retracted during the current operation, released at its end so
    /// sinks can still read their bindings while the cascade unwinds.
    graveyard: Vec<TokenId>,
}

impl ReteNetwork {
    /// Creates an empty network with its root beta memory.
    pub fn new() -> Self {
        let tokens = TokenPool::new();
        let root_token = tokens.root();
        let mut network = Self {
            alpha: AlphaGraph::new(),
            nodes: HashMap::new(),
            next_node: 0,
            tokens,
            root: 0,
            rules: HashMap::new(),
            next_rule: 0,
            graveyard: Vec::new(),
        };
        network.root = network.create_node(BetaNode::Memory(BetaMemory::with_root(root_token)));
        network
    }

    /// The token pool, for reading bindings of tokens delivered to sinks.
    pub fn tokens(&self) -> &TokenPool {
        &self.tokens
    }

    /// Number of compiled rules.
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn contains_rule(&self, rule: RuleId) -> bool {
        self.rules.contains_key(&rule)
    }

    /// Counts the network's live structures.
    pub fn stats(&self) -> ReteStats {
        let mut stats = ReteStats {
            rules: self.rules.len(),
            alpha_memories: self.alpha.len(),
            alpha_facts: 0,
            beta_memories: 0,
            join_nodes: 0,
            negative_nodes: 0,
            ncc_nodes: 0,
            tokens: self.tokens.len(),
        };
        for node in self.nodes.values() {
            match node {
                BetaNode::Memory(_) => stats.beta_memories += 1,
                BetaNode::Join(_) => stats.join_nodes += 1,
                BetaNode::Negative(_) => stats.negative_nodes += 1,
                BetaNode::NccEntry(_) | BetaNode::NccExit(_) => stats.ncc_nodes += 1,
                BetaNode::Output(_) => {}
            }
        }
        stats
    }

    // ------------------------------------------------------------------
    // fact injection
    // ------------------------------------------------------------------

    /// Injects a changeset: retractions first, then additions.
    pub fn inject(&mut self, changeset: &Changeset) {
        self.unfire(&changeset.removed);
        self.fire(&changeset.added);
    }

    /// Fires a batch of facts into the network. Facts are grouped per alpha
    /// memory so each memory sees one batched event; facts a memory already
    /// holds do not propagate again.
    pub fn fire(&mut self, facts: &[Quad]) {
        if facts.is_empty() {
            return;
        }
        trace!(count = facts.len(), "firing facts");
        let dispatch = self.alpha.build_dispatch(facts);
        for (memory, batch) in dispatch {
            let fresh: Vec<Quad> = batch
                .into_iter()
                .filter(|fact| self.alpha.insert_fact(memory, *fact))
                .collect();
            if fresh.is_empty() {
                continue;
            }
            let children = self.alpha.memory(memory).children().to_vec();
            for child in children {
                self.activate_facts(child, fresh.clone());
            }
        }
        self.collect_garbage();
    }

    /// Fires a single fact.
    pub fn fire_fact(&mut self, fact: Quad) {
        self.fire(std::slice::from_ref(&fact));
    }

    /// Retracts a batch of facts from the network.
    pub fn unfire(&mut self, facts: &[Quad]) {
        if facts.is_empty() {
            return;
        }
        trace!(count = facts.len(), "unfiring facts");
        let dispatch = self.alpha.build_dispatch(facts);
        for (memory, batch) in dispatch {
            let removed: Vec<Quad> = batch
                .into_iter()
                .filter(|fact| self.alpha.remove_fact(memory, fact))
                .collect();
            if removed.is_empty() {
                continue;
            }
            let children = self.alpha.memory(memory).children().to_vec();
            for child in children {
                self.deactivate_facts(child, removed.clone());
            }
        }
        self.collect_garbage();
    }

    /// Retracts a single fact.
    pub fn unfire_fact(&mut self, fact: Quad) {
        self.unfire(std::slice::from_ref(&fact));
    }

    // ------------------------------------------------------------------
    // rule compilation
    // ------------------------------------------------------------------

    /// Compiles a rule into the network, reusing shared alpha memories and
    /// join nodes, and replays pre-existing matches into the new parts so
    /// the sink immediately observes the current state.
    pub fn add_rule(
        &mut self,
        rule: ReteRule,
        store: &dyn FactStore,
    ) -> Result<RuleId, PatternError> {
        let ReteRule {
            positives,
            negatives,
            output,
        } = rule;
        for pattern in positives.iter().chain(negatives.iter().flatten()) {
            check_pattern(pattern)?;
        }

        // classify all pattern fields in one incremental-binding scan;
        // each negative conjunction scans against its own copy of the
        // bound set so its variables never leak into the positive chain
        let mut bound: Vec<Node> = Vec::new();
        let positive_data: Vec<JoinData> = positives
            .iter()
            .map(|p| join_data_for(p, &mut bound))
            .collect();
        let negative_data: Vec<Vec<JoinData>> = negatives
            .iter()
            .map(|conjunction| {
                let mut scope = bound.clone();
                conjunction
                    .iter()
                    .map(|p| join_data_for(p, &mut scope))
                    .collect()
            })
            .collect();

        let rule_id = self.next_rule;
        self.next_rule += 1;
        info!(
            rule = rule_id,
            positives = positives.len(),
            negatives = negatives.len(),
            "adding rule"
        );

        // the first node created for this rule; everything below it is new
        // as well, so replaying the upstream tokens into it at the end
        // surfaces all pre-existing matches exactly once
        let mut replay: Option<(BetaNodeId, BetaNodeId)> = None;
        let mut positive_joins = Vec::with_capacity(positives.len());
        let mut beta = self.root;

        for (pattern, data) in positives.iter().zip(&positive_data) {
            let alpha = self.alpha.resolve(pattern, store);
            let join_id = match self.find_shared_join(beta, alpha, &data.tests) {
                Some(id) => {
                    let child = {
                        let Some(BetaNode::Join(join)) = self.nodes.get_mut(&id) else {
                            unreachable!("shared node {id} is a join");
                        };
                        join.ref_count += 1;
                        join.child
                    };
                    debug!(node = id, "sharing join node");
                    // the sharing rule may bind variables here that the
                    // original rule did not
                    let Some(BetaNode::Memory(memory)) = self.nodes.get_mut(&child) else {
                        unreachable!("join child {child} is a memory");
                    };
                    memory.add_binders(&mut self.tokens, &data.binders);
                    id
                }
                None => {
                    let child =
                        self.create_node(BetaNode::Memory(BetaMemory::new(data.binders.clone())));
                    let id = self.create_node(BetaNode::Join(JoinNode {
                        alpha,
                        beta,
                        tests: data.tests.clone(),
                        child,
                        ref_count: 1,
                    }));
                    self.alpha.add_child(alpha, id);
                    self.attach_child(beta, id);
                    replay.get_or_insert((id, beta));
                    debug!(node = id, "created join node");
                    id
                }
            };
            positive_joins.push(join_id);
            beta = match self.node(join_id) {
                BetaNode::Join(join) => join.child,
                _ => unreachable!(),
            };
        }

        // chain the negative conditions below the positive network
        let mut last = beta;
        let mut negative_nodes = Vec::new();
        for (conjunction, datas) in negatives.iter().zip(&negative_data) {
            if conjunction.len() == 1 {
                let alpha = self.alpha.resolve(&conjunction[0], store);
                let id = self.create_node(BetaNode::Negative(NegativeJoinNode {
                    alpha,
                    beta: last,
                    tests: datas[0].tests.clone(),
                    child: None,
                    matches: HashMap::new(),
                }));
                self.alpha.add_child(alpha, id);
                self.attach_child(last, id);
                replay.get_or_insert((id, last));
                negative_nodes.push(id);
                last = id;
            } else {
                let exit = self.create_node(BetaNode::NccExit(NccExitNode {
                    beta: last,
                    hop: conjunction.len(),
                    in_transaction: false,
                    child: None,
                    token_data: HashMap::new(),
                }));
                let entry = self.create_node(BetaNode::NccEntry(NccEntryNode {
                    beta: last,
                    exit,
                    child: None,
                }));
                self.attach_child(last, entry);
                replay.get_or_insert((entry, last));
                negative_nodes.push(entry);
                let mut sub = entry;
                for (pattern, data) in conjunction.iter().zip(datas) {
                    let alpha = self.alpha.resolve(pattern, store);
                    let child =
                        self.create_node(BetaNode::Memory(BetaMemory::new(data.binders.clone())));
                    let id = self.create_node(BetaNode::Join(JoinNode {
                        alpha,
                        beta: sub,
                        tests: data.tests.clone(),
                        child,
                        ref_count: 1,
                    }));
                    self.alpha.add_child(alpha, id);
                    self.attach_child(sub, id);
                    negative_nodes.push(id);
                    sub = child;
                }
                self.attach_child(sub, exit);
                negative_nodes.push(exit);
                last = exit;
            }
        }

        let output_id = self.create_node(BetaNode::Output(OutputNode { sink: output }));
        self.attach_child(last, output_id);
        let (replay_node, replay_parent) = replay.unwrap_or((output_id, last));

        self.rules.insert(
            rule_id,
            RuleData {
                positives,
                positive_joins,
                negative_nodes,
                output: output_id,
                attach_point: last,
            },
        );

        // push the tokens accumulated above the first new node through it
        let upstream = self.holder_tokens(replay_parent);
        self.activate_tokens(replay_node, upstream);
        self.collect_garbage();
        Ok(rule_id)
    }

    /// Removes a compiled rule, walking its chain from the end inward and
    /// tearing down every node whose reference count reaches zero. Removing
    /// an id that is not in the network is a no-op.
    pub fn remove_rule(&mut self, rule: RuleId) {
        let Some(data) = self.rules.remove(&rule) else {
            return;
        };
        info!(rule, "removing rule");
        self.detach_child(data.attach_point, data.output);
        self.nodes.remove(&data.output);

        for &id in data.negative_nodes.iter().rev() {
            match self.kind(id) {
                NodeKind::Negative => {
                    let (alpha, beta) = match self.node(id) {
                        BetaNode::Negative(n) => (n.alpha, n.beta),
                        _ => unreachable!(),
                    };
                    self.alpha.remove_child(alpha, id);
                    self.detach_child(beta, id);
                    self.nodes.remove(&id);
                }
                NodeKind::Join => {
                    let (alpha, beta, child) = match self.node(id) {
                        BetaNode::Join(j) => (j.alpha, j.beta, j.child),
                        _ => unreachable!(),
                    };
                    self.alpha.remove_child(alpha, id);
                    self.detach_child(beta, id);
                    self.release_memory(child);
                    self.nodes.remove(&id);
                }
                NodeKind::NccEntry => {
                    let beta = match self.node(id) {
                        BetaNode::NccEntry(e) => e.beta,
                        _ => unreachable!(),
                    };
                    self.detach_child(beta, id);
                    self.nodes.remove(&id);
                }
                // the exit's parent memory is removed with its join, so
                // there is nothing to detach from
                NodeKind::NccExit => {
                    self.nodes.remove(&id);
                }
                other => unreachable!("unexpected {other:?} node in a negative chain"),
            }
        }

        for &id in data.positive_joins.iter().rev() {
            let (alpha, beta, child, remaining) = {
                let Some(BetaNode::Join(join)) = self.nodes.get_mut(&id) else {
                    unreachable!("positive chain node {id} is a join");
                };
                join.ref_count -= 1;
                (join.alpha, join.beta, join.child, join.ref_count)
            };
            if remaining == 0 {
                self.alpha.remove_child(alpha, id);
                self.detach_child(beta, id);
                self.release_memory(child);
                self.nodes.remove(&id);
                debug!(node = id, "tore down join node");
            }
        }
        self.collect_garbage();
    }

    /// Removes a set of rules.
    pub fn remove_rules(&mut self, rules: impl IntoIterator<Item = RuleId>) {
        for rule in rules {
            self.remove_rule(rule);
        }
    }

    /// Removes every rule from the network.
    pub fn remove_all_rules(&mut self) {
        let ids: Vec<RuleId> = self.rules.keys().copied().collect();
        self.remove_rules(ids);
    }

    /// Reports, per positive pattern of a rule, the bindings live after
    /// that stage. Returns an empty status for an unknown rule.
    pub fn match_status(&self, rule: RuleId, interner: &NodeInterner) -> MatchStatus {
        let mut status = MatchStatus::default();
        let Some(data) = self.rules.get(&rule) else {
            return status;
        };
        for (pattern, &join) in data.positives.iter().zip(&data.positive_joins) {
            let child = match self.node(join) {
                BetaNode::Join(j) => j.child,
                _ => unreachable!(),
            };
            let mut step = MatchStatusStep::new(pattern, interner);
            for &token in self.node(child).as_memory().tokens() {
                step.add_bindings(&self.tokens, token, interner);
            }
            step.bindings.sort();
            status.steps.push(step);
        }
        status
    }

    // ------------------------------------------------------------------
    // arena plumbing
    // ------------------------------------------------------------------

    fn create_node(&mut self, node: BetaNode) -> BetaNodeId {
        let id = self.next_node;
        self.next_node += 1;
        self.nodes.insert(id, node);
        id
    }

    fn node(&self, id: BetaNodeId) -> &BetaNode {
        self.nodes
            .get(&id)
            .unwrap_or_else(|| panic!("beta node {id} is not alive"))
    }

    fn kind(&self, id: BetaNodeId) -> NodeKind {
        match self.node(id) {
            BetaNode::Memory(_) => NodeKind::Memory,
            BetaNode::Join(_) => NodeKind::Join,
            BetaNode::Negative(_) => NodeKind::Negative,
            BetaNode::NccEntry(_) => NodeKind::NccEntry,
            BetaNode::NccExit(_) => NodeKind::NccExit,
            BetaNode::Output(_) => NodeKind::Output,
        }
    }

    /// Finds a join node under the given memory matching the alpha memory
    /// and test set, for sharing between rules.
    fn find_shared_join(
        &self,
        beta: BetaNodeId,
        alpha: AlphaId,
        tests: &[JoinTest],
    ) -> Option<BetaNodeId> {
        let BetaNode::Memory(memory) = self.node(beta) else {
            return None;
        };
        memory.children().iter().copied().find(|&id| {
            matches!(self.node(id), BetaNode::Join(join) if join.matches(alpha, tests))
        })
    }

    /// Registers a node as the downstream child of a token holder.
    fn attach_child(&mut self, holder: BetaNodeId, child: BetaNodeId) {
        match self
            .nodes
            .get_mut(&holder)
            .unwrap_or_else(|| panic!("beta node {holder} is not alive"))
        {
            BetaNode::Memory(m) => m.add_child(child),
            BetaNode::Negative(n) => {
                assert!(n.child.is_none(), "negative join node already has a child");
                n.child = Some(child);
            }
            BetaNode::NccEntry(e) => {
                assert!(e.child.is_none(), "NCC entry node already has a child");
                e.child = Some(child);
            }
            BetaNode::NccExit(x) => {
                assert!(x.child.is_none(), "NCC exit node already has a child");
                x.child = Some(child);
            }
            other => panic!("cannot attach a child to {other:?}"),
        }
    }

    fn detach_child(&mut self, holder: BetaNodeId, child: BetaNodeId) {
        match self
            .nodes
            .get_mut(&holder)
            .unwrap_or_else(|| panic!("beta node {holder} is not alive"))
        {
            BetaNode::Memory(m) => m.remove_child(child),
            BetaNode::Negative(n) => {
                if n.child == Some(child) {
                    n.child = None;
                }
            }
            BetaNode::NccEntry(e) => {
                if e.child == Some(child) {
                    e.child = None;
                }
            }
            BetaNode::NccExit(x) => {
                if x.child == Some(child) {
                    x.child = None;
                }
            }
            other => panic!("cannot detach a child from {other:?}"),
        }
    }

    /// Drops a beta memory and releases its tokens. Only called once every
    /// downstream consumer of those tokens is gone.
    fn release_memory(&mut self, id: BetaNodeId) {
        let Some(BetaNode::Memory(memory)) = self.nodes.remove(&id) else {
            panic!("released node {id} is not a memory");
        };
        for &token in memory.tokens() {
            self.tokens.release(token);
        }
    }

    /// The tokens a holder node currently exposes to its children.
    fn holder_tokens(&self, node: BetaNodeId) -> Vec<TokenId> {
        match self.node(node) {
            BetaNode::Memory(m) => m.tokens().iter().copied().collect(),
            BetaNode::NccEntry(e) => self.holder_tokens(e.beta),
            BetaNode::Negative(n) => n
                .matches
                .iter()
                .filter(|(_, facts)| facts.is_empty())
                .map(|(&t, _)| t)
                .collect(),
            BetaNode::NccExit(x) => x
                .token_data
                .iter()
                .filter(|(_, data)| data.fired)
                .map(|(&t, _)| t)
                .collect(),
            other => panic!("{other:?} does not hold tokens"),
        }
    }

    fn collect_garbage(&mut self) {
        for token in std::mem::take(&mut self.graveyard) {
            self.tokens.release(token);
        }
    }

    // ------------------------------------------------------------------
    // propagation
    // ------------------------------------------------------------------

    fn activate_tokens(&mut self, node: BetaNodeId, tokens: Vec<TokenId>) {
        if tokens.is_empty() {
            return;
        }
        match self.kind(node) {
            NodeKind::Join => self.join_activate_tokens(node, tokens),
            NodeKind::Negative => self.negative_activate_tokens(node, tokens),
            NodeKind::NccEntry => self.entry_activate_tokens(node, tokens),
            NodeKind::NccExit => self.exit_activate_tokens(node, tokens),
            NodeKind::Output => self.output_activate_tokens(node, tokens),
            NodeKind::Memory => panic!("tokens cannot activate a memory directly"),
        }
    }

    fn deactivate_tokens(&mut self, node: BetaNodeId, tokens: Vec<TokenId>) {
        if tokens.is_empty() {
            return;
        }
        match self.kind(node) {
            NodeKind::Join => self.join_deactivate_tokens(node, tokens),
            NodeKind::Negative => self.negative_deactivate_tokens(node, tokens),
            NodeKind::NccEntry => self.entry_deactivate_tokens(node, tokens),
            NodeKind::NccExit => self.exit_deactivate_tokens(node, tokens),
            NodeKind::Output => self.output_deactivate_tokens(node, tokens),
            NodeKind::Memory => panic!("tokens cannot deactivate a memory directly"),
        }
    }

    fn activate_facts(&mut self, node: BetaNodeId, facts: Vec<Quad>) {
        if facts.is_empty() {
            return;
        }
        match self.kind(node) {
            NodeKind::Join => self.join_activate_facts(node, facts),
            NodeKind::Negative => self.negative_activate_facts(node, facts),
            other => panic!("facts cannot activate a {other:?} node"),
        }
    }

    fn deactivate_facts(&mut self, node: BetaNodeId, facts: Vec<Quad>) {
        if facts.is_empty() {
            return;
        }
        match self.kind(node) {
            NodeKind::Join => self.join_deactivate_facts(node, facts),
            NodeKind::Negative => self.negative_deactivate_facts(node, facts),
            other => panic!("facts cannot deactivate a {other:?} node"),
        }
    }

    // --- join nodes ---

    fn join_snapshot(&self, id: BetaNodeId) -> (AlphaId, Vec<JoinTest>, BetaNodeId, BetaNodeId) {
        match self.node(id) {
            BetaNode::Join(j) => (j.alpha, j.tests.clone(), j.beta, j.child),
            other => panic!("expected a join node, found {other:?}"),
        }
    }

    fn join_activate_tokens(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let (alpha, tests, _, child) = self.join_snapshot(id);
        let facts: Vec<Quad> = self.alpha.memory(alpha).facts().iter().copied().collect();
        if facts.is_empty() {
            return;
        }
        let couples = joins::join_couples(&self.tokens, &tests, &tokens, &facts);
        self.memory_activate_couples(child, couples);
    }

    fn join_deactivate_tokens(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let (_, _, _, child) = self.join_snapshot(id);
        self.memory_deactivate_tokens(child, tokens);
    }

    fn join_activate_facts(&mut self, id: BetaNodeId, facts: Vec<Quad>) {
        let (_, tests, beta, child) = self.join_snapshot(id);
        let tokens = self.holder_tokens(beta);
        if tokens.is_empty() {
            return;
        }
        let couples = joins::join_couples(&self.tokens, &tests, &tokens, &facts);
        self.memory_activate_couples(child, couples);
    }

    fn join_deactivate_facts(&mut self, id: BetaNodeId, facts: Vec<Quad>) {
        let (_, tests, beta, child) = self.join_snapshot(id);
        let tokens = self.holder_tokens(beta);
        if tokens.is_empty() {
            return;
        }
        let couples = joins::join_couples(&self.tokens, &tests, &tokens, &facts);
        self.memory_deactivate_couples(child, couples);
    }

    // --- beta memories ---

    fn memory_activate_couples(&mut self, id: BetaNodeId, couples: Vec<JoinMatch>) {
        if couples.is_empty() {
            return;
        }
        let Some(BetaNode::Memory(memory)) = self.nodes.get_mut(&id) else {
            panic!("beta node {id} is not a live memory");
        };
        let mut fresh = Vec::with_capacity(couples.len());
        for couple in couples {
            fresh.push(memory.build_token(&mut self.tokens, couple.token, couple.fact));
        }
        let children = memory.children().to_vec();
        trace!(memory = id, built = fresh.len(), "activated couples");
        for child in children {
            self.activate_tokens(child, fresh.clone());
        }
    }

    fn memory_deactivate_couples(&mut self, id: BetaNodeId, couples: Vec<JoinMatch>) {
        if couples.is_empty() {
            return;
        }
        let Some(BetaNode::Memory(memory)) = self.nodes.get_mut(&id) else {
            panic!("beta node {id} is not a live memory");
        };
        let mut removed = Vec::with_capacity(couples.len());
        for couple in couples {
            removed.push(memory.resolve_token(couple.token, &couple.fact));
        }
        let children = memory.children().to_vec();
        self.graveyard.extend(removed.iter().copied());
        for child in children {
            self.deactivate_tokens(child, removed.clone());
        }
    }

    fn memory_deactivate_tokens(&mut self, id: BetaNodeId, parents: Vec<TokenId>) {
        let Some(BetaNode::Memory(memory)) = self.nodes.get_mut(&id) else {
            panic!("beta node {id} is not a live memory");
        };
        let mut removed = Vec::new();
        for parent in parents {
            removed.extend(memory.remove_descendants(parent));
        }
        if removed.is_empty() {
            return;
        }
        let children = memory.children().to_vec();
        self.graveyard.extend(removed.iter().copied());
        for child in children {
            self.deactivate_tokens(child, removed.clone());
        }
    }

    // --- negative join nodes ---

    fn negative_activate_tokens(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let (alpha, tests) = match self.node(id) {
            BetaNode::Negative(n) => (n.alpha, n.tests.clone()),
            other => panic!("expected a negative join node, found {other:?}"),
        };
        let facts: Vec<Quad> = self.alpha.memory(alpha).facts().iter().copied().collect();
        let mut pass = Vec::new();
        for &token in &tokens {
            let matched: std::collections::HashSet<Quad> = facts
                .iter()
                .copied()
                .filter(|fact| joins::pass_tests(&self.tokens, &tests, token, fact))
                .collect();
            let empty = matched.is_empty();
            let Some(BetaNode::Negative(negative)) = self.nodes.get_mut(&id) else {
                unreachable!();
            };
            let previous = negative.matches.insert(token, matched);
            assert!(previous.is_none(), "token {token} activated twice in a negative join");
            if empty {
                pass.push(token);
            }
        }
        if pass.is_empty() {
            return;
        }
        let child = self.negative_child(id);
        self.activate_tokens(child, pass);
    }

    fn negative_deactivate_tokens(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let mut pass = Vec::new();
        {
            let Some(BetaNode::Negative(negative)) = self.nodes.get_mut(&id) else {
                panic!("beta node {id} is not a live negative join");
            };
            for token in tokens {
                let matched = negative
                    .matches
                    .remove(&token)
                    .unwrap_or_else(|| panic!("token {token} deactivated but never activated"));
                if matched.is_empty() {
                    pass.push(token);
                }
            }
        }
        if pass.is_empty() {
            return;
        }
        let child = self.negative_child(id);
        self.deactivate_tokens(child, pass);
    }

    fn negative_activate_facts(&mut self, id: BetaNodeId, facts: Vec<Quad>) {
        let tests = match self.node(id) {
            BetaNode::Negative(n) => n.tests.clone(),
            other => panic!("expected a negative join node, found {other:?}"),
        };
        let mut newly_blocked = Vec::new();
        {
            let Some(BetaNode::Negative(negative)) = self.nodes.get_mut(&id) else {
                unreachable!();
            };
            for (&token, matched) in negative.matches.iter_mut() {
                for fact in &facts {
                    if joins::pass_tests(&self.tokens, &tests, token, fact) {
                        if matched.is_empty() {
                            newly_blocked.push(token);
                        }
                        matched.insert(*fact);
                    }
                }
            }
        }
        if newly_blocked.is_empty() {
            return;
        }
        let child = self.negative_child(id);
        self.deactivate_tokens(child, newly_blocked);
    }

    fn negative_deactivate_facts(&mut self, id: BetaNodeId, facts: Vec<Quad>) {
        let mut newly_passing = Vec::new();
        {
            let Some(BetaNode::Negative(negative)) = self.nodes.get_mut(&id) else {
                panic!("beta node {id} is not a live negative join");
            };
            for (&token, matched) in negative.matches.iter_mut() {
                for fact in &facts {
                    if matched.remove(fact) && matched.is_empty() {
                        newly_passing.push(token);
                    }
                }
            }
        }
        if newly_passing.is_empty() {
            return;
        }
        let child = self.negative_child(id);
        self.activate_tokens(child, newly_passing);
    }

    fn negative_child(&self, id: BetaNodeId) -> BetaNodeId {
        match self.node(id) {
            BetaNode::Negative(n) => n.child.expect("negative join node has no child"),
            other => panic!("expected a negative join node, found {other:?}"),
        }
    }

    // --- NCC entry/exit ---

    fn entry_snapshot(&self, id: BetaNodeId) -> (BetaNodeId, Option<BetaNodeId>) {
        match self.node(id) {
            BetaNode::NccEntry(e) => (e.exit, e.child),
            other => panic!("expected an NCC entry node, found {other:?}"),
        }
    }

    fn entry_activate_tokens(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let (exit, sub) = self.entry_snapshot(id);
        self.exit_pre_activation(exit, &tokens);
        if let Some(sub) = sub {
            self.activate_tokens(sub, tokens.clone());
        }
        self.exit_post_activation(exit, tokens);
    }

    fn entry_deactivate_tokens(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let (exit, sub) = self.entry_snapshot(id);
        self.exit_pre_deactivation(exit);
        if let Some(sub) = sub {
            self.deactivate_tokens(sub, tokens.clone());
        }
        self.exit_post_deactivation(exit, tokens);
    }

    fn exit_mut(&mut self, id: BetaNodeId) -> &mut NccExitNode {
        match self.nodes.get_mut(&id) {
            Some(BetaNode::NccExit(x)) => x,
            _ => panic!("beta node {id} is not a live NCC exit"),
        }
    }

    /// Opens the activation transaction: the incoming tokens get fresh
    /// bookkeeping and sub-matches arriving until the commit are coalesced.
    fn exit_pre_activation(&mut self, id: BetaNodeId, tokens: &[TokenId]) {
        let exit = self.exit_mut(id);
        for &token in tokens {
            let previous = exit.token_data.insert(token, NccTokenData::default());
            assert!(previous.is_none(), "token {token} entered an NCC twice");
        }
        exit.in_transaction = true;
    }

    /// Commits the activation transaction: tokens with no sub-match are
    /// forwarded downstream.
    fn exit_post_activation(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let mut pass = Vec::new();
        let exit = self.exit_mut(id);
        exit.in_transaction = false;
        for token in tokens {
            let data = exit
                .token_data
                .get_mut(&token)
                .unwrap_or_else(|| panic!("token {token} not tracked by the NCC exit"));
            if data.matches.is_empty() {
                data.fired = true;
                pass.push(token);
            }
        }
        if pass.is_empty() {
            return;
        }
        let child = self.exit_child(id);
        self.activate_tokens(child, pass);
    }

    fn exit_pre_deactivation(&mut self, id: BetaNodeId) {
        self.exit_mut(id).in_transaction = true;
    }

    /// Commits the deactivation transaction: tokens that were forwarded
    /// are retracted downstream, all bookkeeping is dropped.
    fn exit_post_deactivation(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let mut lost = Vec::new();
        let exit = self.exit_mut(id);
        exit.in_transaction = false;
        for token in tokens {
            let data = exit
                .token_data
                .remove(&token)
                .unwrap_or_else(|| panic!("token {token} not tracked by the NCC exit"));
            if data.fired {
                lost.push(token);
            }
        }
        if lost.is_empty() {
            return;
        }
        let child = self.exit_child(id);
        self.deactivate_tokens(child, lost);
    }

    /// Sub-network matches arriving at the exit. Inside a transaction they
    /// only update the match lists; outside one, a list turning non-empty
    /// retracts the upstream token immediately.
    fn exit_activate_tokens(&mut self, id: BetaNodeId, subs: Vec<TokenId>) {
        let hop = match self.node(id) {
            BetaNode::NccExit(x) => x.hop,
            other => panic!("expected an NCC exit node, found {other:?}"),
        };
        let originals: Vec<(TokenId, TokenId)> = subs
            .iter()
            .map(|&sub| (sub, self.tokens.ancestor(sub, hop)))
            .collect();
        let mut newly_blocked = Vec::new();
        let exit = self.exit_mut(id);
        for (sub, original) in originals {
            let data = exit
                .token_data
                .get_mut(&original)
                .unwrap_or_else(|| panic!("token {original} not tracked by the NCC exit"));
            data.matches.push(sub);
            if !exit.in_transaction && data.fired {
                data.fired = false;
                newly_blocked.push(original);
            }
        }
        if newly_blocked.is_empty() {
            return;
        }
        let child = self.exit_child(id);
        self.deactivate_tokens(child, newly_blocked);
    }

    /// Sub-network matches retracting at the exit; symmetric to
    /// [`Self::exit_activate_tokens`].
    fn exit_deactivate_tokens(&mut self, id: BetaNodeId, subs: Vec<TokenId>) {
        let hop = match self.node(id) {
            BetaNode::NccExit(x) => x.hop,
            other => panic!("expected an NCC exit node, found {other:?}"),
        };
        let originals: Vec<(TokenId, TokenId)> = subs
            .iter()
            .map(|&sub| (sub, self.tokens.ancestor(sub, hop)))
            .collect();
        let mut newly_passing = Vec::new();
        let exit = self.exit_mut(id);
        for (sub, original) in originals {
            let data = exit
                .token_data
                .get_mut(&original)
                .unwrap_or_else(|| panic!("token {original} not tracked by the NCC exit"));
            let position = data
                .matches
                .iter()
                .position(|&m| m == sub)
                .unwrap_or_else(|| panic!("sub-match of token {original} retracted but never recorded"));
            data.matches.swap_remove(position);
            if !exit.in_transaction && data.matches.is_empty() {
                data.fired = true;
                newly_passing.push(original);
            }
        }
        if newly_passing.is_empty() {
            return;
        }
        let child = self.exit_child(id);
        self.activate_tokens(child, newly_passing);
    }

    fn exit_child(&self, id: BetaNodeId) -> BetaNodeId {
        match self.node(id) {
            BetaNode::NccExit(x) => x.child.expect("NCC exit node has no child"),
            other => panic!("expected an NCC exit node, found {other:?}"),
        }
    }

    // --- output nodes ---

    fn output_activate_tokens(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let Some(BetaNode::Output(output)) = self.nodes.get_mut(&id) else {
            panic!("beta node {id} is not a live output");
        };
        output.sink.activate_tokens(&self.tokens, &tokens);
    }

    fn output_deactivate_tokens(&mut self, id: BetaNodeId, tokens: Vec<TokenId>) {
        let Some(BetaNode::Output(output)) = self.nodes.get_mut(&id) else {
            panic!("beta node {id} is not a live output");
        };
        output.sink.deactivate_tokens(&self.tokens, &tokens);
    }
}

impl Default for ReteNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::model::NodeInterner;
    use crate::store::MemoryDataset;
    use crate::token::CountingSink;

    struct Vocab {
        interner: NodeInterner,
        graph: Node,
        rdf_type: Node,
        person: Node,
        knows: Node,
    }

    fn vocab() -> Vocab {
        let mut interner = NodeInterner::new();
        let graph = interner.iri("g");
        let rdf_type = interner.iri("type");
        let person = interner.iri("Person");
        let knows = interner.iri("knows");
        Vocab {
            interner,
            graph,
            rdf_type,
            person,
            knows,
        }
    }

    fn counting() -> (Rc<RefCell<CountingSink>>, Box<dyn TokenActivable>) {
        let sink = Rc::new(RefCell::new(CountingSink::new()));
        let boxed: Box<dyn TokenActivable> = Box::new(sink.clone());
        (sink, boxed)
    }

    #[test]
    fn field_classification() {
        let mut v = vocab();
        let x = v.interner.variable("x");
        let y = v.interner.variable("y");
        let mut bound = Vec::new();

        // (?x type Person): one binder, no test
        let first = join_data_for(&Quad::new(x, v.rdf_type, v.person, v.graph), &mut bound);
        assert_eq!(first.binders, vec![Binder {
            variable: x,
            field: QuadField::Subject,
        }]);
        assert!(first.tests.is_empty());
        assert_eq!(bound, vec![x]);

        // (?x knows ?y): a bound test on ?x, a binder for ?y
        let second = join_data_for(&Quad::new(x, v.knows, y, v.graph), &mut bound);
        assert_eq!(second.tests, vec![JoinTest::Bound {
            variable: x,
            field: QuadField::Subject,
        }]);
        assert_eq!(second.binders, vec![Binder {
            variable: y,
            field: QuadField::Object,
        }]);

        // (?z knows ?z): an unbound intra-fact test
        let z = v.interner.variable("z");
        let mut fresh = Vec::new();
        let auto = join_data_for(&Quad::new(z, v.knows, z, v.graph), &mut fresh);
        assert_eq!(auto.tests, vec![JoinTest::Unbound {
            left: QuadField::Subject,
            right: QuadField::Object,
        }]);
        assert_eq!(auto.binders.len(), 1);
        assert_eq!(fresh, vec![z]);
    }

    #[test]
    fn single_pattern_rule_round_trip() {
        let mut v = vocab();
        let x = v.interner.variable("x");
        let alice = v.interner.iri("alice");

        let store = MemoryDataset::new();
        let mut network = ReteNetwork::new();
        let (sink, boxed) = counting();
        network
            .add_rule(
                ReteRule::new(vec![Quad::new(x, v.rdf_type, v.person, v.graph)], vec![], boxed),
                &store,
            )
            .unwrap();

        let fact = Quad::new(alice, v.rdf_type, v.person, v.graph);
        network.fire_fact(fact);
        assert_eq!(sink.borrow().active(), 1);
        network.unfire_fact(fact);
        assert_eq!(sink.borrow().active(), 0);
        assert_eq!(sink.borrow().gained(), 1);
        assert_eq!(sink.borrow().lost(), 1);
    }

    #[test]
    fn seeding_and_incremental_paths_agree() {
        let mut v = vocab();
        let x = v.interner.variable("x");
        let y = v.interner.variable("y");
        let alice = v.interner.iri("alice");
        let bob = v.interner.iri("bob");

        let facts = vec![
            Quad::new(alice, v.rdf_type, v.person, v.graph),
            Quad::new(bob, v.rdf_type, v.person, v.graph),
            Quad::new(alice, v.knows, bob, v.graph),
        ];
        let patterns = vec![
            Quad::new(x, v.rdf_type, v.person, v.graph),
            Quad::new(x, v.knows, y, v.graph),
        ];

        // rule first, then facts
        let mut incremental = ReteNetwork::new();
        let (sink_a, boxed) = counting();
        incremental
            .add_rule(
                ReteRule::new(patterns.clone(), vec![], boxed),
                &MemoryDataset::new(),
            )
            .unwrap();
        incremental.fire(&facts);
        assert_eq!(sink_a.borrow().active(), 1);

        // facts first, then rule: alpha memories seed from the store and
        // the new chain replays them
        let mut store = MemoryDataset::new();
        for &fact in &facts {
            store.insert(fact);
        }
        let mut seeded = ReteNetwork::new();
        seeded.fire(&facts);
        let (sink_b, boxed) = counting();
        seeded
            .add_rule(ReteRule::new(patterns, vec![], boxed), &store)
            .unwrap();
        assert_eq!(sink_b.borrow().active(), 1);
    }

    #[test]
    fn prefix_sharing_reuses_the_join_node() {
        let mut v = vocab();
        let x = v.interner.variable("x");
        let y = v.interner.variable("y");
        let alice = v.interner.iri("alice");
        let bob = v.interner.iri("bob");

        let store = MemoryDataset::new();
        let mut network = ReteNetwork::new();
        let (sink_one, boxed) = counting();
        let one = network
            .add_rule(
                ReteRule::new(vec![Quad::new(x, v.rdf_type, v.person, v.graph)], vec![], boxed),
                &store,
            )
            .unwrap();
        let (sink_two, boxed) = counting();
        let two = network
            .add_rule(
                ReteRule::new(
                    vec![
                        Quad::new(x, v.rdf_type, v.person, v.graph),
                        Quad::new(x, v.knows, y, v.graph),
                    ],
                    vec![],
                    boxed,
                ),
                &store,
            )
            .unwrap();

        // one shared first-stage join plus the second rule's own join
        assert_eq!(network.stats().join_nodes, 2);

        network.fire(&[
            Quad::new(alice, v.rdf_type, v.person, v.graph),
            Quad::new(bob, v.rdf_type, v.person, v.graph),
            Quad::new(alice, v.knows, bob, v.graph),
        ]);
        assert_eq!(sink_one.borrow().active(), 2);
        assert_eq!(sink_two.borrow().active(), 1);

        // removing the first rule must leave the shared join alive
        network.remove_rule(one);
        assert_eq!(network.stats().join_nodes, 2);
        network.fire_fact(Quad::new(bob, v.knows, alice, v.graph));
        assert_eq!(sink_two.borrow().active(), 2);

        // removing the second tears the whole chain down
        network.remove_rule(two);
        let stats = network.stats();
        assert_eq!(stats.join_nodes, 0);
        assert_eq!(stats.alpha_memories, 0);
        assert_eq!(stats.beta_memories, 1, "only the root memory remains");
        assert_eq!(stats.tokens, 1, "only the root token remains");
    }

    #[test]
    fn sharing_rule_binds_its_own_variables_retroactively() {
        let mut v = vocab();
        let x = v.interner.variable("x");
        let z = v.interner.variable("z");
        let y = v.interner.variable("y");
        let alice = v.interner.iri("alice");
        let bob = v.interner.iri("bob");

        let mut store = MemoryDataset::new();
        let mut network = ReteNetwork::new();
        let (sink_one, boxed) = counting();
        network
            .add_rule(
                ReteRule::new(vec![Quad::new(x, v.rdf_type, v.person, v.graph)], vec![], boxed),
                &store,
            )
            .unwrap();

        // tokens already exist in the shared memory before the second rule
        // arrives with a differently-named variable
        let base = [
            Quad::new(alice, v.rdf_type, v.person, v.graph),
            Quad::new(alice, v.knows, bob, v.graph),
        ];
        for &fact in &base {
            store.insert(fact);
        }
        network.fire(&base);
        assert_eq!(sink_one.borrow().active(), 1);

        let (sink_two, boxed) = counting();
        network
            .add_rule(
                ReteRule::new(
                    vec![
                        Quad::new(z, v.rdf_type, v.person, v.graph),
                        Quad::new(z, v.knows, y, v.graph),
                    ],
                    vec![],
                    boxed,
                ),
                &store,
            )
            .unwrap();
        assert_eq!(network.stats().join_nodes, 2, "first join is shared");
        assert_eq!(sink_two.borrow().active(), 1, "?z bound on existing tokens");
    }

    #[test]
    fn negative_only_rule_joins_against_the_root_token() {
        let mut v = vocab();
        let x = v.interner.variable("x");
        let alice = v.interner.iri("alice");

        let store = MemoryDataset::new();
        let mut network = ReteNetwork::new();
        let (sink, boxed) = counting();
        network
            .add_rule(
                ReteRule::new(
                    vec![],
                    vec![vec![Quad::new(x, v.rdf_type, v.person, v.graph)]],
                    boxed,
                ),
                &store,
            )
            .unwrap();
        // no disqualifying fact: the root token passes
        assert_eq!(sink.borrow().active(), 1);

        let fact = Quad::new(alice, v.rdf_type, v.person, v.graph);
        network.fire_fact(fact);
        assert_eq!(sink.borrow().active(), 0);
        network.unfire_fact(fact);
        assert_eq!(sink.borrow().active(), 1);
    }

    #[test]
    fn invalid_pattern_is_rejected_and_leaves_the_network_unchanged() {
        let mut v = vocab();
        let x = v.interner.variable("x");
        let lit = v.interner.literal("42");

        let store = MemoryDataset::new();
        let mut network = ReteNetwork::new();
        let before = network.stats();
        let (_, boxed) = counting();
        let result = network.add_rule(
            ReteRule::new(vec![Quad::new(x, lit, x, v.graph)], vec![], boxed),
            &store,
        );
        assert_eq!(
            result.unwrap_err(),
            PatternError::UnsupportedNode {
                field: QuadField::Property,
                kind: "a literal",
            }
        );
        assert_eq!(network.stats(), before);
        assert_eq!(network.rule_count(), 0);
    }

    #[test]
    fn match_status_reports_bindings_per_stage() {
        let mut v = vocab();
        let x = v.interner.variable("x");
        let y = v.interner.variable("y");
        let alice = v.interner.iri("alice");
        let bob = v.interner.iri("bob");

        let store = MemoryDataset::new();
        let mut network = ReteNetwork::new();
        let (_, boxed) = counting();
        let rule = network
            .add_rule(
                ReteRule::new(
                    vec![
                        Quad::new(x, v.rdf_type, v.person, v.graph),
                        Quad::new(x, v.knows, y, v.graph),
                    ],
                    vec![],
                    boxed,
                ),
                &store,
            )
            .unwrap();
        network.fire(&[
            Quad::new(alice, v.rdf_type, v.person, v.graph),
            Quad::new(bob, v.rdf_type, v.person, v.graph),
            Quad::new(alice, v.knows, bob, v.graph),
        ]);

        let status = network.match_status(rule, &v.interner);
        assert_eq!(status.steps.len(), 2);
        assert_eq!(status.steps[0].bindings.len(), 2);
        assert_eq!(status.steps[1].bindings.len(), 1);
        assert_eq!(status.full_matches(), 1);
        let full = &status.steps[1].bindings[0];
        assert_eq!(full["x"], "<alice>");
        assert_eq!(full["y"], "<bob>");
        assert_eq!(status.steps[1].pattern.property, "<knows>");

        // unknown rules report an empty status
        assert_eq!(network.match_status(rule + 100, &v.interner).steps.len(), 0);
    }

    #[test]
    fn removing_an_unknown_rule_is_a_no_op() {
        let mut network = ReteNetwork::new();
        network.remove_rule(42);
        assert_eq!(network.rule_count(), 0);
    }
}
