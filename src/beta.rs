//! The beta layer: memories, join nodes, negation and output nodes.
//!
//! All beta-side nodes live in one arena owned by the network and reference
//! each other (and their upstream alpha memories) by index, so teardown is a
//! matter of detaching indices from subscriber lists; there is no ownership
//! cycle. The activation logic itself is driven by the network, which owns
//! both the arena and the token pool.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::alpha::AlphaId;
use crate::joins::{Binder, JoinTest};
use crate::model::Quad;
use crate::token::{TokenActivable, TokenId, TokenPool};

/// Identifier of a node in the beta arena.
pub type BetaNodeId = usize;

/// A memory caching the partial-match tokens at one join stage.
///
/// The ascendant map records, per upstream token and triggering fact, the
/// exact child token that was built for the couple; retraction resolves the
/// same couple back to that child. The token set and the ascendant map are
/// kept consistent at all times.
#[derive(Debug)]
pub struct BetaMemory {
    tokens: HashSet<TokenId>,
    ascendants: HashMap<TokenId, HashMap<Quad, TokenId>>,
    binders: Vec<Binder>,
    children: Vec<BetaNodeId>,
}

impl BetaMemory {
    pub fn new(binders: Vec<Binder>) -> Self {
        Self {
            tokens: HashSet::new(),
            ascendants: HashMap::new(),
            binders,
            children: Vec::new(),
        }
    }

    /// The root ("dummy") memory, holding the network's root token.
    pub fn with_root(root: TokenId) -> Self {
        let mut memory = Self::new(Vec::new());
        memory.tokens.insert(root);
        memory
    }

    pub fn tokens(&self) -> &HashSet<TokenId> {
        &self.tokens
    }

    pub fn binders(&self) -> &[Binder] {
        &self.binders
    }

    pub fn children(&self) -> &[BetaNodeId] {
        &self.children
    }

    pub fn add_child(&mut self, child: BetaNodeId) {
        self.children.push(child);
    }

    pub fn remove_child(&mut self, child: BetaNodeId) {
        self.children.retain(|&c| c != child);
    }

    /// Builds the child token for an activated couple: allocates it under
    /// the parent, applies every binder, and records the provenance entry.
    ///
    /// Panics if the couple was already activated; the provenance map would
    /// silently lose a token otherwise.
    pub fn build_token(&mut self, pool: &mut TokenPool, parent: TokenId, fact: Quad) -> TokenId {
        let child = pool.create(Some(parent));
        for binder in &self.binders {
            binder.execute(pool, child, &fact);
        }
        let previous = self.ascendants.entry(parent).or_default().insert(fact, child);
        assert!(
            previous.is_none(),
            "couple (token {parent}, {fact:?}) activated twice"
        );
        self.tokens.insert(child);
        child
    }

    /// Resolves and removes the child token of a deactivated couple.
    ///
    /// Panics if the couple was never activated: deactivations must mirror
    /// earlier activations exactly.
    pub fn resolve_token(&mut self, parent: TokenId, fact: &Quad) -> TokenId {
        let entry = self
            .ascendants
            .get_mut(&parent)
            .unwrap_or_else(|| panic!("deactivated couple for unknown token {parent}"));
        let child = entry
            .remove(fact)
            .unwrap_or_else(|| panic!("deactivated couple (token {parent}, {fact:?}) that was never activated"));
        if entry.is_empty() {
            self.ascendants.remove(&parent);
        }
        self.tokens.remove(&child);
        child
    }

    /// Removes every child built under the given upstream token, returning
    /// them. Used when the upstream token itself is retracted.
    pub fn remove_descendants(&mut self, parent: TokenId) -> Vec<TokenId> {
        let Some(entry) = self.ascendants.remove(&parent) else {
            return Vec::new();
        };
        let children: Vec<TokenId> = entry.into_values().collect();
        for child in &children {
            self.tokens.remove(child);
        }
        children
    }

    /// Appends binders this memory does not carry yet and re-executes them
    /// over every existing provenance entry, mutating the affected tokens in
    /// place. Needed when a later rule shares this memory but binds
    /// additional variables at this stage.
    pub fn add_binders(&mut self, pool: &mut TokenPool, binders: &[Binder]) {
        let fresh: Vec<Binder> = binders
            .iter()
            .filter(|b| !self.binders.contains(b))
            .copied()
            .collect();
        if fresh.is_empty() {
            return;
        }
        for entry in self.ascendants.values() {
            for (fact, &child) in entry {
                for binder in &fresh {
                    binder.execute(pool, child, fact);
                }
            }
        }
        self.binders.extend(fresh);
    }

    /// Whether the token set and the ascendant map describe the same tokens.
    pub fn is_consistent(&self) -> bool {
        let mapped: HashSet<TokenId> = self
            .ascendants
            .values()
            .flat_map(|entry| entry.values().copied())
            .collect();
        mapped == self.tokens
    }
}

/// A join between one alpha memory and one upstream token holder.
///
/// Join nodes are shared between rules compiling the same (alpha, tests)
/// combination under the same upstream memory; the reference count tracks
/// how many compiled rules currently depend on the node.
#[derive(Debug)]
pub struct JoinNode {
    pub alpha: AlphaId,
    pub beta: BetaNodeId,
    pub tests: Vec<JoinTest>,
    pub child: BetaNodeId,
    pub ref_count: usize,
}

impl JoinNode {
    /// Whether this node joins the given alpha memory under the same test
    /// set. Test identity is order-independent set equality, checked in
    /// both directions so a duplicated test cannot masquerade as a match.
    pub fn matches(&self, alpha: AlphaId, tests: &[JoinTest]) -> bool {
        self.alpha == alpha
            && self.tests.len() == tests.len()
            && tests.iter().all(|t| self.tests.contains(t))
            && self.tests.iter().all(|t| tests.contains(t))
    }
}

/// NOT over a single pattern: forwards an upstream token iff no fact in the
/// opposing alpha memory passes the tests against it.
#[derive(Debug)]
pub struct NegativeJoinNode {
    pub alpha: AlphaId,
    pub beta: BetaNodeId,
    pub tests: Vec<JoinTest>,
    pub child: Option<BetaNodeId>,
    /// Per upstream token, the set of currently-matching opposing facts.
    pub matches: HashMap<TokenId, HashSet<Quad>>,
}

/// Entry of the private sub-network matching a negated conjunction: receives
/// upstream tokens, brackets them in the exit's transaction, and feeds them
/// into the conjunction's first join.
#[derive(Debug)]
pub struct NccEntryNode {
    pub beta: BetaNodeId,
    pub exit: BetaNodeId,
    pub child: Option<BetaNodeId>,
}

/// Bookkeeping of one upstream token at an NCC exit.
#[derive(Debug, Default)]
pub struct NccTokenData {
    /// Sub-network tokens currently matching the conjunction for this token.
    pub matches: Vec<TokenId>,
    /// Whether the token is currently forwarded downstream.
    pub fired: bool,
}

/// Exit of an NCC sub-network: coalesces the sub-matches produced during a
/// transaction into a single pass/fail decision for the upstream token.
pub struct NccExitNode {
    pub beta: BetaNodeId,
    /// Parent hops from a sub-network token back to the upstream token.
    pub hop: usize,
    pub in_transaction: bool,
    pub child: Option<BetaNodeId>,
    pub token_data: HashMap<TokenId, NccTokenData>,
}

impl fmt::Debug for NccExitNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NccExitNode")
            .field("beta", &self.beta)
            .field("hop", &self.hop)
            .field("in_transaction", &self.in_transaction)
            .field("tracked", &self.token_data.len())
            .finish()
    }
}

/// Terminal node delivering full matches to a rule's output sink.
pub struct OutputNode {
    pub sink: Box<dyn TokenActivable>,
}

impl fmt::Debug for OutputNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OutputNode")
    }
}

/// A node of the beta arena.
#[derive(Debug)]
pub enum BetaNode {
    Memory(BetaMemory),
    Join(JoinNode),
    Negative(NegativeJoinNode),
    NccEntry(NccEntryNode),
    NccExit(NccExitNode),
    Output(OutputNode),
}

impl BetaNode {
    pub fn as_memory(&self) -> &BetaMemory {
        match self {
            BetaNode::Memory(m) => m,
            other => panic!("expected a beta memory, found {other:?}"),
        }
    }

    pub fn as_memory_mut(&mut self) -> &mut BetaMemory {
        match self {
            BetaNode::Memory(m) => m,
            other => panic!("expected a beta memory, found {other:?}"),
        }
    }
}
