//! Diagnostic trace of a rule's partial matches.
//!
//! A [`MatchStatus`] records, per positive pattern of a rule in order, the
//! pattern itself and the variable bindings live after that join stage. It
//! is a read-only reporting surface for debugging rules that do not fire as
//! expected, serializable to JSON through serde.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{NodeInterner, Quad, QuadField, Term};
use crate::token::{TokenId, TokenPool};

/// A rendered pattern quad.
#[derive(Debug, Clone, Serialize)]
pub struct PatternStatus {
    pub subject: String,
    pub property: String,
    pub object: String,
    pub graph: String,
}

/// The live matches after one join stage.
#[derive(Debug, Serialize)]
pub struct MatchStatusStep {
    pub pattern: PatternStatus,
    /// One map of variable name to value per live token.
    pub bindings: Vec<BTreeMap<String, String>>,
}

impl MatchStatusStep {
    pub(crate) fn new(pattern: &Quad, interner: &NodeInterner) -> Self {
        Self {
            pattern: PatternStatus {
                subject: interner.display(pattern.field(QuadField::Subject)),
                property: interner.display(pattern.field(QuadField::Property)),
                object: interner.display(pattern.field(QuadField::Object)),
                graph: interner.display(pattern.field(QuadField::Graph)),
            },
            bindings: Vec::new(),
        }
    }

    /// Records the full-chain bindings of one live token.
    pub(crate) fn add_bindings(
        &mut self,
        pool: &TokenPool,
        token: TokenId,
        interner: &NodeInterner,
    ) {
        let mut solution = BTreeMap::new();
        for (variable, value) in pool.bindings(token) {
            let name = match interner.term(variable) {
                Term::Variable(name) => name.clone(),
                other => other.to_string(),
            };
            // nearest frames come first and shadow farther ones
            solution.entry(name).or_insert_with(|| interner.display(value));
        }
        self.bindings.push(solution);
    }
}

/// The status of one rule in the network.
#[derive(Debug, Default, Serialize)]
pub struct MatchStatus {
    pub steps: Vec<MatchStatusStep>,
}

impl MatchStatus {
    /// Number of full matches, i.e. tokens live after the last positive
    /// join stage.
    pub fn full_matches(&self) -> usize {
        self.steps.last().map_or(0, |step| step.bindings.len())
    }
}
