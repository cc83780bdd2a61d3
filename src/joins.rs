//! Join tests, binders and the join strategies.
//!
//! A compiled pattern field becomes either a [`Binder`] (first occurrence of
//! a variable, recorded into the token being built) or a [`JoinTest`]
//! (consistency check against an earlier binding, or between two fields of
//! the same pattern). Batched joins between a token collection and a fact
//! collection go through one of three strategies selected on operand
//! cardinalities; the strategies differ only in cost, never in output.

use std::collections::HashMap;

use crate::model::{Node, Quad, QuadField};
use crate::token::{TokenId, TokenPool};

/// Nested loops are used up to this left*right product.
pub const MAX_SIZE_JOIN_LOOPS: usize = 10;
/// The simple hash join is used up to this left*right product; the grace
/// hash join takes over beyond it.
pub const MAX_SIZE_JOIN_SIMPLE_HASH: usize = 10_000;

/// Records a new variable's value into a freshly built token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binder {
    pub variable: Node,
    pub field: QuadField,
}

impl Binder {
    /// Appends `(variable, fact[field])` to the token's local frame.
    pub(crate) fn execute(&self, pool: &mut TokenPool, token: TokenId, fact: &Quad) {
        pool.bind(token, self.variable, fact.field(self.field));
    }
}

/// An equality check applied to every (token, fact) couple of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinTest {
    /// The variable was bound by an earlier pattern: the fact's field must
    /// equal the token's binding. Usable as a hash-index key.
    Bound { variable: Node, field: QuadField },
    /// The same variable occurs twice in one pattern: the two fact fields
    /// must be equal. Independent of the token, so it cannot partition
    /// either operand and is evaluated as a post-filter.
    Unbound { left: QuadField, right: QuadField },
}

impl JoinTest {
    /// Whether the test can contribute a hash-index key.
    pub fn use_in_index(&self) -> bool {
        matches!(self, JoinTest::Bound { .. })
    }

    /// Checks one couple.
    pub fn check(&self, pool: &TokenPool, token: TokenId, fact: &Quad) -> bool {
        match self {
            JoinTest::Bound { variable, field } => {
                pool.binding(token, *variable) == Some(fact.field(*field))
            }
            JoinTest::Unbound { left, right } => fact.field(*left) == fact.field(*right),
        }
    }

    fn token_value(&self, pool: &TokenPool, token: TokenId) -> Option<Node> {
        match self {
            JoinTest::Bound { variable, .. } => pool.binding(token, *variable),
            JoinTest::Unbound { .. } => None,
        }
    }

    fn fact_value(&self, fact: &Quad) -> Option<Node> {
        match self {
            JoinTest::Bound { field, .. } => Some(fact.field(*field)),
            JoinTest::Unbound { .. } => None,
        }
    }
}

/// Whether a couple passes every test.
pub(crate) fn pass_tests(
    pool: &TokenPool,
    tests: &[JoinTest],
    token: TokenId,
    fact: &Quad,
) -> bool {
    tests.iter().all(|test| test.check(pool, token, fact))
}

/// One passing couple produced by a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinMatch {
    pub token: TokenId,
    pub fact: Quad,
}

/// A hash-index key: the values of up to three index-usable tests.
type JoinKey = [Option<Node>; 3];

/// Splits the test list into the tests forming the hash key and the
/// residual tests applied as a post-filter (non-indexable tests, plus any
/// indexable test beyond the three key slots).
fn split_tests(tests: &[JoinTest]) -> (Vec<JoinTest>, Vec<JoinTest>) {
    let mut keyed = Vec::new();
    let mut residual = Vec::new();
    for &test in tests {
        if test.use_in_index() && keyed.len() < 3 {
            keyed.push(test);
        } else {
            residual.push(test);
        }
    }
    (keyed, residual)
}

fn token_key(pool: &TokenPool, keyed: &[JoinTest], token: TokenId) -> JoinKey {
    let mut key: JoinKey = [None; 3];
    for (slot, test) in key.iter_mut().zip(keyed) {
        *slot = test.token_value(pool, token);
    }
    key
}

fn fact_key(keyed: &[JoinTest], fact: &Quad) -> JoinKey {
    let mut key: JoinKey = [None; 3];
    for (slot, test) in key.iter_mut().zip(keyed) {
        *slot = test.fact_value(fact);
    }
    key
}

/// Builds the bucket index of one operand side.
fn hash_side<T: Copy>(items: &[T], key_of: impl Fn(&T) -> JoinKey) -> HashMap<JoinKey, Vec<T>> {
    let mut index: HashMap<JoinKey, Vec<T>> = HashMap::new();
    for item in items {
        index.entry(key_of(item)).or_default().push(*item);
    }
    index
}

/// Probes an index with the other side, emitting every key-equal couple.
fn probe<L: Copy, R: Copy>(
    index: &HashMap<JoinKey, Vec<L>>,
    probes: &[R],
    key_of: impl Fn(&R) -> JoinKey,
    mut emit: impl FnMut(L, R),
) {
    for item in probes {
        if let Some(bucket) = index.get(&key_of(item)) {
            for &hit in bucket {
                emit(hit, *item);
            }
        }
    }
}

/// The O(n*m) reference strategy: always correct, no setup cost.
pub fn nested_loop_join(
    pool: &TokenPool,
    tests: &[JoinTest],
    tokens: &[TokenId],
    facts: &[Quad],
) -> Vec<JoinMatch> {
    let mut out = Vec::new();
    for &token in tokens {
        for fact in facts {
            if pass_tests(pool, tests, token, fact) {
                out.push(JoinMatch { token, fact: *fact });
            }
        }
    }
    out
}

/// Hashes the smaller side on the key tests and probes with the other;
/// residual tests are applied per candidate couple.
pub fn simple_hash_join(
    pool: &TokenPool,
    tests: &[JoinTest],
    tokens: &[TokenId],
    facts: &[Quad],
) -> Vec<JoinMatch> {
    let (keyed, residual) = split_tests(tests);
    let mut out = Vec::new();
    if tokens.len() <= facts.len() {
        let index = hash_side(tokens, |&t| token_key(pool, &keyed, t));
        probe(&index, facts, |f| fact_key(&keyed, f), |token, fact| {
            if pass_tests(pool, &residual, token, &fact) {
                out.push(JoinMatch { token, fact });
            }
        });
    } else {
        let index = hash_side(facts, |f| fact_key(&keyed, f));
        probe(&index, tokens, |&t| token_key(pool, &keyed, t), |fact, token| {
            if pass_tests(pool, &residual, token, &fact) {
                out.push(JoinMatch { token, fact });
            }
        });
    }
    out
}

/// Hashes both sides and intersects bucket by bucket, so no cross product
/// is materialized even while the indices are built.
pub fn grace_hash_join(
    pool: &TokenPool,
    tests: &[JoinTest],
    tokens: &[TokenId],
    facts: &[Quad],
) -> Vec<JoinMatch> {
    let (keyed, residual) = split_tests(tests);
    let token_index = hash_side(tokens, |&t| token_key(pool, &keyed, t));
    let fact_index = hash_side(facts, |f| fact_key(&keyed, f));
    let mut out = Vec::new();
    for (key, bucket_tokens) in &token_index {
        let Some(bucket_facts) = fact_index.get(key) else {
            continue;
        };
        for &token in bucket_tokens {
            for &fact in bucket_facts {
                if pass_tests(pool, &residual, token, &fact) {
                    out.push(JoinMatch { token, fact });
                }
            }
        }
    }
    out
}

/// Joins a token collection against a fact collection, selecting the
/// strategy on operand cardinalities. The selection is a pure performance
/// decision: all strategies yield the same multiset of passing couples.
pub(crate) fn join_couples(
    pool: &TokenPool,
    tests: &[JoinTest],
    tokens: &[TokenId],
    facts: &[Quad],
) -> Vec<JoinMatch> {
    let product = tokens.len() * facts.len();
    let indexable = tests.iter().any(JoinTest::use_in_index);
    if product <= MAX_SIZE_JOIN_LOOPS || !indexable {
        nested_loop_join(pool, tests, tokens, facts)
    } else if product <= MAX_SIZE_JOIN_SIMPLE_HASH {
        simple_hash_join(pool, tests, tokens, facts)
    } else {
        grace_hash_join(pool, tests, tokens, facts)
    }
}
