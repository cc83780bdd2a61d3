//! Incremental RETE pattern matching over RDF quads.
//!
//! This crate implements the RETE algorithm over a stream of typed quads
//! (subject, property, object, graph): rules compile into a shared network
//! of alpha memories, join nodes and beta memories that is updated
//! incrementally as facts are asserted and retracted, so forward-chaining
//! rule engines never re-scan the full fact set on a change. The network
//! supports exact retraction, negation over single patterns and over
//! conjunctions (NCC), sharing of compiled sub-chains between rules, and
//! adaptive join-algorithm selection.
//!
//! # Example
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use oxirs_rete::{
//!     CountingSink, MemoryDataset, NodeInterner, Quad, ReteNetwork, ReteRule,
//! };
//!
//! let mut interner = NodeInterner::new();
//! let graph = interner.iri("http://example.org/graph");
//! let rdf_type = interner.iri("http://www.w3.org/1999/02/22-rdf-syntax-ns#type");
//! let person = interner.iri("http://example.org/Person");
//! let alice = interner.iri("http://example.org/alice");
//! let x = interner.variable("x");
//!
//! let store = MemoryDataset::new();
//! let mut network = ReteNetwork::new();
//! let sink = Rc::new(RefCell::new(CountingSink::new()));
//! network
//!     .add_rule(
//!         ReteRule::new(
//!             vec![Quad::new(x, rdf_type, person, graph)],
//!             vec![],
//!             Box::new(sink.clone()),
//!         ),
//!         &store,
//!     )
//!     .unwrap();
//!
//! network.fire_fact(Quad::new(alice, rdf_type, person, graph));
//! assert_eq!(sink.borrow().active(), 1);
//! network.unfire_fact(Quad::new(alice, rdf_type, person, graph));
//! assert_eq!(sink.borrow().active(), 0);
//! ```
//!
//! The network is synchronous and single-threaded: every mutating call runs
//! all cascading effects to completion before returning, and callers must
//! serialize mutation through a single writer. Batch injection via
//! [`ReteNetwork::fire`] and [`ReteNetwork::inject`] is the primary
//! performance lever and should be preferred over singleton calls.

pub mod alpha;
pub mod beta;
pub mod joins;
pub mod model;
pub mod network;
pub mod status;
pub mod store;
pub mod token;

pub use joins::{Binder, JoinTest};
pub use model::{check_pattern, Node, NodeInterner, PatternError, Quad, QuadField, Term};
pub use network::{ReteNetwork, ReteRule, ReteStats, RuleId};
pub use status::{MatchStatus, MatchStatusStep, PatternStatus};
pub use store::{Changeset, EmptyStore, FactStore, MemoryDataset};
pub use token::{CountingSink, TokenActivable, TokenId, TokenPool};
