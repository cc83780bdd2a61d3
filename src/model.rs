//! RDF term and quad model used by the RETE network.
//!
//! Terms are interned: every logically-equal term maps to the same [`Node`]
//! handle, so the engine compares nodes by integer equality and never looks
//! at term contents on the hot path. The handle carries the term kind in its
//! two top bits, which lets pattern code distinguish wildcards and check
//! position validity without consulting the interner.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

const KIND_SHIFT: u32 = 30;
const KIND_MASK: u32 = 0b11 << KIND_SHIFT;
const KIND_IRI: u32 = 0b00 << KIND_SHIFT;
const KIND_BLANK: u32 = 0b01 << KIND_SHIFT;
const KIND_LITERAL: u32 = 0b10 << KIND_SHIFT;
const KIND_VARIABLE: u32 = 0b11 << KIND_SHIFT;

/// An interned term handle.
///
/// Two nodes are the same term iff they are equal; the interner guarantees
/// this for every handle it issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);

impl Node {
    /// Whether this node is a pattern variable.
    pub fn is_variable(self) -> bool {
        self.0 & KIND_MASK == KIND_VARIABLE
    }

    /// Whether this node is an IRI.
    pub fn is_iri(self) -> bool {
        self.0 & KIND_MASK == KIND_IRI
    }

    /// Whether this node is a blank node.
    pub fn is_blank(self) -> bool {
        self.0 & KIND_MASK == KIND_BLANK
    }

    /// Whether this node is a literal.
    pub fn is_literal(self) -> bool {
        self.0 & KIND_MASK == KIND_LITERAL
    }

    fn index(self) -> usize {
        (self.0 & !KIND_MASK) as usize
    }
}

/// A decoded RDF term.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// An IRI reference.
    Iri(String),
    /// A blank node, identified by its numeric id.
    Blank(u64),
    /// A literal with optional datatype IRI and language tag.
    Literal {
        value: String,
        datatype: Option<String>,
        language: Option<String>,
    },
    /// A query variable.
    Variable(String),
}

impl Term {
    fn kind_bits(&self) -> u32 {
        match self {
            Term::Iri(_) => KIND_IRI,
            Term::Blank(_) => KIND_BLANK,
            Term::Literal { .. } => KIND_LITERAL,
            Term::Variable(_) => KIND_VARIABLE,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Iri(iri) => write!(f, "<{iri}>"),
            Term::Blank(id) => write!(f, "_:b{id}"),
            Term::Literal {
                value,
                datatype,
                language,
            } => {
                write!(f, "\"{value}\"")?;
                if let Some(lang) = language {
                    write!(f, "@{lang}")?;
                } else if let Some(dt) = datatype {
                    write!(f, "^^<{dt}>")?;
                }
                Ok(())
            }
            Term::Variable(name) => write!(f, "?{name}"),
        }
    }
}

/// The term interner backing [`Node`] handles.
#[derive(Debug, Default)]
pub struct NodeInterner {
    terms: Vec<Term>,
    index: HashMap<Term, Node>,
}

impl NodeInterner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a term, returning its stable handle.
    pub fn intern(&mut self, term: Term) -> Node {
        if let Some(&node) = self.index.get(&term) {
            return node;
        }
        let id = self.terms.len() as u32;
        assert!(id < 1 << KIND_SHIFT, "interner capacity exceeded");
        let node = Node(term.kind_bits() | id);
        self.terms.push(term.clone());
        self.index.insert(term, node);
        node
    }

    /// Interns an IRI.
    pub fn iri(&mut self, iri: impl Into<String>) -> Node {
        self.intern(Term::Iri(iri.into()))
    }

    /// Interns a blank node.
    pub fn blank(&mut self, id: u64) -> Node {
        self.intern(Term::Blank(id))
    }

    /// Interns a plain literal.
    pub fn literal(&mut self, value: impl Into<String>) -> Node {
        self.intern(Term::Literal {
            value: value.into(),
            datatype: None,
            language: None,
        })
    }

    /// Interns a variable.
    pub fn variable(&mut self, name: impl Into<String>) -> Node {
        self.intern(Term::Variable(name.into()))
    }

    /// Resolves a handle back to its term.
    pub fn term(&self, node: Node) -> &Term {
        &self.terms[node.index()]
    }

    /// Renders a handle for diagnostics.
    pub fn display(&self, node: Node) -> String {
        self.term(node).to_string()
    }
}

/// A field of a quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum QuadField {
    Subject,
    Property,
    Object,
    Graph,
}

impl QuadField {
    /// All fields, in the order pattern fields are classified.
    pub const ALL: [QuadField; 4] = [
        QuadField::Subject,
        QuadField::Property,
        QuadField::Object,
        QuadField::Graph,
    ];
}

impl fmt::Display for QuadField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuadField::Subject => "subject",
            QuadField::Property => "property",
            QuadField::Object => "object",
            QuadField::Graph => "graph",
        };
        f.write_str(name)
    }
}

/// A quad of interned nodes.
///
/// A quad with no variable field is a fact; with variables it is a pattern
/// where each variable acts as a wildcard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quad {
    pub subject: Node,
    pub property: Node,
    pub object: Node,
    pub graph: Node,
}

impl Quad {
    pub fn new(subject: Node, property: Node, object: Node, graph: Node) -> Self {
        Self {
            subject,
            property,
            object,
            graph,
        }
    }

    /// Reads one field.
    pub fn field(&self, field: QuadField) -> Node {
        match field {
            QuadField::Subject => self.subject,
            QuadField::Property => self.property,
            QuadField::Object => self.object,
            QuadField::Graph => self.graph,
        }
    }

    /// Whether this quad is fully ground.
    pub fn is_ground(&self) -> bool {
        QuadField::ALL.iter().all(|&f| !self.field(f).is_variable())
    }

    /// Whether a ground fact matches this pattern (variables are wildcards).
    pub fn matches(&self, fact: &Quad) -> bool {
        QuadField::ALL.iter().all(|&f| {
            let node = self.field(f);
            node.is_variable() || node == fact.field(f)
        })
    }
}

/// A pattern rejected at rule-compile time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// A term kind that is not legal at the given quad position, e.g. a
    /// literal used as the property of a pattern.
    #[error("{kind} is not a valid {field} in a quad pattern")]
    UnsupportedNode {
        field: QuadField,
        kind: &'static str,
    },
}

/// Checks that every field of a pattern holds a term kind legal at its
/// position. Variables are legal everywhere; literals only as objects;
/// blank nodes everywhere except the property position.
pub fn check_pattern(pattern: &Quad) -> Result<(), PatternError> {
    for field in QuadField::ALL {
        let node = pattern.field(field);
        if node.is_literal() && field != QuadField::Object {
            return Err(PatternError::UnsupportedNode {
                field,
                kind: "a literal",
            });
        }
        if node.is_blank() && field == QuadField::Property {
            return Err(PatternError::UnsupportedNode {
                field,
                kind: "a blank node",
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let mut interner = NodeInterner::new();
        let a = interner.iri("http://example.org/a");
        let b = interner.iri("http://example.org/b");
        let a2 = interner.iri("http://example.org/a");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert!(a.is_iri());
        assert!(!a.is_variable());
    }

    #[test]
    fn handles_carry_the_term_kind() {
        let mut interner = NodeInterner::new();
        let x = interner.variable("x");
        let lit = interner.literal("42");
        let blank = interner.blank(1);
        assert!(x.is_variable());
        assert!(lit.is_literal());
        assert!(blank.is_blank());
        assert_eq!(interner.term(x), &Term::Variable("x".to_string()));
        assert_eq!(interner.term(blank), &Term::Blank(1));
    }

    #[test]
    fn pattern_matching_treats_variables_as_wildcards() {
        let mut interner = NodeInterner::new();
        let g = interner.iri("g");
        let alice = interner.iri("alice");
        let knows = interner.iri("knows");
        let bob = interner.iri("bob");
        let x = interner.variable("x");

        let fact = Quad::new(alice, knows, bob, g);
        let pattern = Quad::new(x, knows, bob, g);
        assert!(fact.is_ground());
        assert!(!pattern.is_ground());
        assert!(pattern.matches(&fact));
        assert!(!Quad::new(bob, knows, x, g).matches(&fact));
    }

    #[test]
    fn literal_rejected_outside_object_position() {
        let mut interner = NodeInterner::new();
        let g = interner.iri("g");
        let s = interner.iri("s");
        let lit = interner.literal("42");
        let x = interner.variable("x");

        let bad = Quad::new(s, lit, x, g);
        assert_eq!(
            check_pattern(&bad),
            Err(PatternError::UnsupportedNode {
                field: QuadField::Property,
                kind: "a literal",
            })
        );
        assert!(check_pattern(&Quad::new(s, g, lit, g)).is_ok());
    }

    #[test]
    fn blank_node_rejected_as_property() {
        let mut interner = NodeInterner::new();
        let g = interner.iri("g");
        let blank = interner.blank(7);
        let o = interner.iri("o");

        let bad = Quad::new(blank, blank, o, g);
        assert_eq!(
            check_pattern(&bad),
            Err(PatternError::UnsupportedNode {
                field: QuadField::Property,
                kind: "a blank node",
            })
        );
        assert!(check_pattern(&Quad::new(blank, o, blank, g)).is_ok());
    }
}
