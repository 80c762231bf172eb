//! Handler election.
//!
//! Several handler candidates may be registered for one command type. The
//! election picks at most one of them, deterministically and independently of
//! registration order.
//!
//! Types taking part in the election are [`TypeKey`]s. Their relations are
//! declared explicitly in a [`TypeHierarchy`]: a command type is a subtype of
//! the "part" traits it implements (`dyn UserCommandPart`), a concrete result
//! is a subtype of the result traits it implements.
//!
//! # Rules
//!
//! Candidates are first filtered:
//!
//! 1. When an owning service is configured, other services' candidates are dropped.
//! 2. A candidate is *closed* when its parameter type is the command type itself.
//!    Unclosed candidates are dropped unless they allow it.
//! 3. When the command declares a result type, candidates whose return type is
//!    neither that type nor a subtype of it are dropped.
//!
//! The remaining candidates are ordered by domination: closed beats unclosed,
//! then the strictly more specific parameter type wins, then (same parameter)
//! the strictly more specific return type wins. The winner is the one candidate
//! dominating all others; anything else is an [`ElectionError`].

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Identity of a type taking part in handler election.
///
/// Trait objects are valid keys: `TypeKey::of::<dyn UserCommandPart>()`.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Key of `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Key from an already known identity.
    pub fn from_parts(id: TypeId, name: &'static str) -> Self {
        Self { id, name }
    }

    /// The `TypeId`.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// The Rust type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Declared supertype relations, closed transitively on lookup.
#[derive(Debug, Clone, Default)]
pub struct TypeHierarchy {
    supertypes: HashMap<TypeKey, Vec<TypeKey>>,
}

impl TypeHierarchy {
    /// Create an empty hierarchy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `sub` as a direct subtype of `sup`.
    ///
    /// Fails when the declaration would create a cycle.
    pub fn declare(&mut self, sub: TypeKey, sup: TypeKey) -> Result<(), HierarchyCycle> {
        if self.is_subtype(sup, sub) {
            return Err(HierarchyCycle { sub, sup });
        }
        let direct = self.supertypes.entry(sub).or_default();
        if !direct.contains(&sup) {
            direct.push(sup);
        }
        Ok(())
    }

    /// True when `sub` is `sup` or (transitively) one of its declared subtypes.
    pub fn is_subtype(&self, sub: TypeKey, sup: TypeKey) -> bool {
        if sub == sup {
            return true;
        }
        let mut seen = HashSet::new();
        let mut stack = vec![sub];
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(direct) = self.supertypes.get(&current) {
                for &s in direct {
                    if s == sup {
                        return true;
                    }
                    stack.push(s);
                }
            }
        }
        false
    }

    /// True when `sub` is a subtype of `sup` and differs from it.
    pub fn is_strict_subtype(&self, sub: TypeKey, sup: TypeKey) -> bool {
        sub != sup && self.is_subtype(sub, sup)
    }

    /// True when one type is a subtype of the other.
    pub fn are_related(&self, a: TypeKey, b: TypeKey) -> bool {
        self.is_subtype(a, b) || self.is_subtype(b, a)
    }
}

/// A supertype declaration that would make the hierarchy cyclic.
#[derive(Debug, Clone, Error)]
#[error("declaring {sub} as a subtype of {sup} creates a cycle")]
pub struct HierarchyCycle {
    /// Declared subtype.
    pub sub: TypeKey,
    /// Declared supertype.
    pub sup: TypeKey,
}

/// What the election knows about one handler candidate.
#[derive(Debug, Clone)]
pub struct CandidateSignature {
    /// Service (owner) of the handler method.
    pub service: String,
    /// Handler method name.
    pub method: String,
    /// Declared parameter type.
    pub parameter: TypeKey,
    /// Declared return type.
    pub returns: TypeKey,
    /// Accept the candidate even when its parameter is not the command type.
    pub allow_unclosed: bool,
}

impl CandidateSignature {
    /// `service::method`, for logs and errors.
    pub fn label(&self) -> String {
        format!("{}::{}", self.service, self.method)
    }
}

/// Why two candidates could not be ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// Same closedness, same parameter type and same return type.
    IdenticalSignatures,
    /// Same closedness, parameter types not related to each other.
    UnrelatedParameterTypes,
    /// Same parameter type, return types not related to each other.
    UnrelatedReturnTypes,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictReason::IdenticalSignatures => write!(f, "identical signatures"),
            ConflictReason::UnrelatedParameterTypes => write!(f, "unrelated parameter types"),
            ConflictReason::UnrelatedReturnTypes => write!(f, "unrelated return types"),
        }
    }
}

/// Two candidates of a command could not be ordered.
#[derive(Debug, Clone, Error)]
#[error("ambiguous handlers for {command}: {first} and {second} ({reason})")]
pub struct ElectionError {
    /// The command type.
    pub command: TypeKey,
    /// First conflicting candidate (`service::method`).
    pub first: String,
    /// Second conflicting candidate (`service::method`).
    pub second: String,
    /// Why they conflict.
    pub reason: ConflictReason,
}

/// Election input for one command type.
#[derive(Debug, Clone, Copy)]
pub struct ElectionInput<'a> {
    /// The command type (the "closure").
    pub command: TypeKey,
    /// Declared result type, for commands with result.
    pub result_type: Option<TypeKey>,
    /// Only candidates of this service are considered.
    pub owning_service: Option<&'a str>,
}

/// Elect the handler of a command.
///
/// Returns the index of the winner in `candidates`, or `None` when no
/// candidate survives the filters (the command is then not handled).
pub fn elect(
    hierarchy: &TypeHierarchy,
    input: ElectionInput<'_>,
    candidates: &[CandidateSignature],
) -> Result<Option<usize>, ElectionError> {
    let command = input.command;
    let viable: Vec<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| is_viable(hierarchy, &input, c))
        .map(|(i, _)| i)
        .collect();

    if viable.is_empty() {
        debug!(%command, candidates = candidates.len(), "no viable handler candidate");
        return Ok(None);
    }

    let dominates = |a: usize, b: usize| {
        domination(hierarchy, command, &candidates[a], &candidates[b]) == Ordering::Dominates
    };

    // Maximal candidates: not dominated by any other viable candidate.
    let mut maximal: Vec<usize> = viable
        .iter()
        .copied()
        .filter(|&a| !viable.iter().any(|&b| b != a && dominates(b, a)))
        .collect();

    if maximal.len() == 1 {
        let winner = maximal[0];
        debug!(%command, handler = %candidates[winner].label(), "handler elected");
        return Ok(Some(winner));
    }

    // Report the same pair whatever the registration order.
    maximal.sort_by_key(|&i| candidates[i].label());
    let (a, b) = (&candidates[maximal[0]], &candidates[maximal[1]]);
    let reason = if a.parameter != b.parameter {
        ConflictReason::UnrelatedParameterTypes
    } else if a.returns == b.returns {
        ConflictReason::IdenticalSignatures
    } else {
        ConflictReason::UnrelatedReturnTypes
    };

    Err(ElectionError {
        command,
        first: a.label(),
        second: b.label(),
        reason,
    })
}

fn is_viable(hierarchy: &TypeHierarchy, input: &ElectionInput<'_>, c: &CandidateSignature) -> bool {
    let command = input.command;

    if let Some(owner) = input.owning_service {
        if c.service != owner {
            info!(
                %command,
                handler = %c.label(),
                owner,
                "handler candidate ignored: not the owning service"
            );
            return false;
        }
    }

    if c.parameter != command && !c.allow_unclosed {
        warn!(
            %command,
            handler = %c.label(),
            parameter = %c.parameter,
            "handler candidate ignored: parameter is not the closed command type"
        );
        return false;
    }

    if !hierarchy.is_subtype(command, c.parameter) {
        warn!(
            %command,
            handler = %c.label(),
            parameter = %c.parameter,
            "handler candidate ignored: parameter does not accept the command"
        );
        return false;
    }

    if let Some(result) = input.result_type {
        if !hierarchy.is_subtype(c.returns, result) {
            warn!(
                %command,
                handler = %c.label(),
                returns = %c.returns,
                expected = %result,
                "handler candidate ignored: incompatible return type"
            );
            return false;
        }
    }

    true
}

#[derive(Debug, PartialEq, Eq)]
enum Ordering {
    Dominates,
    DominatedOrUnordered,
}

fn domination(
    hierarchy: &TypeHierarchy,
    command: TypeKey,
    a: &CandidateSignature,
    b: &CandidateSignature,
) -> Ordering {
    let a_closed = a.parameter == command;
    let b_closed = b.parameter == command;
    let wins = if a_closed != b_closed {
        a_closed
    } else if a.parameter != b.parameter {
        hierarchy.is_strict_subtype(a.parameter, b.parameter)
    } else {
        hierarchy.is_strict_subtype(a.returns, b.returns)
    };
    if wins {
        Ordering::Dominates
    } else {
        Ordering::DominatedOrUnordered
    }
}
