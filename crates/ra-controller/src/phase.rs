//! Phase transition table.
//!
//! Only the edges listed here may be committed. Returning to `Pending` is not
//! a transition: it happens only through an explicit restart, which also
//! bumps the record generation.

use ra_core::Phase;

/// Every allowed `(from, to)` edge.
pub const TRANSITIONS: &[(Phase, Phase)] = &[
    (Phase::Pending, Phase::Validating),
    (Phase::Validating, Phase::PreparingContext),
    (Phase::Validating, Phase::Failed),
    (Phase::PreparingContext, Phase::Investigating),
    (Phase::PreparingContext, Phase::Failed),
    (Phase::Investigating, Phase::EvaluatingConfidence),
    (Phase::Investigating, Phase::Failed),
    (Phase::EvaluatingConfidence, Phase::EvaluatingPolicy),
    (Phase::EvaluatingConfidence, Phase::Failed),
    (Phase::EvaluatingPolicy, Phase::Ready),
    (Phase::EvaluatingPolicy, Phase::Approving),
    (Phase::EvaluatingPolicy, Phase::Rejected),
    (Phase::EvaluatingPolicy, Phase::Failed),
    (Phase::Approving, Phase::Ready),
    (Phase::Approving, Phase::Rejected),
    (Phase::Approving, Phase::Failed),
];

/// Whether `from -> to` is an allowed edge.
pub fn can_transition(from: Phase, to: Phase) -> bool {
    TRANSITIONS.iter().any(|(f, t)| *f == from && *t == to)
}
