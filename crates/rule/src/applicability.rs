//! Predicate result type shared by the boolean and scored rule families.

use serde::{Deserialize, Serialize};

/// The outcome of a rule's predicate.
///
/// Boolean rules return [`Applicability::Applies`] or
/// [`Applicability::DoesNotApply`]; scored rules return
/// [`Applicability::Score`] with a value in `[0, 1]`. A score applies
/// whenever it is greater than zero — there is no sampling step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Applicability {
    /// The rule's action should run.
    Applies,
    /// The rule's action should be skipped.
    DoesNotApply,
    /// A `[0, 1]` score; applies when strictly positive.
    Score(f64),
}

impl Applicability {
    /// Whether the engine should run the rule's action.
    #[must_use]
    pub fn is_applicable(self) -> bool {
        match self {
            Self::Applies => true,
            Self::DoesNotApply => false,
            Self::Score(p) => p > 0.0,
        }
    }
}

impl From<bool> for Applicability {
    fn from(applies: bool) -> Self {
        if applies { Self::Applies } else { Self::DoesNotApply }
    }
}

impl From<f64> for Applicability {
    fn from(score: f64) -> Self {
        Self::Score(score)
    }
}
