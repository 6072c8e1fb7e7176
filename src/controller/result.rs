//! Aggregation of per-stage scheduling outcomes

use std::time::Duration;

use kube::runtime::controller::Action;

/// When the cluster should be reconciled again, independent of watch events
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the next change
    #[default]
    None,
    /// Reconcile again after the given delay
    After(Duration),
    /// Reconcile again right away
    Immediately,
}

impl Requeue {
    /// Combine two outcomes, keeping the one that asks for the earliest retry.
    pub fn merge(self, other: Requeue) -> Requeue {
        match (self, other) {
            (Requeue::Immediately, _) | (_, Requeue::Immediately) => Requeue::Immediately,
            (Requeue::After(a), Requeue::After(b)) => Requeue::After(a.min(b)),
            (Requeue::After(d), Requeue::None) | (Requeue::None, Requeue::After(d)) => {
                Requeue::After(d)
            }
            (Requeue::None, Requeue::None) => Requeue::None,
        }
    }

    /// Collapse any number of outcomes; an empty input waits for changes.
    pub fn merge_all<I: IntoIterator<Item = Requeue>>(outcomes: I) -> Requeue {
        outcomes.into_iter().fold(Requeue::None, Requeue::merge)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Requeue::None)
    }
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Action {
        match requeue {
            Requeue::None => Action::await_change(),
            Requeue::After(d) => Action::requeue(d),
            Requeue::Immediately => Action::requeue(Duration::ZERO),
        }
    }
}
