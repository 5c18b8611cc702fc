//! A single named policy: initial value, cached winner, comparator and hook.

use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use super::error::PolicyError;
use super::value::{PolicyValue, ValueType};

pub type Comparator = Arc<dyn Fn(&PolicyValue, &PolicyValue) -> Ordering + Send + Sync>;

/// Runs when a value is accepted for the policy. An `Err` rejects the value.
pub type ChangeHook = Arc<dyn Fn(&PolicyValue) -> Result<(), String> + Send + Sync>;

/// Larger integers and lexicographically larger strings are stronger.
/// Values of different types never beat each other.
pub fn default_comparator(a: &PolicyValue, b: &PolicyValue) -> Ordering {
    match (a, b) {
        (PolicyValue::Int(a), PolicyValue::Int(b)) => a.cmp(b),
        (PolicyValue::Str(a), PolicyValue::Str(b)) => a.cmp(b),
        _ => Ordering::Equal,
    }
}

pub struct PolicyModel {
    name: String,
    initial: PolicyValue,
    /// `None` until the first accepted vote, and again once every vote is gone.
    current: RwLock<Option<PolicyValue>>,
    comparator: Comparator,
    on_changed: Option<ChangeHook>,
}

impl PolicyModel {
    pub fn new(name: impl Into<String>, initial: impl Into<PolicyValue>) -> Self {
        Self {
            name: name.into(),
            initial: initial.into(),
            current: RwLock::new(None),
            comparator: Arc::new(default_comparator),
            on_changed: None,
        }
    }

    pub fn with_comparator(
        mut self,
        comparator: impl Fn(&PolicyValue, &PolicyValue) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.comparator = Arc::new(comparator);
        self
    }

    pub fn on_changed(
        mut self,
        hook: impl Fn(&PolicyValue) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.on_changed = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial(&self) -> &PolicyValue {
        &self.initial
    }

    pub fn value_type(&self) -> ValueType {
        self.initial.value_type()
    }

    /// The winning vote. Fails before any vote has been accepted.
    pub fn current(&self) -> Result<PolicyValue, PolicyError> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PolicyError::Uninitialized(self.name.clone()))
    }

    /// The winning vote, or the initial value when nobody voted.
    pub fn effective(&self) -> PolicyValue {
        self.current().unwrap_or_else(|_| self.initial.clone())
    }

    /// Replace the cached winner. Returns whether the effective value changed.
    pub(crate) fn set_current(&self, value: Option<PolicyValue>) -> bool {
        let before = self.effective();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = value;
        self.effective() != before
    }

    /// Strongest of `votes`, in recorded order. A challenger must be strictly
    /// stronger to win: the cached winner keeps a tie while it is still among
    /// `votes`, otherwise the earlier vote does.
    pub fn strongest<'a>(
        &self,
        votes: impl IntoIterator<Item = &'a PolicyValue>,
    ) -> Option<PolicyValue> {
        let votes: Vec<&PolicyValue> = votes.into_iter().collect();
        let incumbent = self
            .current()
            .ok()
            .filter(|current| votes.contains(&current));
        let mut winner: Option<&PolicyValue> = incumbent.as_ref();
        for vote in votes {
            match winner {
                Some(best) if (self.comparator)(vote, best) != Ordering::Greater => {}
                _ => winner = Some(vote),
            }
        }
        winner.cloned()
    }

    pub(crate) fn run_hook(&self, value: &PolicyValue) -> Result<(), PolicyError> {
        match &self.on_changed {
            Some(hook) => hook(value).map_err(|reason| PolicyError::Rejected {
                policy: self.name.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for PolicyModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyModel")
            .field("name", &self.name)
            .field("initial", &self.initial)
            .field("current", &self.current)
            .field("has_hook", &self.on_changed.is_some())
            .finish()
    }
}
