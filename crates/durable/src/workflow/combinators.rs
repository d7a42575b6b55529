//! Await-all and await-any bookkeeping for workflow state machines
//!
//! Workflows schedule several actions in one handler and then receive
//! their outcomes one by one. These helpers track which outcomes are still
//! outstanding:
//! - [`FanIn`] resumes once every branch has resolved (await-all)
//! - [`Race`] admits exactly one winner (await-any)
//!
//! Both are plain data driven from handler calls, so they replay exactly
//! like the rest of the workflow state.

use std::collections::HashMap;

/// Await-all over a set of branch ids
///
/// Results are accepted in any order and handed back in declaration
/// order, so every result stays bound to the branch that produced it.
///
/// ```
/// use reelflow_durable::FanIn;
///
/// let mut fan_in = FanIn::new();
/// fan_in.expect("transcode-1000");
/// fan_in.expect("transcode-2000");
///
/// assert!(fan_in.resolve("transcode-2000", "b.mp4"));
/// assert!(!fan_in.is_complete());
/// assert!(fan_in.resolve("transcode-1000", "a.mp4"));
///
/// let results: Vec<_> = fan_in.into_results().into_iter().map(|(_, r)| r).collect();
/// assert_eq!(results, vec!["a.mp4", "b.mp4"]);
/// ```
#[derive(Debug, Clone)]
pub struct FanIn<T> {
    declared: Vec<String>,
    resolved: HashMap<String, T>,
    completion_order: Vec<String>,
}

impl<T> Default for FanIn<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FanIn<T> {
    /// Create an empty fan-in
    pub fn new() -> Self {
        Self {
            declared: Vec::new(),
            resolved: HashMap::new(),
            completion_order: Vec::new(),
        }
    }

    /// Register a branch that must resolve before the fan-in completes
    pub fn expect(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !self.declared.contains(&id) {
            self.declared.push(id);
        }
    }

    /// Whether `id` is one of the registered branches
    pub fn contains(&self, id: &str) -> bool {
        self.declared.iter().any(|d| d == id)
    }

    /// Record the result for a branch
    ///
    /// Returns `false` for unknown branches or a second result for the same
    /// branch; the first result is kept.
    pub fn resolve(&mut self, id: &str, value: T) -> bool {
        if !self.contains(id) || self.resolved.contains_key(id) {
            return false;
        }
        self.resolved.insert(id.to_string(), value);
        self.completion_order.push(id.to_string());
        true
    }

    /// Number of branches still outstanding
    pub fn pending(&self) -> usize {
        self.declared.len() - self.resolved.len()
    }

    /// True once every registered branch has resolved
    pub fn is_complete(&self) -> bool {
        self.pending() == 0
    }

    /// Branch ids in the order their results arrived
    pub fn completion_order(&self) -> &[String] {
        &self.completion_order
    }

    /// Consume the fan-in, yielding results in declaration order
    ///
    /// Branches that never resolved are skipped.
    pub fn into_results(mut self) -> Vec<(String, T)> {
        self.declared
            .into_iter()
            .filter_map(|id| self.resolved.remove(&id).map(|value| (id, value)))
            .collect()
    }
}

/// Await-any over a set of branch ids
///
/// The first branch to resolve wins; every later resolution is rejected,
/// which is what makes a timer-versus-event race exclusive.
#[derive(Debug, Clone, Default)]
pub struct Race {
    branches: Vec<String>,
    winner: Option<String>,
}

impl Race {
    /// Create a race between the given branches
    pub fn new<I, S>(branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            branches: branches.into_iter().map(Into::into).collect(),
            winner: None,
        }
    }

    /// Try to resolve the race with `id`; returns true only for the winner
    pub fn resolve(&mut self, id: &str) -> bool {
        if self.winner.is_some() || !self.branches.iter().any(|b| b == id) {
            return false;
        }
        self.winner = Some(id.to_string());
        true
    }

    /// The winning branch, if decided
    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    /// Whether a winner has been chosen
    pub fn is_decided(&self) -> bool {
        self.winner.is_some()
    }

    /// Branches that lost (empty until decided)
    pub fn losers(&self) -> impl Iterator<Item = &str> {
        let winner = self.winner.as_deref();
        self.branches
            .iter()
            .map(String::as_str)
            .filter(move |b| winner.is_some() && Some(*b) != winner)
    }
}
