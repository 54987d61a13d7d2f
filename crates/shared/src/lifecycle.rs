//! Mission lifecycle as an explicit directed graph.
//!
//! The canonical path runs DRAFT through CLOSED. On top of it the graph allows
//! cancellation from every non-terminal status and a short list of named
//! backward exceptions. Anything not in the graph is illegal. The backend
//! evaluates this graph authoritatively; clients use it for display hints only.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::domain::MissionStatus;

pub const CANONICAL_ORDER: [MissionStatus; 11] = [
    MissionStatus::Draft,
    MissionStatus::Published,
    MissionStatus::Accepted,
    MissionStatus::Planned,
    MissionStatus::EnRoute,
    MissionStatus::InProgress,
    MissionStatus::Done,
    MissionStatus::Billable,
    MissionStatus::Billed,
    MissionStatus::Paid,
    MissionStatus::Closed,
];

pub const DEFAULT_BACKWARD_EXCEPTIONS: [(MissionStatus, MissionStatus); 3] = [
    (MissionStatus::Published, MissionStatus::Draft),
    (MissionStatus::EnRoute, MissionStatus::Planned),
    (MissionStatus::InProgress, MissionStatus::Planned),
];

impl MissionStatus {
    /// Suggested next step along the canonical order.
    pub fn next(&self) -> Option<MissionStatus> {
        let position = CANONICAL_ORDER.iter().position(|status| status == self)?;
        CANONICAL_ORDER.get(position + 1).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionRejection {
    #[error("mission is already in status {0}")]
    Unchanged(MissionStatus),
    #[error("status {0} is terminal")]
    FromTerminal(MissionStatus),
    #[error("transition from {from} to {to} is not allowed")]
    NotAllowed {
        from: MissionStatus,
        to: MissionStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionGraph {
    edges: HashMap<MissionStatus, BTreeSet<MissionStatus>>,
}

impl Default for TransitionGraph {
    fn default() -> Self {
        Self::standard()
    }
}

impl TransitionGraph {
    /// Canonical forward edges plus cancellation, without backward exceptions.
    pub fn forward_only() -> Self {
        let mut graph = Self {
            edges: HashMap::new(),
        };
        for pair in CANONICAL_ORDER.windows(2) {
            graph.insert(pair[0], pair[1]);
        }
        for status in MissionStatus::ALL {
            if !status.is_terminal() {
                graph.insert(*status, MissionStatus::Cancelled);
            }
        }
        graph
    }

    pub fn standard() -> Self {
        DEFAULT_BACKWARD_EXCEPTIONS
            .iter()
            .fold(Self::forward_only(), |graph, (from, to)| {
                graph.with_exception(*from, *to)
            })
    }

    /// Adds one explicitly permitted edge. Edges out of terminal statuses and
    /// self-loops are ignored so the terminal guarantee cannot be configured away.
    pub fn with_exception(mut self, from: MissionStatus, to: MissionStatus) -> Self {
        if from != to && !from.is_terminal() {
            self.insert(from, to);
        }
        self
    }

    fn insert(&mut self, from: MissionStatus, to: MissionStatus) {
        self.edges
            .entry(from)
            .or_default()
            .insert(to);
    }

    pub fn is_allowed(&self, from: MissionStatus, to: MissionStatus) -> bool {
        self.edges
            .get(&from)
            .is_some_and(|targets| targets.contains(&to))
    }

    pub fn allowed_from(&self, from: MissionStatus) -> Vec<MissionStatus> {
        self.edges
            .get(&from)
            .map(|targets| targets.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn check(&self, from: MissionStatus, to: MissionStatus) -> Result<(), TransitionRejection> {
        if from == to {
            return Err(TransitionRejection::Unchanged(from));
        }
        if from.is_terminal() {
            return Err(TransitionRejection::FromTerminal(from));
        }
        if !self.is_allowed(from, to) {
            return Err(TransitionRejection::NotAllowed { from, to });
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
