//! Team-facing broker variants.
//!
//! Each variant owns a plain [`Broker`](crate::broker::Broker) for
//! connections and routing, and keeps its own side state next to it. The
//! side state never influences routing; the coordinator reads it for
//! scoring and reporting.

pub mod attack;
pub mod defense;

pub use attack::{AttackBroker, AttackEvent, AttackStatistics, Target, TargetStatus};
pub use defense::{
    Alert, AlertDraft, AlertStatus, DefenseBroker, DefensePosture, DefenseStatistics,
    DetectionRule, IncidentEvent, IncidentSummary, MitigationAction, Severity,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// One timestamped entry in a variant's append-only log
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry<E> {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: E,
}

impl<E> LogEntry<E> {
    pub fn now(event: E) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

/// Last `n` entries of a log, oldest first.
pub(crate) fn tail<T: Clone>(entries: &[T], n: usize) -> Vec<T> {
    entries[entries.len().saturating_sub(n)..].to_vec()
}

/// Side-state bookkeeping errors
#[derive(Debug, Clone, PartialEq)]
pub enum SideStateError {
    NotFound { kind: &'static str, id: String },
    AlreadyExists { kind: &'static str, id: String },
    InvalidTransition {
        kind: &'static str,
        id: String,
        from: String,
        to: String,
    },
}

impl fmt::Display for SideStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideStateError::NotFound { kind, id } => write!(f, "{} '{}' not found", kind, id),
            SideStateError::AlreadyExists { kind, id } => {
                write!(f, "{} '{}' already exists", kind, id)
            }
            SideStateError::InvalidTransition { kind, id, from, to } => {
                write!(f, "{} '{}' cannot move from {} to {}", kind, id, from, to)
            }
        }
    }
}

impl std::error::Error for SideStateError {}
