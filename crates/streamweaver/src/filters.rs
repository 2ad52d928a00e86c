//! Composable event filters.
//!
//! A filter is a pure predicate over events, modeled as a tagged variant
//! tree. Composition uses `&`, `|`, and `!` as constructor sugar; evaluation
//! short-circuits. Filtering happens at the subscriber boundary, never at
//! publish time, so replay stays correct across subscribers with different
//! filters.

use std::collections::HashSet;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};
use std::sync::Arc;

use crate::events::{EventType, EventVisibility, StreamEvent};

/// Predicate tree deciding which events a subscriber sees.
#[derive(Clone)]
pub enum EventFilter {
    /// Keep events whose visibility is in the set.
    Visibility(HashSet<EventVisibility>),
    /// Keep (`include == true`) or exclude events whose type is in the set.
    Types {
        /// Wire values of the matched types.
        types: HashSet<String>,
        /// Whether a match keeps or removes the event.
        include: bool,
    },
    /// Keep (`include == true`) or exclude events from the given sessions.
    Sessions {
        /// Matched session IDs.
        ids: HashSet<String>,
        /// Whether a match keeps or removes the event.
        include: bool,
    },
    /// Custom predicate.
    Predicate(Arc<dyn Fn(&StreamEvent) -> bool + Send + Sync>),
    /// Every child must accept.
    All(Vec<EventFilter>),
    /// At least one child must accept.
    Any(Vec<EventFilter>),
    /// Invert the child's decision.
    Not(Box<EventFilter>),
}

impl EventFilter {
    /// Keep events with any of the given visibility levels.
    #[must_use]
    pub fn visibility(levels: impl IntoIterator<Item = EventVisibility>) -> Self {
        Self::Visibility(levels.into_iter().collect())
    }

    /// Keep events of the given types.
    #[must_use]
    pub fn types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self::Types {
            types: types.into_iter().map(|t| t.as_str().to_string()).collect(),
            include: true,
        }
    }

    /// Exclude events of the given types.
    #[must_use]
    pub fn exclude_types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self::Types {
            types: types.into_iter().map(|t| t.as_str().to_string()).collect(),
            include: false,
        }
    }

    /// Keep events from the given sessions.
    #[must_use]
    pub fn sessions(ids: impl IntoIterator<Item = String>) -> Self {
        Self::Sessions { ids: ids.into_iter().collect(), include: true }
    }

    /// Exclude events from the given sessions.
    #[must_use]
    pub fn exclude_sessions(ids: impl IntoIterator<Item = String>) -> Self {
        Self::Sessions { ids: ids.into_iter().collect(), include: false }
    }

    /// Filter with a custom predicate.
    #[must_use]
    pub fn predicate(predicate: impl Fn(&StreamEvent) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(predicate))
    }

    /// Only `user_facing` events.
    #[must_use]
    pub fn user_facing() -> Self {
        Self::visibility([EventVisibility::UserFacing])
    }

    /// Everything a live UI renders: `user_facing` or `live_ui_only`.
    #[must_use]
    pub fn live_ui() -> Self {
        Self::visibility([EventVisibility::UserFacing, EventVisibility::LiveUiOnly])
    }

    /// Everything except heartbeats.
    #[must_use]
    pub fn no_heartbeat() -> Self {
        Self::exclude_types([EventType::Heartbeat])
    }

    /// Only workflow/step progress events.
    #[must_use]
    pub fn progress_only() -> Self {
        Self::types([
            EventType::WorkflowStarted,
            EventType::StepStarted,
            EventType::StepProgress,
            EventType::StepCompleted,
            EventType::WorkflowCompleted,
        ])
    }

    /// Decide whether an event passes this filter.
    ///
    /// Pure and side-effect-free; the same event always yields the same
    /// decision. `All`/`Any` short-circuit.
    #[must_use]
    pub fn matches(&self, event: &StreamEvent) -> bool {
        match self {
            Self::Visibility(levels) => levels.contains(&event.visibility),
            Self::Types { types, include } => {
                let hit = types.contains(event.event_type.as_str());
                if *include { hit } else { !hit }
            }
            Self::Sessions { ids, include } => {
                let hit = ids.contains(&event.session_id);
                if *include { hit } else { !hit }
            }
            Self::Predicate(predicate) => predicate(event),
            Self::All(children) => children.iter().all(|child| child.matches(event)),
            Self::Any(children) => children.iter().any(|child| child.matches(event)),
            Self::Not(inner) => !inner.matches(event),
        }
    }
}

impl BitAnd for EventFilter {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self::All(vec![self, rhs])
    }
}

impl BitOr for EventFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self::Any(vec![self, rhs])
    }
}

impl Not for EventFilter {
    type Output = Self;

    fn not(self) -> Self {
        Self::Not(Box::new(self))
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Visibility(levels) => f.debug_tuple("Visibility").field(levels).finish(),
            Self::Types { types, include } => f
                .debug_struct("Types")
                .field("types", types)
                .field("include", include)
                .finish(),
            Self::Sessions { ids, include } => f
                .debug_struct("Sessions")
                .field("ids", ids)
                .field("include", include)
                .finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
            Self::All(children) => f.debug_tuple("All").field(children).finish(),
            Self::Any(children) => f.debug_tuple("Any").field(children).finish(),
            Self::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
        }
    }
}
