use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{info, warn};

pub const SESSION_TRANSITIONS: &str = "kafka_consumer_session_transitions_total";
pub const SESSION_INVALID_TRANSITIONS: &str = "kafka_consumer_session_invalid_transitions_total";

/// Lifecycle of one consumer-group session.
///
/// ```text
/// Unassigned -> Joining -> Assigned -> Consuming -> Rebalancing -> Assigned | Unassigned
///                                                                        ... -> Closing -> Closed
/// ```
///
/// A failed session falls back to `Unassigned` and rejoins from there.
/// Every state but `Closed` can start closing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unassigned,
    Joining,
    Assigned(Vec<i32>),
    Consuming(Vec<i32>),
    Rebalancing,
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Subscribed, or rejoining after a failure
    Join,
    /// The coordinator handed us these partitions
    Assign(Vec<i32>),
    /// A message was delivered
    Consume,
    /// The coordinator is taking our partitions back
    Rebalance,
    /// Partitions revoked
    Revoke,
    /// The session errored out
    Fail,
    /// Cancellation fired
    Close,
    /// Left the group
    Finish,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no transition from {from} on {event:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub event: SessionEvent,
}

impl SessionState {
    pub fn on(self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Unassigned, E::Join) => Ok(S::Joining),
            (S::Joining | S::Rebalancing, E::Assign(partitions)) => Ok(S::Assigned(partitions)),
            (S::Assigned(partitions) | S::Consuming(partitions), E::Consume) => {
                Ok(S::Consuming(partitions))
            }
            (S::Assigned(_) | S::Consuming(_), E::Rebalance) => Ok(S::Rebalancing),
            (S::Rebalancing, E::Revoke) => Ok(S::Unassigned),
            (
                S::Unassigned | S::Joining | S::Assigned(_) | S::Consuming(_) | S::Rebalancing,
                E::Fail,
            ) => Ok(S::Unassigned),
            (
                S::Unassigned | S::Joining | S::Assigned(_) | S::Consuming(_) | S::Rebalancing,
                E::Close,
            ) => Ok(S::Closing),
            (S::Closing, E::Finish) => Ok(S::Closed),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Unassigned => "unassigned",
            SessionState::Joining => "joining",
            SessionState::Assigned(_) => "assigned",
            SessionState::Consuming(_) => "consuming",
            SessionState::Rebalancing => "rebalancing",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Assigned(partitions) | SessionState::Consuming(partitions) => {
                write!(f, "{}{:?}", self.name(), partitions)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Shared, thread-safe view of a session, driven both from librdkafka's
/// rebalance callbacks and from the consume loop.
#[derive(Clone)]
pub struct SessionTracker {
    topic: Arc<str>,
    state: Arc<Mutex<SessionState>>,
}

impl SessionTracker {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: Arc::from(topic),
            state: Arc::new(Mutex::new(SessionState::Unassigned)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn current(&self) -> SessionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Applies the event, returning the new state. Invalid transitions are
    /// logged and leave the state untouched.
    pub fn apply(&self, event: SessionEvent) -> Option<SessionState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = state.clone();
        match from.clone().on(event) {
            Ok(next) => {
                if next != from {
                    info!(topic = %self.topic, from = %from, to = %next, "consumer session transition");
                    metrics::counter!(SESSION_TRANSITIONS, "topic" => self.topic.to_string(), "state" => next.name())
                        .increment(1);
                }
                *state = next.clone();
                Some(next)
            }
            Err(err) => {
                warn!(topic = %self.topic, "ignoring session event: {}", err);
                metrics::counter!(SESSION_INVALID_TRANSITIONS, "topic" => self.topic.to_string())
                    .increment(1);
                None
            }
        }
    }

    /// Records a delivery. Only moves the state out of `Assigned`.
    pub fn mark_consuming(&self) {
        if matches!(self.current(), SessionState::Assigned(_)) {
            self.apply(SessionEvent::Consume);
        }
    }
}
