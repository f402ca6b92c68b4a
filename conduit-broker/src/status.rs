//! Consumer and producer state machines.
//!
//! Every transition goes through [`StatusCell::set`] or [`StatusCell::fail`],
//! which keep the status and the last failure consistent: the failure text is
//! present exactly while the status is `Failed`.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::sync::lock;

/// A state machine value with distinguished idle and failed states.
pub trait Status: Copy + Eq + std::fmt::Debug + std::fmt::Display + Send + Sync + 'static {
    /// Connected, healthy and idle.
    const IDLE: Self;
    /// The last operation failed.
    const FAILED: Self;
}

/// State of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerStatus {
    /// Connecting to the broker.
    Connect,
    /// Connected, healthy and idle.
    Idle,
    /// Fetching records from the broker.
    Poll,
    /// Translating fetched records into events.
    Consume,
    /// Committing progress.
    Commit,
    /// Discarding progress and reconnecting.
    Rollback,
    /// The last operation failed.
    Failed,
}

impl Status for ConsumerStatus {
    const IDLE: Self = Self::Idle;
    const FAILED: Self = Self::Failed;
}

impl std::fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Idle => write!(f, "idle"),
            Self::Poll => write!(f, "poll"),
            Self::Consume => write!(f, "consume"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// State of a producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProducerStatus {
    /// Connecting to the broker.
    Connect,
    /// Connected, healthy and idle.
    Idle,
    /// Sending an event.
    Send,
    /// Flushing or committing a transaction.
    Commit,
    /// Aborting a transaction.
    Rollback,
    /// The last operation failed.
    Failed,
}

impl Status for ProducerStatus {
    const IDLE: Self = Self::Idle;
    const FAILED: Self = Self::Failed;
}

impl std::fmt::Display for ProducerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Idle => write!(f, "idle"),
            Self::Send => write!(f, "send"),
            Self::Commit => write!(f, "commit"),
            Self::Rollback => write!(f, "rollback"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug)]
struct State<S> {
    status: S,
    last_failure: Option<String>,
}

/// Guarded holder of a status and the failure that caused it.
#[derive(Debug)]
pub struct StatusCell<S> {
    state: Mutex<State<S>>,
}

impl<S: Status> StatusCell<S> {
    pub fn new(initial: S) -> Self {
        Self {
            state: Mutex::new(State {
                status: initial,
                last_failure: None,
            }),
        }
    }

    pub fn get(&self) -> S {
        lock(&self.state).status
    }

    /// Failure description, present only while the status is failed.
    pub fn last_failure(&self) -> Option<String> {
        lock(&self.state).last_failure.clone()
    }

    /// Move to `status`; leaving the failed state clears the failure.
    pub fn set(&self, status: S) {
        let mut state = lock(&self.state);
        state.status = status;
        if status != S::FAILED {
            state.last_failure = None;
        }
    }

    /// Move to the failed state and record why.
    pub fn fail(&self, failure: impl Into<String>) {
        let mut state = lock(&self.state);
        state.status = S::FAILED;
        state.last_failure = Some(failure.into());
    }
}
