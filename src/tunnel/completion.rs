//! Completion handles
//!
//! A [`Completion`] is the eventual outcome of one asynchronous operation
//! such as a connect, a write or a close. Clones share the same outcome:
//! any of them may block on it or register listeners, and the first call to
//! `succeed` or `fail` settles it for good.
//!
//! [`CompletionAggregator`] folds any number of child completions into one
//! parent that succeeds when all children succeed and otherwise fails with
//! the first failure observed.

use super::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Listener = Box<dyn FnOnce(&Result<()>) + Send>;

#[derive(Default)]
struct State {
    outcome: Option<Result<()>>,
    listeners: Vec<Listener>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    done: Condvar,
}

/// Shared handle to the outcome of an asynchronous operation
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    /// Create a pending completion
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a completion that has already succeeded
    pub fn succeeded() -> Self {
        let completion = Self::new();
        completion.succeed();
        completion
    }

    /// Create a completion that has already failed
    pub fn failed(err: Error) -> Self {
        let completion = Self::new();
        completion.fail(err);
        completion
    }

    /// Mark the operation successful
    ///
    /// Returns false if the completion was already settled.
    pub fn succeed(&self) -> bool {
        self.settle(Ok(()))
    }

    /// Mark the operation failed
    ///
    /// Returns false if the completion was already settled.
    pub fn fail(&self, err: Error) -> bool {
        self.settle(Err(err))
    }

    /// Settle with an existing outcome
    pub fn complete(&self, outcome: Result<()>) -> bool {
        self.settle(outcome)
    }

    fn settle(&self, outcome: Result<()>) -> bool {
        let listeners = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(outcome.clone());
            self.inner.done.notify_all();
            std::mem::take(&mut state.listeners)
        };

        // Listeners run outside the lock so they may touch this completion.
        for listener in listeners {
            listener(&outcome);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Ok(())))
    }

    /// The outcome, if settled
    pub fn outcome(&self) -> Option<Result<()>> {
        self.inner.state.lock().outcome.clone()
    }

    /// Block until settled
    pub fn wait(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            self.inner.done.wait(&mut state);
        }
    }

    /// Block until settled or `timeout` elapses
    ///
    /// Returns `Error::Timeout` if the operation is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return state.outcome.clone().unwrap_or(Err(Error::Timeout));
            }
        }
    }

    /// Run `listener` once settled, immediately if already settled
    pub fn add_listener<F>(&self, listener: F)
    where
        F: FnOnce(&Result<()>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.outcome.clone() {
            Some(outcome) => {
                drop(state);
                listener(&outcome);
            }
            None => state.listeners.push(Box::new(listener)),
        }
    }

    /// Settle `other` with this completion's outcome once known
    pub fn forward_to(&self, other: Completion) {
        self.add_listener(move |outcome| {
            other.complete(outcome.clone());
        });
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Completion")
            .field("outcome", &state.outcome)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

struct AggregateState {
    pending: usize,
    first_failure: Option<Error>,
}

/// Combines child completions into one parent completion
///
/// The aggregator itself counts as one pending child until
/// [`finish`](Self::finish) is called, so children that settle while others
/// are still being added cannot complete the parent early.
pub struct CompletionAggregator {
    parent: Completion,
    shared: Arc<Mutex<AggregateState>>,
}

impl CompletionAggregator {
    pub fn new(parent: Completion) -> Self {
        CompletionAggregator {
            parent,
            shared: Arc::new(Mutex::new(AggregateState {
                pending: 1,
                first_failure: None,
            })),
        }
    }

    /// Track `child` as part of the aggregate
    pub fn add(&self, child: &Completion) {
        self.shared.lock().pending += 1;

        let shared = self.shared.clone();
        let parent = self.parent.clone();
        child.add_listener(move |outcome| {
            Self::settle_one(&shared, &parent, outcome.as_ref().err().cloned());
        });
    }

    /// Stop adding children; the parent settles once every child has
    pub fn finish(self) -> Completion {
        Self::settle_one(&self.shared, &self.parent, None);
        self.parent
    }

    fn settle_one(shared: &Mutex<AggregateState>, parent: &Completion, failure: Option<Error>) {
        let result = {
            let mut state = shared.lock();
            if let Some(err) = failure {
                state.first_failure.get_or_insert(err);
            }
            state.pending -= 1;
            if state.pending > 0 {
                return;
            }
            state.first_failure.take()
        };

        match result {
            None => parent.succeed(),
            Some(err) => parent.fail(err),
        };
    }
}
