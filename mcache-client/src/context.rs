//! # Request Context
//!
//! Purpose: Carry a deadline and a cancellation signal through every call,
//! so pool waits, dials and socket I/O all stop at the same moment.
//!
//! ## Design Principles
//! 1. **Value Semantics**: `Context` is cheap to clone; derived contexts keep
//!    the parent's signal and the earlier deadline.
//! 2. **Disconnect as Signal**: Cancellation drops the only sender of a
//!    zero-capacity channel, which wakes every `select!` waiting on it.
//! 3. **Composable Timeouts**: `io_deadline` folds an operation timeout into
//!    the context deadline.
//! 4. **Scope Tree**: Nested cancel scopes register with their parent and are
//!    canceled by it, so deriving a context never spawns a thread.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;

use mcache_common::{McError, McResult};

/// Deadline and cancellation scope of a request.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    done: Option<Receiver<()>>,
    scope: Option<Weak<Scope>>,
}

impl Context {
    /// A context that never expires and cannot be canceled.
    pub fn background() -> Self {
        Context::default()
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        };
        Context {
            deadline: Some(deadline),
            done: self.done.clone(),
            scope: self.scope.clone(),
        }
    }

    /// Derives a cancelable context.
    ///
    /// Dropping every clone of the returned handle also cancels it, and so
    /// does canceling any ancestor scope.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let (tx, rx) = crossbeam_channel::bounded::<()>(0);
        let scope = Arc::new(Scope {
            state: Mutex::new(ScopeState {
                tx: Some(tx),
                children: Vec::new(),
            }),
        });
        if self.done.is_some() {
            let registered = self
                .scope
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|parent| parent.register(&scope));
            if !registered {
                scope.cancel();
            }
        }
        let ctx = Context {
            deadline: self.deadline,
            done: Some(rx),
            scope: Some(Arc::downgrade(&scope)),
        };
        (ctx, CancelHandle { scope })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_canceled(&self) -> bool {
        match &self.done {
            Some(done) => matches!(done.try_recv(), Err(TryRecvError::Disconnected)),
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The context error once it is done, cancellation first.
    pub fn err(&self) -> Option<McError> {
        if self.is_canceled() {
            Some(McError::Canceled)
        } else if self.is_expired() {
            Some(McError::DeadlineExceeded)
        } else {
            None
        }
    }

    pub fn check(&self) -> McResult<()> {
        match self.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// `min(deadline, now + op_timeout)`; a zero timeout means unbounded.
    pub fn io_deadline(&self, op_timeout: Duration) -> Option<Instant> {
        let op = (!op_timeout.is_zero()).then(|| Instant::now() + op_timeout);
        match (self.deadline, op) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Replaces transport errors with the context error when the context is done.
    pub(crate) fn classify(&self, err: McError) -> McError {
        match err {
            McError::Io(_) => self.err().unwrap_or(err),
            other => other,
        }
    }

    /// Channel that disconnects on cancellation; never fires otherwise.
    pub(crate) fn done_chan(&self) -> Receiver<()> {
        self.done.clone().unwrap_or_else(crossbeam_channel::never)
    }

    /// Channel that fires at the deadline; never fires without one.
    pub(crate) fn deadline_chan(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }

    pub(crate) fn cancel_signal(&self) -> Option<Receiver<()>> {
        self.done.clone()
    }
}

/// Cancels the contexts derived from one `with_cancel` call.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    scope: Arc<Scope>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.scope.cancel();
    }
}

/// One cancel scope: the sender behind its contexts' `done` channel, plus
/// the scopes derived from it.
#[derive(Debug)]
struct Scope {
    state: Mutex<ScopeState>,
}

#[derive(Debug)]
struct ScopeState {
    tx: Option<Sender<()>>,
    children: Vec<Weak<Scope>>,
}

impl Scope {
    /// Adds `child` unless this scope is already canceled.
    fn register(&self, child: &Arc<Scope>) -> bool {
        let mut state = self.state.lock();
        if state.tx.is_none() {
            return false;
        }
        state.children.retain(|c| c.strong_count() > 0);
        state.children.push(Arc::downgrade(child));
        true
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.state.lock();
            state.tx.take();
            std::mem::take(&mut state.children)
        };
        // Children are canceled outside the lock.
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        self.cancel();
    }
}
