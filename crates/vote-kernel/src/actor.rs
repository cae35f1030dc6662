//! Serialized state actor: one task exclusively owns a state value and applies
//! submitted commands to it one at a time, in submission order.
//!
//! ```text
//! caller ── tell(cmd) ──────────────┐
//! caller ── ask(cmd) ─── reply ◄─┐  ▼
//!                                 │ mailbox (FIFO) ─► worker loop ─► &mut S
//! ```
//!
//! Commands may be asynchronous (`ask_async`), in which case the worker awaits
//! the command to completion before taking the next one. A command that reports
//! an [`ActorFault`] stops the worker: the fault is returned to that caller,
//! queued commands are dropped, and every later submission fails with
//! [`ActorError::Closed`]. A closed mailbox is final; callers must not resubmit.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Errors returned to callers submitting commands.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActorError {
    #[error("actor {0} mailbox is closed")]
    Closed(String),
    #[error("actor {name} faulted: {reason}")]
    Faulted { name: String, reason: String },
}

/// A fatal condition detected by a command (e.g. a broken invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorFault(pub String);

impl ActorFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl fmt::Display for ActorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the worker loop does after a command completes.
enum Flow {
    Continue,
    Stop,
    Fault(String),
}

type Job<S> = Box<dyn for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Flow> + Send>;

fn job<S, F>(f: F) -> Job<S>
where
    F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Flow> + Send + 'static,
{
    Box::new(f)
}

/// Handle for submitting commands to an actor. Cheap to clone.
pub struct ActorHandle<S> {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Job<S>>,
}

impl<S> Clone for ActorHandle<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<S> fmt::Debug for ActorHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorHandle")
            .field("name", &self.name)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<S: Send + 'static> ActorHandle<S> {
    /// Spawn a worker owning `state`.
    ///
    /// The returned join handle resolves to the final state once the actor
    /// stops, either through [`ActorHandle::stop`], a fault, or every handle
    /// being dropped.
    pub fn spawn(name: impl Into<String>, state: S) -> (Self, JoinHandle<S>) {
        let name: Arc<str> = Arc::from(name.into());
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(name.clone(), state, rx));
        (Self { name, tx }, worker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the worker has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn submit(&self, job: Job<S>) -> Result<(), ActorError> {
        self.tx.send(job).map_err(|_| self.closed())
    }

    fn closed(&self) -> ActorError {
        ActorError::Closed(self.name.to_string())
    }

    /// Fire-and-forget: enqueue a command and return immediately.
    pub fn tell<F>(&self, f: F) -> Result<(), ActorError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.submit(job(move |state| {
            async move {
                f(state);
                Flow::Continue
            }
            .boxed()
        }))
    }

    /// Run a synchronous command and wait for its result.
    pub async fn ask<R, F>(&self, f: F) -> Result<R, ActorError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(job(move |state| {
            async move {
                let _ = reply_tx.send(f(state));
                Flow::Continue
            }
            .boxed()
        }))?;
        reply_rx.await.map_err(|_| self.closed())
    }

    /// Run an asynchronous command and wait for its result.
    ///
    /// The actor processes nothing else while the command's future is pending.
    pub async fn ask_async<R, F>(&self, f: F) -> Result<R, ActorError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(job(move |state| {
            async move {
                let _ = reply_tx.send(f(state).await);
                Flow::Continue
            }
            .boxed()
        }))?;
        reply_rx.await.map_err(|_| self.closed())
    }

    /// Like [`ask_async`](Self::ask_async), but an `Err(ActorFault)` from the
    /// command stops the actor and is returned as [`ActorError::Faulted`].
    pub async fn ask_checked<R, F>(&self, f: F) -> Result<R, ActorError>
    where
        R: Send + 'static,
        F: for<'a> FnOnce(&'a mut S) -> BoxFuture<'a, Result<R, ActorFault>> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(job(move |state| {
            async move {
                match f(state).await {
                    Ok(value) => {
                        let _ = reply_tx.send(Ok(value));
                        Flow::Continue
                    }
                    Err(fault) => {
                        let _ = reply_tx.send(Err(fault.0.clone()));
                        Flow::Fault(fault.0)
                    }
                }
            }
            .boxed()
        }))?;
        match reply_rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(reason)) => Err(ActorError::Faulted {
                name: self.name.to_string(),
                reason,
            }),
            Err(_) => Err(self.closed()),
        }
    }

    /// Ask the worker to stop after the commands already queued.
    pub fn stop(&self) -> Result<(), ActorError> {
        self.submit(job(|_| async { Flow::Stop }.boxed()))
    }
}

async fn run<S>(name: Arc<str>, mut state: S, mut rx: mpsc::UnboundedReceiver<Job<S>>) -> S {
    debug!(actor = %name, "Actor started");
    while let Some(job) = rx.recv().await {
        match job(&mut state).await {
            Flow::Continue => {}
            Flow::Stop => {
                debug!(actor = %name, "Actor stopped");
                break;
            }
            Flow::Fault(reason) => {
                error!(actor = %name, reason = %reason, "Actor faulted, refusing further commands");
                break;
            }
        }
    }
    rx.close();
    // Dropping queued jobs drops their reply senders, failing their callers.
    while rx.try_recv().is_ok() {}
    state
}
