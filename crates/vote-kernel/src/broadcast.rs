//! Debounced broadcaster: collapses bursts of updates into one publish.
//!
//! Every signal restarts a quiet-period timer. When the timer runs out with
//! no further signal, the publish callback runs once with the last value
//! carried by a signal in that burst (or `None` if every signal was a bare
//! [`Signal::Changed`], in which case the callback re-reads current state).
//! A burst that never goes quiet is still flushed once `max_wait` has passed
//! since its first signal.

use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// An update for the broadcaster.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    /// Something changed; the publisher should read the current state.
    Changed,
    /// Something changed and this is the new value.
    Value(T),
}

/// Handle for signalling a debounced broadcaster. Cheap to clone.
#[derive(Debug)]
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<Signal<T>>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Debouncer<T> {
    /// Spawn a broadcaster task.
    ///
    /// The task exits once every handle is dropped, flushing a pending burst
    /// first.
    pub fn spawn<F>(
        name: impl Into<String>,
        window: Duration,
        max_wait: Duration,
        publish: F,
    ) -> (Self, JoinHandle<()>)
    where
        F: FnMut(Option<T>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run(name.into(), window, max_wait.max(window), rx, publish));
        (Self { tx }, worker)
    }

    pub fn changed(&self) {
        // A stopped broadcaster has nobody left to publish to.
        let _ = self.tx.send(Signal::Changed);
    }

    pub fn value(&self, value: T) {
        let _ = self.tx.send(Signal::Value(value));
    }
}

async fn run<T, F>(
    name: String,
    window: Duration,
    max_wait: Duration,
    mut rx: mpsc::UnboundedReceiver<Signal<T>>,
    mut publish: F,
) where
    F: FnMut(Option<T>) -> BoxFuture<'static, ()>,
{
    let mut last: Option<T> = None;
    let mut burst: usize = 0;

    loop {
        // Idle: wait for the first signal of a burst.
        let Some(first) = rx.recv().await else {
            break;
        };
        let started = Instant::now();
        absorb(first, &mut last);
        burst = 1;

        let mut closed = false;
        loop {
            let quiet_at = (Instant::now() + window).min(started + max_wait);
            tokio::select! {
                next = rx.recv() => match next {
                    Some(signal) => {
                        absorb(signal, &mut last);
                        burst += 1;
                    }
                    None => {
                        closed = true;
                        break;
                    }
                },
                _ = sleep_until(quiet_at) => break,
            }
        }

        trace!(broadcaster = %name, signals = burst, "Publishing debounced update");
        publish(last.take()).await;
        if closed {
            return;
        }
    }
    trace!(broadcaster = %name, last_burst = burst, "Broadcaster stopped");
}

fn absorb<T>(signal: Signal<T>, last: &mut Option<T>) {
    if let Signal::Value(value) = signal {
        *last = Some(value);
    }
}
