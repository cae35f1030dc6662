//! Starvation-bounded gate: scheduled (high-priority) work waits behind at most
//! one ad-hoc (low-priority) critical section, however many ad-hoc callers are
//! queued.
//!
//! Three mutexes are composed per protected value:
//!
//! ```text
//! low  acquire: outer → next_access → data, release next_access
//! low  release: data, then outer
//! high acquire:         next_access → data, release next_access
//! high release: data
//! ```
//!
//! `outer` admits one low-priority caller at a time; high-priority callers skip
//! it, so the only thing ahead of them on `data` is the single low-priority
//! caller already past `outer`. tokio mutexes are FIFO, which makes the bound
//! hold under contention.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// A value protected by the three-tier priority scheme.
#[derive(Debug)]
pub struct PriorityGate<T> {
    outer: Arc<Mutex<()>>,
    next_access: Mutex<()>,
    data: Arc<Mutex<T>>,
}

impl<T> PriorityGate<T> {
    pub fn new(value: T) -> Self {
        Self {
            outer: Arc::new(Mutex::new(())),
            next_access: Mutex::new(()),
            data: Arc::new(Mutex::new(value)),
        }
    }

    /// Acquire for ad-hoc work (e.g. a vote bumping a volume counter).
    pub async fn lock_low(&self) -> LowPriorityGuard<T> {
        let outer = self.outer.clone().lock_owned().await;
        let next = self.next_access.lock().await;
        let data = self.data.clone().lock_owned().await;
        drop(next);
        LowPriorityGuard {
            data,
            _outer: outer,
        }
    }

    /// Acquire for scheduled work (e.g. the periodic price tick).
    pub async fn lock_high(&self) -> HighPriorityGuard<T> {
        let next = self.next_access.lock().await;
        let data = self.data.clone().lock_owned().await;
        drop(next);
        HighPriorityGuard { data }
    }
}

/// Low-priority access. Dropping releases `data` before `outer`.
pub struct LowPriorityGuard<T> {
    // Field order is drop order.
    data: OwnedMutexGuard<T>,
    _outer: OwnedMutexGuard<()>,
}

impl<T> Deref for LowPriorityGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for LowPriorityGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// High-priority access. Dropping releases `data`.
pub struct HighPriorityGuard<T> {
    data: OwnedMutexGuard<T>,
}

impl<T> Deref for HighPriorityGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for HighPriorityGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

/// Acquire every gate at high priority, one at a time in key order.
///
/// Every batch locker walks the keys in the same order, so two batches can
/// never each hold a gate the other is waiting for. Dropping the returned map
/// releases them all.
pub async fn lock_all_high<K, T>(
    gates: &HashMap<K, Arc<PriorityGate<T>>>,
) -> HashMap<K, HighPriorityGuard<T>>
where
    K: Eq + Hash + Ord + Clone,
{
    let mut ordered: Vec<(&K, &Arc<PriorityGate<T>>)> = gates.iter().collect();
    ordered.sort_by(|a, b| a.0.cmp(b.0));

    let mut guards = HashMap::with_capacity(ordered.len());
    for (key, gate) in ordered {
        guards.insert(key.clone(), gate.lock_high().await);
    }
    guards
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::Instant;

    const CRITICAL_SECTION: Duration = Duration::from_millis(50);

    #[tokio::test(start_paused = true)]
    async fn test_high_priority_waits_for_at_most_one_low_section() {
        for backlog in [0usize, 1, 4, 16] {
            let gate = Arc::new(PriorityGate::new(0u64));

            let mut lows = Vec::new();
            for _ in 0..backlog {
                let gate = gate.clone();
                lows.push(tokio::spawn(async move {
                    let mut guard = gate.lock_low().await;
                    tokio::time::sleep(CRITICAL_SECTION).await;
                    *guard += 1;
                    Instant::now()
                }));
            }
            // Let the first low-priority caller get inside its section.
            tokio::time::sleep(Duration::from_millis(1)).await;

            let started = Instant::now();
            {
                let mut guard = gate.lock_high().await;
                *guard += 1000;
            }
            let waited = started.elapsed();
            assert!(
                waited <= CRITICAL_SECTION,
                "backlog {backlog}: high priority waited {waited:?}"
            );

            for low in lows {
                low.await.unwrap();
            }
            assert_eq!(*gate.lock_high().await, 1000 + backlog as u64);
        }
    }

    #[tokio::test]
    async fn test_low_priority_callers_are_mutually_exclusive() {
        let gate = Arc::new(PriorityGate::new(Vec::<usize>::new()));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                let mut guard = gate.lock_low().await;
                let before = guard.len();
                tokio::task::yield_now().await;
                guard.push(i);
                assert_eq!(guard.len(), before + 1);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(gate.lock_low().await.len(), 32);
    }

    #[tokio::test]
    async fn test_lock_all_high_reserves_every_gate() {
        let mut gates = HashMap::new();
        for key in ["a", "b", "c"] {
            gates.insert(key, Arc::new(PriorityGate::new(0i64)));
        }

        let mut guards = lock_all_high(&gates).await;
        assert_eq!(guards.len(), 3);
        for guard in guards.values_mut() {
            **guard += 1;
        }

        let gate_a = gates["a"].clone();
        let blocked = tokio::spawn(async move { *gate_a.lock_low().await });
        tokio::task::yield_now().await;
        assert!(!blocked.is_finished());

        drop(guards);
        assert_eq!(blocked.await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_batch_lockers_never_deadlock() {
        let gates: Arc<HashMap<u32, Arc<PriorityGate<u64>>>> = Arc::new(
            (0..64)
                .map(|key| (key, Arc::new(PriorityGate::new(0u64))))
                .collect(),
        );

        let mut batches = Vec::new();
        for _ in 0..8 {
            let gates = gates.clone();
            batches.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let mut guards = lock_all_high(gates.as_ref()).await;
                    for guard in guards.values_mut() {
                        **guard += 1;
                    }
                }
            }));
        }
        let all = futures::future::join_all(batches);
        let finished = tokio::time::timeout(Duration::from_secs(10), all)
            .await
            .expect("batch lockers deadlocked");
        for batch in finished {
            batch.unwrap();
        }

        for gate in gates.values() {
            assert_eq!(*gate.lock_high().await, 8 * 50);
        }
    }
}
