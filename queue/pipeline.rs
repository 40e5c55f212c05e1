// ========================================================================================
//
//                        THE MAP-REDUCE WORK QUEUE ENGINE
//
// ========================================================================================
//
// This module wires the two channels and the three kinds of execution unit
// that make up a running queue:
//
//     producer --(task channel)--> N workers --(result channel)--> 1 reducer
//
// The task channel is bounded at the caller-chosen capacity; a bound of zero
// is a rendezvous, so `submit` hands the task directly to a waiting worker and
// a fast producer is paced by the pool. The result channel is always a
// rendezvous: a worker blocks until the reducer is ready to take its result,
// and the reducer is the only thread that ever touches the accumulator, so the
// fold needs no locking.
//
// Shutdown is signalled by channel closure alone. `join` drops the task
// sender; each worker drains the closed queue, exits its loop, and drops its
// clone of the result sender; once the last clone is gone the reducer's `recv`
// disconnects and it returns the accumulator through its join handle.

use crate::config::BuildError;
use crate::types::{Fold, Lifecycle, Transform};
use crossbeam_channel::{Sender, bounded};
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// A running map-reduce work queue.
///
/// Built by [`Builder::start`](crate::config::Builder::start). Tasks of type
/// `T` go in through [`submit`](WorkQueue::submit); the accumulator of type
/// `A` comes back out of [`join`](WorkQueue::join) once every submitted task
/// has been transformed and folded.
#[derive(Debug)]
pub struct WorkQueue<T, A> {
    // `Some` while Running; taken by `join`, closing the queue.
    task_tx: Option<Sender<T>>,
    workers: Vec<JoinHandle<()>>,
    reducer: Option<JoinHandle<A>>,
    lifecycle: AtomicU8,
    submitted: AtomicU64,
    concurrency: usize,
    capacity: usize,
}

impl<T, A> WorkQueue<T, A>
where
    T: Send + 'static,
    A: Send + 'static,
{
    /// Spawns the reducer and the worker pool. The reducer goes first: a
    /// worker must never block handing off a result to a reducer that was
    /// never brought up.
    pub(crate) fn spawn<R>(
        capacity: usize,
        transform: Transform<T, R>,
        concurrency: usize,
        mut fold: Fold<A, R>,
        seed: A,
    ) -> Result<Self, BuildError>
    where
        R: Send + 'static,
    {
        let (task_tx, task_rx) = bounded::<T>(capacity);
        let (result_tx, result_rx) = bounded::<R>(0);

        let reducer = thread::Builder::new()
            .name("millrace-reducer".to_string())
            .spawn(move || {
                let mut acc = seed;
                let mut folded: u64 = 0;
                while let Ok(result) = result_rx.recv() {
                    acc = fold(acc, result);
                    folded += 1;
                }
                log::debug!("reducer exiting after {folded} folds");
                acc
            })
            .map_err(|source| BuildError::Spawn {
                role: "reducer",
                source,
            })?;

        let mut workers = Vec::with_capacity(concurrency);
        for id in 0..concurrency {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let transform = Arc::clone(&transform);
            let handle = thread::Builder::new()
                .name(format!("millrace-worker-{id}"))
                .spawn(move || {
                    let mut processed: u64 = 0;
                    while let Ok(task) = task_rx.recv() {
                        let result = transform(task);
                        if result_tx.send(result).is_err() {
                            // The reducer is gone; results have nowhere to go.
                            break;
                        }
                        processed += 1;
                    }
                    log::debug!("worker {id} exiting after {processed} tasks");
                })
                .map_err(|source| BuildError::Spawn {
                    role: "worker",
                    source,
                })?;
            workers.push(handle);
        }
        // The workers hold the only result senders now; the reducer must not
        // outlive them just because this handle kept a clone alive.
        drop(result_tx);

        log::debug!("work queue running: {concurrency} workers, task capacity {capacity}");

        Ok(Self {
            task_tx: Some(task_tx),
            workers,
            reducer: Some(reducer),
            lifecycle: AtomicU8::new(Lifecycle::Running.as_u8()),
            submitted: AtomicU64::new(0),
            concurrency,
            capacity,
        })
    }

    /// Hands one task to the pool, blocking while the task channel is at
    /// capacity (immediately, for a capacity of zero, until a worker is ready
    /// to receive).
    ///
    /// # Panics
    ///
    /// Panics if the queue is Draining or Completed: tasks are only accepted
    /// while Running, and a silently dropped task would violate the
    /// every-task-folded-exactly-once accounting. Also panics, instead of
    /// blocking forever, if every worker has died from an escaped transform
    /// fault.
    pub fn submit(&self, task: T) {
        match self.lifecycle() {
            Lifecycle::Running => {}
            state => {
                panic!("submit called on a {state:?} work queue; tasks are only accepted while Running")
            }
        }
        let task_tx = self
            .task_tx
            .as_ref()
            .expect("task sender is present while Running");
        if task_tx.send(task).is_err() {
            panic!("the worker pool is no longer accepting tasks; a worker transform panicked");
        }
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Closes the queue, waits for every in-flight and buffered task to be
    /// transformed and folded, and returns the final accumulator.
    ///
    /// Calling `join` transitions the instance to Draining as a side effect:
    /// no further tasks are accepted, but everything submitted before the call
    /// is guaranteed to be included in the returned value. In-flight work is
    /// never abandoned.
    ///
    /// # Panics
    ///
    /// Panics on a second call (Draining or Completed instance) rather than
    /// returning a stale value, and re-raises any panic that escaped a worker
    /// transform or the fold.
    pub fn join(&mut self) -> A {
        match self.lifecycle() {
            Lifecycle::Running => {}
            state => {
                panic!("join called on a {state:?} work queue; join must be called exactly once")
            }
        }
        self.set_lifecycle(Lifecycle::Draining);
        let submitted = self.submitted.load(Ordering::Relaxed);
        log::debug!(
            "draining work queue: {submitted} tasks submitted across {} workers",
            self.concurrency
        );

        // Closing the task channel is the drain signal: workers finish the
        // backlog and exit once `recv` disconnects.
        drop(self.task_tx.take());

        for worker in self.workers.drain(..) {
            if let Err(fault) = worker.join() {
                panic::resume_unwind(fault);
            }
        }

        let reducer = self
            .reducer
            .take()
            .expect("reducer handle is present until joined");
        let acc = match reducer.join() {
            Ok(acc) => acc,
            Err(fault) => panic::resume_unwind(fault),
        };

        self.set_lifecycle(Lifecycle::Completed);
        log::debug!("work queue completed: {submitted} tasks folded");
        acc
    }

    /// The resolved number of worker threads in the pool.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// The task channel capacity chosen at construction time.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of tasks accepted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Where this instance is in its Running -> Draining -> Completed life.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, state: Lifecycle) {
        self.lifecycle.store(state.as_u8(), Ordering::Release);
    }
}

impl<T, A> Drop for WorkQueue<T, A> {
    fn drop(&mut self) {
        // Dropping the senders lets the pool wind down on its own, but any
        // accumulated value is lost with the reducer handle.
        let state = Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire));
        if state != Lifecycle::Completed && !thread::panicking() {
            log::warn!(
                "work queue dropped without join; {} accepted tasks are abandoned",
                self.submitted.load(Ordering::Relaxed)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Builder;
    use crate::types::Lifecycle;
    use std::collections::HashMap;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn sums_a_thousand_tasks_across_ten_workers() {
        let mut wq = Builder::new(100)
            .worker(|t: u64| t, 10)
            .merger(|acc: u64, r| acc + r, 0)
            .start()
            .unwrap();

        for i in 0..1000 {
            wq.submit(i);
        }

        // Sum of 0..=999.
        assert_eq!(wq.join(), 499_500);
    }

    #[test]
    fn every_task_is_folded_exactly_once() {
        // Conservation must hold whether workers outnumber tasks or not.
        for concurrency in [1, 7, 64] {
            let mut wq = Builder::new(8)
                .worker(|t: u32| t, concurrency)
                .merger(|(sum, count): (u64, u64), r| (sum + u64::from(r), count + 1), (0, 0))
                .start()
                .unwrap();

            for i in 0..200u32 {
                wq.submit(i);
            }

            let (sum, count) = wq.join();
            assert_eq!(count, 200, "concurrency {concurrency} lost or duplicated work");
            assert_eq!(sum, 199 * 200 / 2);
            assert_eq!(wq.submitted(), 200);
        }
    }

    #[test]
    fn accumulation_is_independent_of_concurrency_and_submission_order() {
        let forward: Vec<u64> = (0..500).collect();
        let reversed: Vec<u64> = (0..500).rev().collect();
        let interleaved: Vec<u64> = (0..250).flat_map(|i| [i, 499 - i]).collect();

        let mut totals = Vec::new();
        for order in [&forward, &reversed, &interleaved] {
            for concurrency in [1, 8] {
                let mut wq = Builder::new(0)
                    .worker(|t: u64| t * 3, concurrency)
                    .merger(|acc: u64, r| acc + r, 0)
                    .start()
                    .unwrap();
                for &task in order {
                    wq.submit(task);
                }
                totals.push(wq.join());
            }
        }

        assert!(totals.windows(2).all(|w| w[0] == w[1]), "totals diverged: {totals:?}");
    }

    #[test]
    fn single_worker_preserves_submission_order() {
        // Only holds for concurrency 1: one worker dequeues FIFO and hands
        // each result over before taking the next task.
        let mut wq = Builder::new(0)
            .worker(
                |t: char| {
                    thread::sleep(Duration::from_millis(2));
                    t
                },
                1,
            )
            .merger(
                |mut acc: Vec<char>, r| {
                    acc.push(r);
                    acc
                },
                Vec::new(),
            )
            .start()
            .unwrap();

        for task in ['A', 'B', 'C'] {
            wq.submit(task);
        }

        assert_eq!(wq.join(), vec!['A', 'B', 'C']);
    }

    #[test]
    fn zero_capacity_applies_backpressure_to_the_producer() {
        let slow_worker = |t: u32| {
            thread::sleep(Duration::from_millis(25));
            t
        };

        let mut rendezvous = Builder::new(0)
            .worker(slow_worker, 1)
            .merger(|acc: u32, r| acc + r, 0)
            .start()
            .unwrap();
        let clock = Instant::now();
        for i in 0..4 {
            rendezvous.submit(i);
        }
        let rendezvous_elapsed = clock.elapsed();
        rendezvous.join();

        let mut buffered = Builder::new(8)
            .worker(slow_worker, 1)
            .merger(|acc: u32, r| acc + r, 0)
            .start()
            .unwrap();
        let clock = Instant::now();
        for i in 0..4 {
            buffered.submit(i);
        }
        let buffered_elapsed = clock.elapsed();
        buffered.join();

        // With a rendezvous channel the producer waits out the worker's sleep
        // between handoffs: at least three full 25ms services separate the
        // four submits. The buffered submits return as soon as the task is
        // queued.
        assert!(
            rendezvous_elapsed >= Duration::from_millis(60),
            "expected blocked submits, saw {rendezvous_elapsed:?}"
        );
        assert!(rendezvous_elapsed > buffered_elapsed);
    }

    #[test]
    fn folds_results_into_a_histogram() {
        let expected: HashMap<u16, u32> =
            [(200, 5), (206, 4), (401, 3), (403, 2), (405, 1)].into();

        let mut wq = Builder::new(0)
            .worker(|status: u16| status, 8)
            .merger(
                |mut acc: HashMap<u16, u32>, status| {
                    *acc.entry(status).or_insert(0) += 1;
                    acc
                },
                HashMap::new(),
            )
            .start()
            .unwrap();

        for (&status, &repeats) in &expected {
            for _ in 0..repeats {
                wq.submit(status);
            }
        }

        assert_eq!(wq.join(), expected);
    }

    #[test]
    fn lifecycle_is_observable_from_the_handle() {
        let mut wq = Builder::new(4)
            .worker(|t: u8| t, 2)
            .merger(|acc: u32, r| acc + u32::from(r), 0)
            .start()
            .unwrap();

        assert_eq!(wq.lifecycle(), Lifecycle::Running);
        assert_eq!(wq.concurrency(), 2);
        assert_eq!(wq.capacity(), 4);

        wq.submit(1);
        wq.join();
        assert_eq!(wq.lifecycle(), Lifecycle::Completed);
    }

    #[test]
    #[should_panic(expected = "tasks are only accepted while Running")]
    fn submit_after_join_panics() {
        let mut wq = Builder::new(4)
            .worker(|t: u32| t, 2)
            .merger(|acc: u32, r| acc + r, 0)
            .start()
            .unwrap();
        wq.submit(1);
        wq.join();
        wq.submit(2);
    }

    #[test]
    #[should_panic(expected = "join must be called exactly once")]
    fn second_join_panics() {
        let mut wq = Builder::new(4)
            .worker(|t: u32| t, 2)
            .merger(|acc: u32, r| acc + r, 0)
            .start()
            .unwrap();
        wq.join();
        wq.join();
    }

    #[test]
    #[should_panic(expected = "poison task")]
    fn worker_panic_is_raised_from_join() {
        let mut wq = Builder::new(8)
            .worker(
                |t: u32| {
                    if t == 13 {
                        panic!("poison task {t}");
                    }
                    t
                },
                1,
            )
            .merger(|acc: u32, r| acc + r, 0)
            .start()
            .unwrap();
        wq.submit(13);
        wq.join();
    }

    #[test]
    #[should_panic(expected = "no longer accepting tasks")]
    fn submit_to_a_dead_pool_panics_instead_of_hanging() {
        let wq = Builder::new(0)
            .worker(|_t: u32| -> u32 { panic!("poison task") }, 1)
            .merger(|acc: u32, r| acc + r, 0)
            .start()
            .unwrap();
        wq.submit(1);
        // Give the lone worker time to die before the next handoff.
        thread::sleep(Duration::from_millis(500));
        wq.submit(2);
    }
}
