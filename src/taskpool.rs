//! Work-stealing task pool.
//!
//! Each worker owns a bounded SPMC ring buffer; `try_schedule` round-robins
//! a starting queue and pushes into the first one with room. Workers drain
//! their own queue first, then steal round-robin from the rest before
//! parking on a condvar. Grounded in the original's
//! `core/threading/thread_pool.h` and `core/threading/spmc_queue.h`,
//! rebuilt on `parking_lot` primitives instead of raw condition variables
//! plus a hand-rolled ring instead of `std::sync::mpsc`.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Task = Box<dyn FnOnce() + Send + 'static>;

const DEFAULT_CAPACITY: usize = crate::core::tunables::TASK_QUEUE_CAPACITY;

thread_local! {
    static WORKER_ID: Cell<Option<usize>> = Cell::new(None);
}

/// Single-producer-many-consumer ring buffer of tasks. `try_push` races
/// with every worker's `try_pop` against the same `first`/`last` pair;
/// both sides retreat rather than block when the ring is full or empty.
struct SpmcQueue {
    buffer: Box<[Mutex<Option<Task>>]>,
    first: AtomicU32,
    last: AtomicU32,
    capacity: u32,
}

impl SpmcQueue {
    fn new(capacity: usize) -> Self {
        let buffer = (0..capacity).map(|_| Mutex::new(None)).collect();
        Self {
            buffer,
            first: AtomicU32::new(0),
            last: AtomicU32::new(0),
            capacity: capacity as u32,
        }
    }

    fn inc(&self, n: u32) -> u32 {
        (n + 1) % self.capacity
    }

    fn try_push(&self, task: Task) -> Result<(), Task> {
        let last = self.last.load(Ordering::Relaxed);
        let next = self.inc(last);
        if next == self.first.load(Ordering::Acquire) {
            return Err(task);
        }
        *self.buffer[last as usize].lock() = Some(task);
        self.last.store(next, Ordering::Release);
        Ok(())
    }

    fn try_pop(&self) -> Option<Task> {
        let mut first = self.first.load(Ordering::Relaxed);
        loop {
            if first == self.last.load(Ordering::Acquire) {
                return None;
            }
            match self.first.compare_exchange_weak(
                first,
                self.inc(first),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return self.buffer[first as usize].lock().take(),
                Err(actual) => first = actual,
            }
        }
    }
}

/// Work-stealing task pool over a fixed set of worker threads.
pub struct TaskPool {
    queues: Vec<Arc<SpmcQueue>>,
    enqueue_cursor: AtomicUsize,
    enqueued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    run_flag: Arc<AtomicBool>,
    available: Arc<Condvar>,
    available_mutex: Arc<Mutex<()>>,
    finished: Arc<Condvar>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    pub fn new(thread_count: usize) -> Self {
        let thread_count = thread_count.max(1);
        let queues: Vec<Arc<SpmcQueue>> = (0..thread_count)
            .map(|_| Arc::new(SpmcQueue::new(DEFAULT_CAPACITY)))
            .collect();

        let enqueued = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));
        let run_flag = Arc::new(AtomicBool::new(true));
        let available = Arc::new(Condvar::new());
        let available_mutex = Arc::new(Mutex::new(()));
        let finished = Arc::new(Condvar::new());

        let workers = (0..thread_count)
            .map(|id| {
                let queues = queues.clone();
                let enqueued = enqueued.clone();
                let active = active.clone();
                let run_flag = run_flag.clone();
                let available = available.clone();
                let available_mutex = available_mutex.clone();
                let finished = finished.clone();

                std::thread::Builder::new()
                    .name(format!("taskpool-{id}"))
                    .spawn(move || {
                        WORKER_ID.with(|w| w.set(Some(id)));
                        worker_loop(id, &queues, &enqueued, &active, &run_flag, &available, &available_mutex, &finished);
                    })
                    .expect("failed to spawn task pool worker")
            })
            .collect();

        Self {
            queues,
            enqueue_cursor: AtomicUsize::new(0),
            enqueued,
            active,
            run_flag,
            available,
            available_mutex,
            finished,
            workers,
        }
    }

    /// The id of the calling worker thread, if called from one of this
    /// pool's threads.
    pub fn current_worker_id() -> Option<usize> {
        WORKER_ID.with(|w| w.get())
    }

    /// Try to enqueue a task once, starting at a round-robin queue index
    /// and probing every queue in order. Returns false if every queue
    /// was momentarily full.
    pub fn try_schedule<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_schedule_boxed(Box::new(task)).is_ok()
    }

    fn try_schedule_boxed(&self, mut task: Task) -> Result<(), Task> {
        let start = self.enqueue_cursor.fetch_add(1, Ordering::Relaxed) % self.queues.len();

        for n in 0..self.queues.len() {
            let idx = (start + n) % self.queues.len();
            match self.queues[idx].try_push(task) {
                Ok(()) => {
                    self.enqueued.fetch_add(1, Ordering::Relaxed);
                    self.active.fetch_add(1, Ordering::Relaxed);
                    self.available.notify_one();
                    return Ok(());
                }
                Err(returned) => task = returned,
            }
        }
        Err(task)
    }

    /// Enqueue a task, retrying until some queue has room.
    pub fn enqueue_detach<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task: Task = Box::new(task);
        loop {
            match self.try_schedule_boxed(task) {
                Ok(()) => return,
                Err(returned) => {
                    task = returned;
                    std::thread::yield_now();
                }
            }
        }
    }

    pub fn no_tasks(&self) -> bool {
        self.enqueued.load(Ordering::Acquire) < 1 && self.active.load(Ordering::Acquire) < 1
    }

    /// Block the calling thread until every queued and in-flight task has
    /// completed.
    pub fn wait_for_tasks(&self) {
        if self.no_tasks() {
            return;
        }
        let mut guard = self.available_mutex.lock();
        self.finished.wait_while(&mut guard, |_| !self.no_tasks());
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.run_flag.store(false, Ordering::Release);
        self.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    id: usize,
    queues: &[Arc<SpmcQueue>],
    enqueued: &AtomicUsize,
    active: &AtomicUsize,
    run_flag: &AtomicBool,
    available: &Condvar,
    available_mutex: &Mutex<()>,
    finished: &Condvar,
) {
    let count = queues.len();
    while run_flag.load(Ordering::Relaxed) {
        {
            let mut guard = available_mutex.lock();
            available.wait_while(&mut guard, |_| {
                enqueued.load(Ordering::Acquire) < 1 && run_flag.load(Ordering::Acquire)
            });
        }

        loop {
            let mut ran_any = false;
            for n in 0..count {
                let idx = (id + n) % count;
                if let Some(task) = queues[idx].try_pop() {
                    enqueued.fetch_sub(1, Ordering::Relaxed);
                    task();
                    active.fetch_sub(1, Ordering::Relaxed);
                    ran_any = true;
                }
            }

            if enqueued.load(Ordering::Acquire) < 1 {
                if active.load(Ordering::Acquire) < 1 {
                    // Hold the same mutex `wait_for_tasks` parks under so the
                    // zero-check-then-notify is atomic with its
                    // check-then-wait; otherwise a waiter could observe
                    // `!no_tasks()` just before this notify fires and never
                    // see it, blocking forever.
                    let _guard = available_mutex.lock();
                    finished.notify_all();
                }
                break;
            }
            if !ran_any {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[test]
    fn scheduled_tasks_all_run() {
        let pool = TaskPool::new(4);
        let counter = Arc::new(Counter::new(0));

        for _ in 0..256 {
            let counter = counter.clone();
            pool.enqueue_detach(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        pool.wait_for_tasks();
        assert_eq!(counter.load(Ordering::Relaxed), 256);
    }

    #[test]
    fn no_tasks_true_on_fresh_pool() {
        let pool = TaskPool::new(2);
        assert!(pool.no_tasks());
        pool.wait_for_tasks();
    }

    #[test]
    fn worker_id_is_set_inside_worker_threads() {
        let pool = TaskPool::new(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..8 {
            let seen = seen.clone();
            pool.enqueue_detach(move || {
                seen.lock().push(TaskPool::current_worker_id());
            });
        }
        pool.wait_for_tasks();
        let seen = seen.lock();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|id| id.is_some()));
    }
}
