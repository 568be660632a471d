//! Serial task queue: a single named worker thread draining a
//! due-time-ordered list of tasks.
//!
//! Each endpoint owns one queue, so user callbacks for that endpoint are
//! delivered strictly in enqueue order and never on the reactor thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::Error;

/// Longest accepted enqueue delay. Anything at or above this is rejected.
pub const MAX_TASK_DELAY: Duration = Duration::from_secs(10);

const THREAD_NAME_MAX: usize = 15;

/// A unit of work the queue can schedule.
pub trait TaskRunnable: Send + Sync {
    fn execute(&self);
    fn cancel(&self);
    fn is_canceled(&self) -> bool;

    /// Re-enqueue delay for periodic tasks; `None` runs once.
    fn interval(&self) -> Option<Duration> {
        None
    }

    /// Clear a finished result so the same task object can be queued again.
    fn reset(&self) {}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TaskState {
    Idle,
    Running,
    Canceled,
    Finished,
}

struct TaskCell<T> {
    state: TaskState,
    result: Option<T>,
}

/// A reusable task with a result slot the producer can await.
///
/// Consuming the result with [`Task::wait_result`] returns the task to the
/// idle state so the same object can be enqueued for the next cycle.
pub struct Task<T> {
    func: Box<dyn Fn() -> T + Send + Sync>,
    interval: Option<Duration>,
    cell: Mutex<TaskCell<T>>,
    cond: Condvar,
}

impl<T: Send> Task<T> {
    pub fn new(func: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Task {
            func: Box::new(func),
            interval: None,
            cell: Mutex::new(TaskCell {
                state: TaskState::Idle,
                result: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// A task that re-enqueues itself with `every` delay after each run.
    pub fn periodic(func: impl Fn() -> T + Send + Sync + 'static, every: Duration) -> Self {
        let mut task = Task::new(func);
        task.interval = Some(every);
        task
    }

    /// Block until the task finishes or is canceled, then take the result.
    ///
    /// Returns `None` for a canceled task. Taking the result resets the task
    /// to idle.
    pub fn wait_result(&self) -> Option<T> {
        let mut cell = self.cell.lock();
        while cell.state != TaskState::Finished && cell.state != TaskState::Canceled {
            self.cond.wait(&mut cell);
        }
        if cell.state == TaskState::Finished {
            cell.state = TaskState::Idle;
            cell.result.take()
        } else {
            None
        }
    }
}

impl<T: Send> TaskRunnable for Task<T> {
    fn execute(&self) {
        {
            let mut cell = self.cell.lock();
            if cell.state != TaskState::Idle {
                return;
            }
            cell.state = TaskState::Running;
        }

        let result = (self.func)();

        let mut cell = self.cell.lock();
        cell.state = TaskState::Finished;
        cell.result = Some(result);
        self.cond.notify_all();
    }

    fn cancel(&self) {
        let mut cell = self.cell.lock();
        if cell.state != TaskState::Running {
            cell.state = TaskState::Canceled;
            self.cond.notify_all();
        }
    }

    fn is_canceled(&self) -> bool {
        self.cell.lock().state == TaskState::Canceled
    }

    fn interval(&self) -> Option<Duration> {
        self.interval
    }

    fn reset(&self) {
        let mut cell = self.cell.lock();
        if cell.state == TaskState::Finished {
            cell.state = TaskState::Idle;
            cell.result = None;
        }
    }
}

/// One-shot closure task used for callback marshalling.
struct OnceTask {
    func: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    canceled: AtomicBool,
}

impl OnceTask {
    fn new(func: impl FnOnce() + Send + 'static) -> Self {
        OnceTask {
            func: Mutex::new(Some(Box::new(func))),
            canceled: AtomicBool::new(false),
        }
    }
}

impl TaskRunnable for OnceTask {
    fn execute(&self) {
        if let Some(func) = self.func.lock().take() {
            func();
        }
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.func.lock().take();
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

struct QueueItem {
    task: Arc<dyn TaskRunnable>,
    due: Instant,
}

struct QueueState {
    exit: bool,
    executing: bool,
    worker: Option<thread::JoinHandle<()>>,
    tasks: Vec<QueueItem>,
}

struct QueueInner {
    name: String,
    state: Mutex<QueueState>,
    cond: Condvar,
}

pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(name: &str) -> Self {
        TaskQueue {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                state: Mutex::new(QueueState {
                    exit: true,
                    executing: false,
                    worker: None,
                    tasks: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Spawn the worker thread. Idempotent; fails only on thread creation
    /// failure.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        if state.worker.is_some() {
            debug!(queue = %self.inner.name, "already started, ignoring");
            return Ok(());
        }

        state.exit = false;
        let inner = Arc::clone(&self.inner);
        let mut thread_name = self.inner.name.clone();
        thread_name.truncate(THREAD_NAME_MAX);
        match thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_loop(inner))
        {
            Ok(handle) => {
                state.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                state.exit = true;
                error!(queue = %self.inner.name, error = %e, "failed to spawn worker");
                Err(Error::Io(e))
            }
        }
    }

    /// Stop the worker and cancel every still-queued task. Idempotent.
    /// A task that is mid-execution runs to completion before this returns.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.exit && state.worker.is_none() {
            return;
        }

        state.exit = true;
        self.inner.cond.notify_all();
        let worker = state.worker.take();
        drop(state);

        if let Some(worker) = worker {
            let _ = worker.join();
        }

        let mut state = self.inner.state.lock();
        for item in state.tasks.drain(..) {
            item.task.cancel();
        }
    }

    /// Schedule `task` to run after `delay`, optionally canceling everything
    /// already queued.
    pub fn enqueue(
        &self,
        task: Arc<dyn TaskRunnable>,
        cancel_pending: bool,
        delay: Duration,
    ) -> Result<(), Error> {
        enqueue_inner(&self.inner, task, cancel_pending, delay)
    }

    /// Enqueue a one-shot closure for immediate execution.
    pub fn post(&self, func: impl FnOnce() + Send + 'static) -> bool {
        self.enqueue(Arc::new(OnceTask::new(func)), false, Duration::ZERO)
            .is_ok()
    }

    pub fn is_task_executing(&self) -> bool {
        self.inner.state.lock().executing
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

fn enqueue_inner(
    inner: &Arc<QueueInner>,
    task: Arc<dyn TaskRunnable>,
    cancel_pending: bool,
    delay: Duration,
) -> Result<(), Error> {
    if delay >= MAX_TASK_DELAY {
        warn!(queue = %inner.name, ?delay, "enqueue delay beyond maximum, rejecting");
        return Err(Error::DelayTooLong);
    }

    task.reset();

    let mut state = inner.state.lock();
    if state.exit {
        warn!(queue = %inner.name, "enqueue on stopped queue, rejecting");
        return Err(Error::QueueStopped);
    }

    if cancel_pending {
        for item in state.tasks.drain(..) {
            item.task.cancel();
        }
    }

    let due = Instant::now() + delay;
    let pos = state
        .tasks
        .iter()
        .position(|item| item.due > due)
        .unwrap_or(state.tasks.len());
    state.tasks.insert(pos, QueueItem { task, due });

    inner.cond.notify_all();
    Ok(())
}

fn worker_loop(inner: Arc<QueueInner>) {
    debug!(queue = %inner.name, "worker started");

    loop {
        let mut state = inner.state.lock();
        let item = loop {
            if state.exit {
                debug!(queue = %inner.name, "worker exiting");
                return;
            }
            match state.tasks.first().map(|item| item.due) {
                None => {
                    inner.cond.wait(&mut state);
                }
                Some(due) => {
                    let now = Instant::now();
                    if now >= due {
                        break state.tasks.remove(0);
                    }
                    inner.cond.wait_for(&mut state, due - now);
                }
            }
        };
        state.executing = true;
        drop(state);

        if item.task.is_canceled() {
            inner.state.lock().executing = false;
            continue;
        }

        if panic::catch_unwind(AssertUnwindSafe(|| item.task.execute())).is_err() {
            error!(queue = %inner.name, "task panicked");
        }

        inner.state.lock().executing = false;

        if let Some(every) = item.task.interval()
            && enqueue_inner(&inner, item.task, false, every).is_err()
        {
            warn!(queue = %inner.name, "failed to re-enqueue periodic task");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_start_stop_idempotent() {
        let queue = TaskQueue::new("TestQueue");
        assert!(queue.start().is_ok());
        assert!(queue.start().is_ok());
        queue.stop();
        queue.stop();
    }

    #[test]
    fn test_enqueue_before_start_rejected() {
        let queue = TaskQueue::new("TestQueue");
        let task = Arc::new(Task::new(|| ()));
        assert!(matches!(
            queue.enqueue(task, false, Duration::ZERO),
            Err(Error::QueueStopped)
        ));
    }

    #[test]
    fn test_post_runs_in_order() {
        let queue = TaskQueue::new("TestQueue");
        queue.start().unwrap();

        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = Arc::clone(&log);
            assert!(queue.post(move || log.lock().push(i)));
        }

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        queue.post(move || done_tx.send(()).unwrap());
        done_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
        queue.stop();
    }

    #[test]
    fn test_wait_result() {
        let queue = TaskQueue::new("TestQueue");
        queue.start().unwrap();

        let task = Arc::new(Task::new(|| 41 + 1));
        queue.enqueue(task.clone(), false, Duration::ZERO).unwrap();
        assert_eq!(task.wait_result(), Some(42));

        // Result consumption returns the task to idle; it can run again.
        queue.enqueue(task.clone(), false, Duration::ZERO).unwrap();
        assert_eq!(task.wait_result(), Some(42));
        queue.stop();
    }

    #[test]
    fn test_delay_too_long_rejected() {
        let queue = TaskQueue::new("TestQueue");
        queue.start().unwrap();

        let task = Arc::new(Task::new(|| ()));
        assert!(matches!(
            queue.enqueue(task, false, MAX_TASK_DELAY),
            Err(Error::DelayTooLong)
        ));
        queue.stop();
    }

    #[test]
    fn test_delayed_execution() {
        let queue = TaskQueue::new("TestQueue");
        queue.start().unwrap();

        let started = Instant::now();
        let task = Arc::new(Task::new(Instant::now));
        queue
            .enqueue(task.clone(), false, Duration::from_millis(50))
            .unwrap();
        let ran_at = task.wait_result().unwrap();
        assert!(ran_at.duration_since(started) >= Duration::from_millis(50));
        queue.stop();
    }

    #[test]
    fn test_cancel_pending_drops_queued_tasks() {
        let queue = TaskQueue::new("TestQueue");
        queue.start().unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let slow = {
            let count = Arc::clone(&count);
            Arc::new(Task::new(move || {
                thread::sleep(Duration::from_millis(200));
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };
        let doomed = {
            let count = Arc::clone(&count);
            Arc::new(Task::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };
        queue.enqueue(slow.clone(), false, Duration::ZERO).unwrap();
        queue.enqueue(doomed.clone(), false, Duration::ZERO).unwrap();

        // Replace everything still queued with a fresh task.
        let replacement = Arc::new(Task::new(|| ()));
        queue.enqueue(replacement.clone(), true, Duration::ZERO).unwrap();

        replacement.wait_result();
        assert!(doomed.is_canceled());
        queue.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_task_repeats() {
        let queue = TaskQueue::new("TestQueue");
        queue.start().unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let task = {
            let count = Arc::clone(&count);
            Arc::new(Task::periodic(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                Duration::from_millis(10),
            ))
        };
        queue.enqueue(task, false, Duration::ZERO).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(count.load(Ordering::SeqCst) >= 3);
        queue.stop();
    }

    #[test]
    fn test_task_panic_does_not_kill_worker() {
        let queue = TaskQueue::new("TestQueue");
        queue.start().unwrap();

        queue.post(|| panic!("boom"));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        queue.post(move || done_tx.send(()).unwrap());
        assert!(done_rx.recv_timeout(Duration::from_secs(1)).is_ok());
        queue.stop();
    }

    #[test]
    fn test_stop_cancels_queued_tasks() {
        let queue = TaskQueue::new("TestQueue");
        queue.start().unwrap();

        let task = Arc::new(Task::new(|| ()));
        queue
            .enqueue(task.clone(), false, Duration::from_secs(5))
            .unwrap();
        queue.stop();
        assert!(task.is_canceled());
    }
}
