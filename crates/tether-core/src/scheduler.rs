//! Interpreter-thread job scheduler
//!
//! All script-originated events (timer fires, idle drains) execute on one
//! dedicated thread. The thread sleeps on a condvar until the next timer
//! deadline or until an immediate job is queued, in the same shape as a
//! timer thread with a deadline min-heap.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// A unit of work executed on the interpreter thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Job {
    /// Invoke the scheduled callback with this id
    Fire(u32),
    /// Drain the deferred-unprotect queue
    DrainUnprotect,
}

/// Executes jobs handed over by the scheduler
pub(crate) trait JobSink: Send + Sync + 'static {
    /// Run one job; for `Fire`, the return value reports whether the
    /// callback is still repeating and should be re-armed
    fn run(&self, job: Job) -> bool;
}

struct TimerEntry {
    due: Instant,
    id: u32,
    interval: Option<Duration>,
}

// Reverse ordering for min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}

impl Eq for TimerEntry {}

struct SchedulerState {
    timers: BinaryHeap<TimerEntry>,
    immediate: VecDeque<Job>,
    /// A job is currently executing on the interpreter thread
    busy: bool,
}

/// The single-threaded script scheduler
pub(crate) struct Scheduler {
    state: Mutex<SchedulerState>,
    notify: Condvar,
    idle: Condvar,
    shutdown: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a stopped scheduler
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState {
                timers: BinaryHeap::new(),
                immediate: VecDeque::new(),
                busy: false,
            }),
            notify: Condvar::new(),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    /// Start the interpreter thread
    pub fn start(self: &Arc<Self>, sink: Arc<dyn JobSink>) {
        let scheduler = Arc::clone(self);

        let handle = thread::Builder::new()
            .name("tether-js".to_string())
            .spawn(move || {
                scheduler.run_loop(sink);
            })
            .expect("failed to spawn interpreter thread");

        *self.handle.lock() = Some(handle);
    }

    /// Stop the interpreter thread
    pub fn stop(&self) {
        self.shutdown.store(true, AtomicOrdering::Release);
        self.notify.notify_all();

        if let Some(handle) = self.handle.lock().take() {
            let start = Instant::now();
            let timeout = Duration::from_secs(2);
            loop {
                if handle.is_finished() {
                    let _ = handle.join();
                    return;
                }
                if start.elapsed() > timeout {
                    drop(handle);
                    return;
                }
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    /// Queue a job for the next loop turn
    pub fn push_immediate(&self, job: Job) {
        let mut state = self.state.lock();
        state.immediate.push_back(job);
        self.notify.notify_one();
    }

    /// Arm a timer for a scheduled callback
    pub fn push_timer(&self, id: u32, delay: Duration, interval: Option<Duration>) {
        let mut state = self.state.lock();
        state.timers.push(TimerEntry {
            due: Instant::now() + delay,
            id,
            interval,
        });
        self.notify.notify_one();
    }

    /// Discard every armed timer
    pub fn clear_timers(&self) {
        self.state.lock().timers.clear();
        self.notify.notify_one();
    }

    /// Block until the immediate queue has drained and no job is running
    ///
    /// Armed timers do not count against quiescence.
    pub fn wait_until_idle(&self) {
        let mut state = self.state.lock();
        while !state.immediate.is_empty() || state.busy {
            self.idle.wait(&mut state);
        }
    }

    fn run_loop(&self, sink: Arc<dyn JobSink>) {
        loop {
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            let mut state = self.state.lock();

            // Re-check after acquiring the lock so a stop() between the
            // first check and the lock cannot lose its notification.
            if self.shutdown.load(AtomicOrdering::Acquire) {
                break;
            }

            // Promote due timers to the immediate queue.
            let now = Instant::now();
            while let Some(next) = state.timers.peek() {
                if next.due <= now {
                    let entry = state.timers.pop().unwrap();
                    state.immediate.push_back(Job::Fire(entry.id));
                    if entry.interval.is_some() {
                        // Remembered so a repeating callback re-arms after
                        // its fire confirms the record is still live.
                        state.timers.push(TimerEntry {
                            due: now + entry.interval.unwrap(),
                            id: entry.id,
                            interval: entry.interval,
                        });
                    }
                } else {
                    break;
                }
            }

            if let Some(job) = state.immediate.pop_front() {
                state.busy = true;
                drop(state);

                let rearm = sink.run(job);

                let mut state = self.state.lock();
                state.busy = false;
                if let (Job::Fire(id), true) = (job, rearm) {
                    // Zero-delay repeating callbacks have no heap entry;
                    // requeue them directly.
                    let armed = state.timers.iter().any(|t| t.id == id);
                    if !armed {
                        state.immediate.push_back(Job::Fire(id));
                    }
                } else if let (Job::Fire(id), false) = (job, rearm) {
                    let mut remaining = std::mem::take(&mut state.timers)
                        .into_vec()
                        .into_iter()
                        .filter(|t| t.id != id)
                        .collect::<Vec<_>>();
                    state.timers = remaining.drain(..).collect();
                }
                if state.immediate.is_empty() && !state.busy {
                    self.idle.notify_all();
                }
                continue;
            }

            // Nothing immediate; sleep until the next deadline or a push.
            if let Some(next) = state.timers.peek() {
                let now = Instant::now();
                if next.due > now {
                    let timeout = next.due - now;
                    self.notify.wait_for(&mut state, timeout);
                }
            } else {
                self.idle.notify_all();
                self.notify.wait(&mut state);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        fired: AtomicUsize,
        repeat_until: usize,
    }

    impl JobSink for CountingSink {
        fn run(&self, job: Job) -> bool {
            match job {
                Job::Fire(_) => {
                    let n = self.fired.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    n < self.repeat_until
                }
                Job::DrainUnprotect => false,
            }
        }
    }

    #[test]
    fn test_immediate_job_runs() {
        let scheduler = Scheduler::new();
        let sink = Arc::new(CountingSink {
            fired: AtomicUsize::new(0),
            repeat_until: 1,
        });
        scheduler.start(sink.clone());

        scheduler.push_immediate(Job::Fire(1));
        scheduler.wait_until_idle();

        assert_eq!(sink.fired.load(AtomicOrdering::SeqCst), 1);
        scheduler.stop();
    }

    #[test]
    fn test_timer_fires_after_delay() {
        let scheduler = Scheduler::new();
        let sink = Arc::new(CountingSink {
            fired: AtomicUsize::new(0),
            repeat_until: 1,
        });
        scheduler.start(sink.clone());

        scheduler.push_timer(7, Duration::from_millis(20), None);
        thread::sleep(Duration::from_millis(80));

        assert_eq!(sink.fired.load(AtomicOrdering::SeqCst), 1);
        scheduler.stop();
    }

    #[test]
    fn test_interval_rearms_until_done() {
        let scheduler = Scheduler::new();
        let sink = Arc::new(CountingSink {
            fired: AtomicUsize::new(0),
            repeat_until: 3,
        });
        scheduler.start(sink.clone());

        scheduler.push_timer(9, Duration::from_millis(5), Some(Duration::from_millis(5)));
        thread::sleep(Duration::from_millis(120));

        assert_eq!(sink.fired.load(AtomicOrdering::SeqCst), 3);
        scheduler.stop();
    }

    #[test]
    fn test_cleared_timers_do_not_fire() {
        let scheduler = Scheduler::new();
        let sink = Arc::new(CountingSink {
            fired: AtomicUsize::new(0),
            repeat_until: 1,
        });
        scheduler.start(sink.clone());

        scheduler.push_timer(3, Duration::from_millis(30), None);
        scheduler.clear_timers();
        thread::sleep(Duration::from_millis(80));

        assert_eq!(sink.fired.load(AtomicOrdering::SeqCst), 0);
        scheduler.stop();
    }
}
