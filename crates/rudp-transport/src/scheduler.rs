//! # Scheduler
//!
//! Explicit handle replacing a process-global event loop. Two facilities:
//!
//! - **Posted tasks**: one-shot callbacks run in enqueue order by whichever
//!   thread drains the queue. Draining is never re-entrant, so a task that
//!   posts another task sees it run after itself, never inside itself.
//! - **Tick callbacks**: periodic steps registered by connections.
//!
//! Tests call [`Scheduler::run_tick`] by hand. Deployments call
//! [`Scheduler::start`] to spawn a driver thread that ticks at a fixed
//! interval until [`Scheduler::stop`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send>;
type TickFn = Arc<Mutex<dyn FnMut() + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TickId(u64);

#[derive(Default)]
struct TickRegistry {
    next_id: u64,
    entries: Vec<(TickId, TickFn)>,
}

struct Driver {
    stop_tx: Sender<()>,
    handle: thread::JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<Task>>,
    ticks: Mutex<TickRegistry>,
    draining: AtomicBool,
    driver: Mutex<Option<Driver>>,
}

#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a callback for later single-threaded execution.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Box::new(task));
    }

    pub fn register_tick<F>(&self, tick: F) -> TickId
    where
        F: FnMut() + Send + 'static,
    {
        let mut registry = self.inner.ticks.lock().unwrap_or_else(|e| e.into_inner());
        let id = TickId(registry.next_id);
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(Mutex::new(tick))));
        id
    }

    /// Returns `false` if the id was not registered.
    pub fn unregister_tick(&self, id: TickId) -> bool {
        let mut registry = self.inner.ticks.lock().unwrap_or_else(|e| e.into_inner());
        let before = registry.entries.len();
        registry.entries.retain(|(tid, _)| *tid != id);
        registry.entries.len() != before
    }

    pub fn tick_count(&self) -> usize {
        self.inner
            .ticks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn pending_count(&self) -> usize {
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Run posted tasks until the queue is empty. Returns how many ran.
    ///
    /// A nested call (from inside a task) returns 0 immediately; the outer
    /// drain picks up anything the task posted.
    pub fn run_pending(&self) -> usize {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return 0;
        }

        let mut ran = 0;
        loop {
            let task = self
                .inner
                .queue
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }

        self.inner.draining.store(false, Ordering::Release);
        ran
    }

    /// Invoke every registered tick callback once, then drain posted tasks.
    pub fn run_tick(&self) {
        let ticks: Vec<TickFn> = {
            let registry = self.inner.ticks.lock().unwrap_or_else(|e| e.into_inner());
            registry.entries.iter().map(|(_, f)| f.clone()).collect()
        };
        for tick in ticks {
            let mut f = tick.lock().unwrap_or_else(|e| e.into_inner());
            (*f)();
        }
        self.run_pending();
    }

    /// Spawn a driver thread calling [`Scheduler::run_tick`] every `interval`.
    /// A second call while running is a no-op.
    pub fn start(&self, interval: Duration) {
        let mut driver = self.inner.driver.lock().unwrap_or_else(|e| e.into_inner());
        if driver.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = bounded::<()>(1);
        let scheduler = self.clone();
        let spawned = thread::Builder::new()
            .name("rudp-scheduler".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => scheduler.run_tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });

        match spawned {
            Ok(handle) => {
                debug!(interval_ms = interval.as_millis() as u64, "scheduler started");
                *driver = Some(Driver { stop_tx, handle });
            }
            Err(e) => warn!(error = %e, "failed to spawn scheduler thread"),
        }
    }

    /// Stop the driver thread and wait for it to exit.
    pub fn stop(&self) {
        let driver = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(driver) = driver {
            let _ = driver.stop_tx.send(());
            if driver.handle.join().is_err() {
                warn!("scheduler thread panicked");
            }
            debug!("scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn posted_tasks_run_in_order() {
        let sched = Scheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            sched.post(move || log.lock().unwrap().push(i));
        }
        assert_eq!(sched.pending_count(), 5);
        assert_eq!(sched.run_pending(), 5);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn nested_posts_run_after_current_task() {
        let sched = Scheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (s, l) = (sched.clone(), log.clone());
        sched.post(move || {
            let l2 = l.clone();
            s.post(move || l2.lock().unwrap().push("inner"));
            assert_eq!(s.run_pending(), 0);
            l.lock().unwrap().push("outer");
        });
        sched.run_pending();
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner"]);
    }

    #[test]
    fn ticks_run_until_unregistered() {
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = sched.register_tick(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sched.run_tick();
        sched.run_tick();
        assert!(sched.unregister_tick(id));
        sched.run_tick();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(sched.tick_count(), 0);
    }

    #[test]
    fn tick_may_unregister_itself() {
        let sched = Scheduler::new();
        let slot: Arc<Mutex<Option<TickId>>> = Arc::new(Mutex::new(None));
        let (s, sl) = (sched.clone(), slot.clone());
        let id = sched.register_tick(move || {
            if let Some(id) = *sl.lock().unwrap() {
                s.unregister_tick(id);
            }
        });
        *slot.lock().unwrap() = Some(id);
        sched.run_tick();
        assert_eq!(sched.tick_count(), 0);
    }

    #[test]
    fn driver_thread_ticks_and_stops() {
        let sched = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sched.register_tick(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        sched.start(Duration::from_millis(1));
        assert!(sched.is_running());
        thread::sleep(Duration::from_millis(50));
        sched.stop();
        assert!(!sched.is_running());

        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop > 0);
        thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }
}
