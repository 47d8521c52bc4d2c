// Reusable auto-reload timer backing the FOTA retry / periodic check

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::error::FotaError;

const TIMER_STACK_SIZE: usize = 4096;

#[derive(Debug)]
struct TimerState {
    period: Duration,
    /// Next expiry, `None` while dormant
    deadline: Option<Instant>,
    shutdown: bool,
}

#[derive(Debug)]
struct TimerShared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl TimerShared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One timer object, one worker thread. The callback runs on the worker
/// thread every `period` while the timer is running.
pub struct RetryTimer {
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
}

impl RetryTimer {
    /// Create a dormant timer.
    pub fn new<F>(name: &str, period: Duration, callback: F) -> Result<Self, FotaError>
    where
        F: Fn() + Send + 'static,
    {
        if period.is_zero() {
            return Err(FotaError::TimerFailed);
        }

        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                period,
                deadline: None,
                shutdown: false,
            }),
            changed: Condvar::new(),
        });

        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(name.to_string())
                .stack_size(TIMER_STACK_SIZE)
                .spawn(move || run_timer(&shared, callback))
                .map_err(|e| {
                    log::error!("Failed to create timer thread: {:?}", e);
                    FotaError::TimerFailed
                })?
        };

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Change the period. A running timer restarts with the new period.
    pub fn change_period(&self, period: Duration) -> Result<(), FotaError> {
        if period.is_zero() {
            return Err(FotaError::TimerFailed);
        }
        let mut state = self.shared.lock();
        state.period = period;
        if state.deadline.is_some() {
            state.deadline = Some(Instant::now() + period);
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    /// Start the timer, or restart the countdown if it is already running.
    pub fn start(&self) {
        let mut state = self.shared.lock();
        state.deadline = Some(Instant::now() + state.period);
        self.shared.changed.notify_all();
    }

    pub fn reset(&self) {
        self.start();
    }

    pub fn stop(&self) {
        let mut state = self.shared.lock();
        state.deadline = None;
        self.shared.changed.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().deadline.is_some()
    }

    pub fn period(&self) -> Duration {
        self.shared.lock().period
    }
}

impl Drop for RetryTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            // The last owner may be the callback itself
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn run_timer<F: Fn()>(shared: &TimerShared, callback: F) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }

        let next = state.deadline;
        state = match next {
            None => shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    // Auto-reload
                    state.deadline = Some(now + state.period);
                    drop(state);
                    callback();
                    shared.lock()
                } else {
                    shared
                        .changed
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            }
        };
    }
}
