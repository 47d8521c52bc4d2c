//! The FOTA task and the handle the rest of the firmware talks to.
//!
//! One `Fota` owns the update parameters, both event channels, the retry
//! timer and the host callbacks. The task thread runs every download itself;
//! triggers only raise bits on the task channel, and the completion gate is
//! the one place the application learns how an attempt ended.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use super::error::FotaError;
use super::events::{EventBits, EventGroup};
use super::params::FotaParameters;
use super::ports::{lock_device, AddressResolver, HttpTransfer, SharedDevice, SystemReset};
use super::timer::RetryTimer;
use super::transfer::{TransferAbort, TransferCoordinator, TransferSettings};
use crate::config::FotaConfig;

const TIMER_NAME: &str = "fota-timer";

const TASK_EVENTS: EventBits = EventBits::UPDATE_REQUESTED
    .union(EventBits::ERROR_OCCURRED)
    .union(EventBits::WAITING_FOR_USER_ACK)
    .union(EventBits::SKIP_REQUESTED)
    .union(EventBits::SHUTDOWN);

const GATE_EVENTS: EventBits = EventBits::UPDATE_COMPLETE_NOTIFY
    .union(EventBits::ERROR_OCCURRED)
    .union(EventBits::SHUTDOWN);

pub type HostCallback = Arc<dyn Fn() + Send + Sync>;

/// Everything the FOTA core drives but does not implement.
#[derive(Clone)]
pub struct FotaCollaborators {
    pub device: SharedDevice,
    pub http: Arc<dyn HttpTransfer>,
    pub resolver: Arc<dyn AddressResolver>,
    pub reset: Arc<dyn SystemReset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FotaState {
    /// Not started, or stopped
    Idle,
    Ready,
    /// An attempt is in flight or waiting for acknowledgment
    Busy,
    /// The last attempt failed
    Error,
}

impl FotaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FotaState::Idle => "IDLE",
            FotaState::Ready => "READY",
            FotaState::Busy => "BUSY",
            FotaState::Error => "ERROR",
        }
    }
}

#[derive(Clone)]
struct Channels {
    task: Arc<EventGroup>,
    app: Arc<EventGroup>,
}

#[derive(Default)]
struct HostCallbacks {
    success: Option<HostCallback>,
    error: Option<HostCallback>,
}

struct Shared {
    config: FotaConfig,
    collaborators: FotaCollaborators,
    state: Mutex<FotaState>,
    params: Mutex<FotaParameters>,
    /// `Some` between start and stop
    channels: Mutex<Option<Channels>>,
    timer: Mutex<Option<RetryTimer>>,
    /// The download in flight, cut short by stop
    active_transfer: Mutex<Option<TransferAbort>>,
    callbacks: Mutex<HostCallbacks>,
    gate_busy: AtomicBool,
    /// Bumped on every start and stop so a task left over from an earlier
    /// start cannot overwrite the state of the current one
    generation: AtomicU64,
    timers_created: AtomicUsize,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn channels(&self) -> Result<Channels, FotaError> {
        lock(&self.channels).clone().ok_or(FotaError::NotStarted)
    }

    /// Create the timer or change the period of the existing one.
    fn set_timer(self: &Arc<Self>, period: Duration) -> Result<(), FotaError> {
        let mut timer = lock(&self.timer);
        if let Some(timer) = timer.as_ref() {
            return timer.change_period(period).map_err(|e| {
                log::error!("Failed to change FOTA timer period");
                e
            });
        }

        let weak = Arc::downgrade(self);
        let created = RetryTimer::new(TIMER_NAME, period, move || on_timer_expired(&weak))
            .map_err(|e| {
                log::error!("Failed to create FOTA timer");
                e
            })?;
        self.timers_created.fetch_add(1, Ordering::SeqCst);
        *timer = Some(created);
        Ok(())
    }

    fn start_timer(&self) -> Result<(), FotaError> {
        match lock(&self.timer).as_ref() {
            Some(timer) => {
                timer.start();
                Ok(())
            }
            None => {
                log::error!("FOTA timer is not configured");
                Err(FotaError::TimerFailed)
            }
        }
    }

    fn stop_timer(&self) {
        if let Some(timer) = lock(&self.timer).as_ref() {
            timer.stop();
        }
    }

    fn reset_timer(&self) {
        if let Some(timer) = lock(&self.timer).as_ref() {
            timer.reset();
        }
    }

    fn begin_attempt(&self) -> Result<(), FotaError> {
        let mut state = lock(&self.state);
        if *state == FotaState::Busy {
            return Err(FotaError::Busy);
        }
        *state = FotaState::Busy;
        Ok(())
    }

    fn raise_update(&self, params: Option<FotaParameters>) -> Result<(), FotaError> {
        let channels = self.channels()?;
        self.begin_attempt()?;
        if let Some(params) = params {
            *lock(&self.params) = params;
        }
        // A new gate wait must not pick up the outcome of an earlier attempt
        channels
            .app
            .clear(EventBits::UPDATE_COMPLETE_NOTIFY | EventBits::ERROR_OCCURRED);
        channels.task.set(EventBits::UPDATE_REQUESTED);
        Ok(())
    }
}

fn on_timer_expired(shared: &Weak<Shared>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    match shared.raise_update(None) {
        Ok(()) => log::info!("FOTA timer expired, update requested"),
        Err(FotaError::Busy) => log::debug!("FOTA timer expired during an attempt, ignored"),
        Err(e) => log::warn!("FOTA timer could not request an update: {}", e),
    }
}

/// Handle to the FOTA module. Cheap to clone; all clones drive the same task.
#[derive(Clone)]
pub struct Fota {
    shared: Arc<Shared>,
}

impl Fota {
    pub fn new(config: FotaConfig, collaborators: FotaCollaborators) -> Result<Self, FotaError> {
        config.validate()?;
        let params = config.default_parameters()?;

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                collaborators,
                state: Mutex::new(FotaState::Idle),
                params: Mutex::new(params),
                channels: Mutex::new(None),
                timer: Mutex::new(None),
                active_transfer: Mutex::new(None),
                callbacks: Mutex::new(HostCallbacks::default()),
                gate_busy: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                timers_created: AtomicUsize::new(0),
            }),
        })
    }

    /// Create both event channels and spawn the FOTA task.
    pub fn start(&self) -> Result<(), FotaError> {
        let mut channels = lock(&self.shared.channels);
        if channels.is_some() {
            return Err(FotaError::AlreadyStarted);
        }

        let config = &self.shared.config;
        *lock(&self.shared.params) = config.default_parameters()?;

        let created = Channels {
            task: Arc::new(EventGroup::new()),
            app: Arc::new(EventGroup::new()),
        };
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let task = FotaTask {
            shared: self.shared.clone(),
            channels: created.clone(),
            generation,
            awaiting_ack: false,
        };
        thread::Builder::new()
            .name(config.task_name.clone())
            .stack_size(config.task_stack_size)
            .spawn(move || task.run())
            .map_err(|e| {
                log::error!("Failed to create FOTA task: {:?}", e);
                FotaError::Failed
            })?;

        *channels = Some(created);
        *lock(&self.shared.state) = FotaState::Ready;
        log::info!("FOTA task started");
        Ok(())
    }

    /// Tear down the timer, the event channels and the task, and forget the
    /// host callbacks. A blocked completion wait returns `Stopped`.
    pub fn stop(&self) -> Result<(), FotaError> {
        let channels = lock(&self.shared.channels)
            .take()
            .ok_or(FotaError::NotStarted)?;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        let timer = lock(&self.shared.timer).take();
        drop(timer);

        // Returns once no callback of the old attempt can touch the device
        let active = lock(&self.shared.active_transfer).take();
        if let Some(transfer) = active {
            log::info!("Aborting the FOTA transfer in flight");
            transfer.abort();
        }

        // The task exits at its next wake-up
        channels.task.set(EventBits::SHUTDOWN);
        channels.app.set(EventBits::SHUTDOWN);

        self.deinit_callbacks();
        *lock(&self.shared.state) = FotaState::Idle;
        log::info!("FOTA task stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        lock(&self.shared.channels).is_some()
    }

    pub fn state(&self) -> FotaState {
        *lock(&self.shared.state)
    }

    pub fn parameters(&self) -> FotaParameters {
        lock(&self.shared.params).clone()
    }

    pub fn config(&self) -> &FotaConfig {
        &self.shared.config
    }

    /// Overwrite the parameters and start an attempt with them.
    pub fn request_update(&self, params: FotaParameters) -> Result<(), FotaError> {
        self.shared.raise_update(Some(params))
    }

    /// Start an attempt with the current parameters.
    pub fn trigger_update(&self) -> Result<(), FotaError> {
        self.shared.raise_update(None)
    }

    /// Close the current round without downloading anything.
    pub fn skip_update(&self) -> Result<(), FotaError> {
        let channels = self.shared.channels()?;
        if self.state() == FotaState::Busy {
            return Err(FotaError::Busy);
        }
        channels.task.set(EventBits::SKIP_REQUESTED);
        Ok(())
    }

    /// Block until the current attempt completes or fails.
    ///
    /// On completion the success callback runs first, then the task is
    /// released to finalize the device update and reset the system. Only one
    /// caller may wait at a time; a second one gets `ReentrantCompletionWait`.
    pub fn wait_for_completion(&self) -> Result<(), FotaError> {
        let channels = self.shared.channels()?;
        if self
            .shared
            .gate_busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::warn!("Completion wait already in progress");
            return Err(FotaError::ReentrantCompletionWait);
        }
        let _gate = GateRelease(&self.shared.gate_busy);

        let bits = channels.app.wait_any(GATE_EVENTS, None);
        if bits.contains(EventBits::UPDATE_COMPLETE_NOTIFY) {
            let success = lock(&self.shared.callbacks).success.clone();
            if let Some(callback) = success {
                callback();
            }
            channels.task.set(EventBits::WAITING_FOR_USER_ACK);
            Ok(())
        } else if bits.contains(EventBits::ERROR_OCCURRED) {
            let error = lock(&self.shared.callbacks).error.clone();
            if let Some(callback) = error {
                callback();
            }
            Err(FotaError::Failed)
        } else {
            Err(FotaError::Stopped)
        }
    }

    /// Callbacks are looked up when the gate fires, so they may be replaced
    /// at any time.
    pub fn register_callbacks(&self, success: Option<HostCallback>, error: Option<HostCallback>) {
        let mut callbacks = lock(&self.shared.callbacks);
        callbacks.success = success;
        callbacks.error = error;
    }

    pub fn deinit_callbacks(&self) {
        self.register_callbacks(None, None);
    }

    /// Create the timer, or change its period. There is never more than one.
    pub fn set_timer(&self, period: Duration) -> Result<(), FotaError> {
        self.shared.set_timer(period)
    }

    pub fn start_timer(&self) -> Result<(), FotaError> {
        self.shared.start_timer()
    }

    pub fn stop_timer(&self) {
        self.shared.stop_timer();
    }

    pub fn reset_timer(&self) {
        self.shared.reset_timer();
    }

    pub fn timer_running(&self) -> bool {
        lock(&self.shared.timer)
            .as_ref()
            .map_or(false, RetryTimer::is_running)
    }

    pub fn timer_period(&self) -> Option<Duration> {
        lock(&self.shared.timer).as_ref().map(RetryTimer::period)
    }

    pub fn task_events(&self) -> Option<Arc<EventGroup>> {
        lock(&self.shared.channels).as_ref().map(|c| c.task.clone())
    }

    pub fn app_events(&self) -> Option<Arc<EventGroup>> {
        lock(&self.shared.channels).as_ref().map(|c| c.app.clone())
    }

    #[cfg(test)]
    pub(crate) fn timers_created(&self) -> usize {
        self.shared.timers_created.load(Ordering::SeqCst)
    }
}

struct GateRelease<'a>(&'a AtomicBool);

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct FotaTask {
    shared: Arc<Shared>,
    channels: Channels,
    generation: u64,
    /// An image is on the device and the application has not acknowledged it
    awaiting_ack: bool,
}

impl FotaTask {
    fn run(mut self) {
        loop {
            let bits = self.channels.task.wait_any(TASK_EVENTS, None);

            if bits.contains(EventBits::SHUTDOWN) {
                log::info!("FOTA task exiting");
                return;
            }
            if bits.contains(EventBits::ERROR_OCCURRED) {
                self.on_error();
            }
            if bits.contains(EventBits::SKIP_REQUESTED) {
                self.on_skip();
            }
            if bits.contains(EventBits::UPDATE_REQUESTED) {
                self.on_update_requested();
            }
            if bits.contains(EventBits::WAITING_FOR_USER_ACK) {
                self.on_user_ack();
            }
        }
    }

    fn on_error(&self) {
        log::warn!("Error raised during the FOTA update");
        let config = &self.shared.config;
        if !config.retry_on_error {
            return;
        }

        let armed = self
            .shared
            .set_timer(config.retry_backoff())
            .and_then(|_| self.shared.start_timer());
        match armed {
            Ok(()) => log::info!("FOTA will be retried in {:?}", config.retry_backoff()),
            Err(e) => log::error!("Failed to arm the FOTA retry timer: {}", e),
        }
    }

    fn on_skip(&self) {
        log::info!("No newer firmware, nothing downloaded or installed");
        self.set_state(FotaState::Ready);
        self.channels.task.set(EventBits::WAITING_FOR_USER_ACK);
        self.shared.reset_timer();
    }

    fn on_update_requested(&mut self) {
        if self.awaiting_ack {
            log::warn!("Update requested while waiting for acknowledgment, ignored");
            return;
        }
        self.shared.stop_timer();

        let params = lock(&self.shared.params).clone();
        let collaborators = &self.shared.collaborators;
        let register = |transfer: TransferAbort| self.register_transfer(transfer);
        let result = TransferCoordinator::new(
            &collaborators.device,
            collaborators.http.as_ref(),
            collaborators.resolver.as_ref(),
            TransferSettings::from(&self.shared.config),
        )
        .with_abort_registration(&register)
        .run(&params);
        self.clear_transfer();

        match result {
            Ok(()) => {
                log::info!("FOTA transfer done, waiting for application acknowledgment");
                self.awaiting_ack = true;
                self.channels.app.set(EventBits::UPDATE_COMPLETE_NOTIFY);
            }
            Err(e) => {
                log::error!("FOTA update failed: {}", e);
                self.fail();
            }
        }
    }

    fn on_user_ack(&mut self) {
        if !self.awaiting_ack {
            log::info!("FOTA round closed, no update to install");
            return;
        }
        self.awaiting_ack = false;

        let finished = lock_device(&self.shared.collaborators.device).finish_update();
        if let Err(e) = finished {
            log::error!("{}: {:?}", FotaError::DeviceFinalizeFailed, e);
            self.fail();
            return;
        }

        let delay = self.shared.config.reboot_delay();
        log::info!("FOTA task waiting {:?} before rebooting", delay);
        thread::sleep(delay);

        log::info!("Rebooting...");
        self.shared.collaborators.reset.system_reset();
    }

    /// Refused once a stop has retired this task's generation.
    fn register_transfer(&self, transfer: TransferAbort) -> bool {
        let mut active = lock(&self.shared.active_transfer);
        if self.shared.generation.load(Ordering::SeqCst) != self.generation {
            return false;
        }
        *active = Some(transfer);
        true
    }

    fn clear_transfer(&self) {
        let mut active = lock(&self.shared.active_transfer);
        if self.shared.generation.load(Ordering::SeqCst) == self.generation {
            *active = None;
        }
    }

    fn fail(&self) {
        self.set_state(FotaState::Error);
        self.channels.task.set(EventBits::ERROR_OCCURRED);
        self.channels.app.set(EventBits::ERROR_OCCURRED);
    }

    fn set_state(&self, state: FotaState) {
        let mut current = lock(&self.shared.state);
        if self.shared.generation.load(Ordering::SeqCst) == self.generation {
            *current = state;
        }
    }
}
