//! The worker process event loop.
//!
//! # Responsibilities
//! - Bring up key supply before any worker exists
//! - Start workers, the control channel watcher and OCSP updates, in that order
//! - Multiplex control opcodes, key timers and fetch completions on one task
//! - Tear down: join workers, cancel OCSP
//!
//! # Design Decisions
//! - Every event is handled to completion before the next `select!`, so the
//!   key manager and the shutdown coordinator need no locking
//! - Timers that do not apply to the chosen key supply are never armed

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

use crate::config::{MemcachedConfig, ProxyConfig};
use crate::ipc::{ControlChannel, ControlChannelError, ControlOpcode};
use crate::lifecycle::shutdown::{ConnectionHandler, LoopControl, ShutdownCoordinator, ShutdownState};
use crate::net::memcached::MemcachedClient;
use crate::observability::logging::LogReopener;
use crate::tls::fetcher::{FetchCompletion, FetchSchedule, NetworkedKeyFetcher, TicketKeyCache};
use crate::tls::key::{KeyMaterialSource, SystemRandom, TicketKeySet};
use crate::tls::manager::{KeySetSink, KeySupply, TicketKeyManager};
use crate::tls::store::TicketKeyStore;
use crate::worker::WorkerError;

/// Pause before reading the control channel again after a read error.
const CONTROL_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// OCSP staple refresh, driven from outside this crate.
pub trait OcspUpdater: Send {
    /// Start (or continue) refreshing staples.
    fn proceed(&mut self);
    /// Stop refreshing.
    fn cancel(&mut self);
}

/// Why the event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Graceful shutdown completed.
    Graceful,
    /// The supervisor closed the control channel.
    ControlChannelClosed,
}

enum Event {
    Control(Result<Vec<ControlOpcode>, ControlChannelError>),
    ControlResume,
    Key(KeyEvent),
    DrainCheck,
}

enum KeyEvent {
    Rotate,
    Fetch,
    Retry,
    Fetched(FetchCompletion),
}

struct FetchDriver {
    fetcher: NetworkedKeyFetcher,
    completions: mpsc::UnboundedReceiver<FetchCompletion>,
    schedule: FetchSchedule,
    timer: Interval,
    retry_at: Option<Instant>,
}

/// Timers and channels feeding the key manager.
#[derive(Default)]
struct KeyTimers {
    rotation: Option<Interval>,
    fetch: Option<FetchDriver>,
}

impl KeyTimers {
    async fn next(&mut self) -> KeyEvent {
        let Self { rotation, fetch } = self;
        tokio::select! {
            _ = tick(rotation) => KeyEvent::Rotate,
            event = next_fetch_event(fetch) => event,
        }
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => pending().await,
    }
}

async fn next_fetch_event(fetch: &mut Option<FetchDriver>) -> KeyEvent {
    let Some(driver) = fetch else {
        return pending().await;
    };
    let retry_at = driver.retry_at;
    tokio::select! {
        _ = driver.timer.tick() => KeyEvent::Fetch,
        _ = sleep_until_some(retry_at) => KeyEvent::Retry,
        Some(done) = driver.completions.recv() => KeyEvent::Fetched(done),
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Periodic timer whose first tick is one period from now.
fn periodic(period: Duration) -> Interval {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// One worker process: key supply, workers and the control channel.
pub struct WorkerProcess<R> {
    config: Arc<ProxyConfig>,
    control: ControlChannel<R>,
    logs: Arc<dyn LogReopener>,
    manager: TicketKeyManager,
    rng: Box<dyn KeyMaterialSource>,
    cache: Option<Arc<dyn TicketKeyCache>>,
    ocsp: Option<Box<dyn OcspUpdater>>,
}

impl<R: AsyncRead + Unpin> WorkerProcess<R> {
    pub fn new(config: Arc<ProxyConfig>, control: R, logs: Arc<dyn LogReopener>) -> Self {
        let manager = TicketKeyManager::new(&config.tls);
        Self {
            config,
            control: ControlChannel::new(control),
            logs,
            manager,
            rng: Box::new(SystemRandom),
            cache: None,
            ocsp: None,
        }
    }

    /// Replace the random source used for key generation.
    pub fn with_rng(mut self, rng: impl KeyMaterialSource + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    /// Use `cache` instead of a memcached client built from config.
    pub fn with_cache(mut self, cache: Arc<dyn TicketKeyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_ocsp(mut self, ocsp: impl OcspUpdater + 'static) -> Self {
        self.ocsp = Some(Box::new(ocsp));
        self
    }

    /// The active ticket key snapshot, shared with the running loop.
    pub fn ticket_keys(&self) -> TicketKeyStore {
        self.manager.store().clone()
    }

    /// Run until shutdown.
    ///
    /// `start_workers` receives the initial ticket keys and returns the
    /// running workers; it is called once key supply is up.
    pub async fn run<F, H>(mut self, start_workers: F) -> Result<LoopExit, WorkerError>
    where
        F: FnOnce(Option<Arc<TicketKeySet>>) -> Result<Arc<H>, WorkerError>,
        H: ConnectionHandler + 'static,
    {
        let mut timers = self.start_key_supply();

        let handler = start_workers(self.manager.active())?;
        self.manager.attach(handler.clone() as Arc<dyn KeySetSink>);
        let mut coordinator = ShutdownCoordinator::new(
            self.config.workers.num_workers,
            handler.clone() as Arc<dyn ConnectionHandler>,
            self.logs.clone(),
        );

        let tls = &self.config.tls;
        if tls.enabled && !tls.no_ocsp {
            if let Some(ocsp) = self.ocsp.as_mut() {
                ocsp.proceed();
            }
        }

        tracing::info!("Entering event loop");
        let mut drain_check: Option<Interval> = None;
        let mut control_errors: u32 = 0;
        let mut control_resume: Option<Instant> = None;

        let exit = loop {
            let event = tokio::select! {
                read = self.control.read_opcodes(), if control_resume.is_none() => Event::Control(read),
                _ = sleep_until_some(control_resume) => Event::ControlResume,
                key = timers.next() => Event::Key(key),
                _ = tick(&mut drain_check) => Event::DrainCheck,
            };

            match event {
                Event::Control(Ok(opcodes)) => {
                    control_errors = 0;
                    let mut control = LoopControl::Continue;
                    for opcode in opcodes {
                        tracing::debug!(opcode = opcode.name(), "Control opcode received");
                        if coordinator.dispatch(opcode) == LoopControl::Break {
                            control = LoopControl::Break;
                        }
                    }
                    if control == LoopControl::Break {
                        break LoopExit::Graceful;
                    }
                    if coordinator.state() == ShutdownState::Draining && drain_check.is_none() {
                        let mut timer = interval(self.config.workers.drain_check_interval());
                        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        drain_check = Some(timer);
                    }
                }
                Event::Control(Err(ControlChannelError::Closed)) => {
                    tracing::error!("Control channel is closed; performing immediate shutdown");
                    break LoopExit::ControlChannelClosed;
                }
                Event::Control(Err(e)) => {
                    control_errors += 1;
                    if control_errors == 1 {
                        tracing::error!(error = %e, "Control channel read failed");
                    } else {
                        tracing::debug!(error = %e, consecutive = control_errors, "Control channel read failed again");
                    }
                    control_resume = Some(Instant::now() + CONTROL_ERROR_BACKOFF);
                }
                Event::ControlResume => control_resume = None,
                Event::Key(key) => self.on_key_event(&mut timers, key),
                Event::DrainCheck => {
                    if coordinator.reevaluate() == LoopControl::Break {
                        break LoopExit::Graceful;
                    }
                }
            }
        };

        if exit == LoopExit::Graceful {
            let joined = handler.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || joined.join_workers()).await {
                tracing::error!(error = %e, "Joining workers failed");
            }
        }
        if let Some(ocsp) = self.ocsp.as_mut() {
            ocsp.cancel();
        }

        tracing::info!(exit = ?exit, "Event loop finished");
        Ok(exit)
    }

    fn start_key_supply(&mut self) -> KeyTimers {
        let mut timers = KeyTimers::default();
        match KeySupply::select(&self.config.tls) {
            KeySupply::Disabled => {
                tracing::debug!("TLS disabled; no ticket keys");
            }
            KeySupply::Auto { interval } => {
                tracing::info!(
                    rotation_secs = interval.as_secs(),
                    max_keys = self.config.tls.max_ticket_keys(),
                    "Using internal session ticket key generator"
                );
                self.manager.renew(self.rng.as_mut());
                timers.rotation = Some(periodic(interval));
            }
            KeySupply::Static(set) => {
                self.manager.publish(Some(Arc::new(set)));
            }
            KeySupply::Networked(memcached) => {
                timers.fetch = Some(self.start_fetching(&memcached));
            }
        }
        timers
    }

    fn start_fetching(&mut self, memcached: &MemcachedConfig) -> FetchDriver {
        let cache = self
            .cache
            .clone()
            .unwrap_or_else(|| Arc::new(MemcachedClient::from_config(memcached)) as Arc<dyn TicketKeyCache>);
        tracing::info!(
            address = %memcached.address,
            key = %memcached.key,
            interval_secs = memcached.interval_secs,
            "Fetching ticket keys from memcached"
        );

        let (mut fetcher, completions) =
            NetworkedKeyFetcher::new(cache, memcached.key.clone(), self.manager.cipher());
        fetcher.fetch();

        FetchDriver {
            fetcher,
            completions,
            schedule: FetchSchedule::new(memcached),
            timer: periodic(memcached.interval()),
            retry_at: None,
        }
    }

    fn on_key_event(&mut self, timers: &mut KeyTimers, event: KeyEvent) {
        match event {
            KeyEvent::Rotate => self.manager.renew(self.rng.as_mut()),
            KeyEvent::Fetch => {
                if let Some(driver) = timers.fetch.as_mut() {
                    driver.fetcher.fetch();
                }
            }
            KeyEvent::Retry => {
                if let Some(driver) = timers.fetch.as_mut() {
                    driver.retry_at = None;
                    driver.fetcher.fetch();
                }
            }
            KeyEvent::Fetched(done) => {
                if let Some(driver) = timers.fetch.as_mut() {
                    let decision = driver.schedule.on_completion(done);
                    self.manager.apply(decision.action);
                    if let Some(delay) = decision.retry_after {
                        driver.retry_at = Some(Instant::now() + delay);
                    }
                }
            }
        }
    }
}
