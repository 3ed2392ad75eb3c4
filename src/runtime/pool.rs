//! Fixed-size interpreter pool.
//!
//! Every slot is a dedicated worker thread that owns one guest runtime, so an
//! interpreter is only ever touched by its own thread. A slot counts as busy
//! from acquisition until its worker has finished the job, including jobs the
//! caller stopped waiting for after a timeout.

use anyhow::{anyhow, Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use super::{sandbox, GuestRuntime, ScriptError, ScriptJob};

pub const DEFAULT_POOL_SIZE: usize = 20;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub size: usize,
    pub timeout: Duration,
    /// Install the syscall filter on every worker thread.
    pub confine: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            timeout: DEFAULT_TIMEOUT,
            confine: false,
        }
    }
}

/// Cooperative interrupt signal shared between a slot and its runtime.
///
/// A request to stop is tied to one job ticket, so a late interrupt for a job
/// that already finished never hits the next job on the same slot.
#[derive(Clone, Debug, Default)]
pub struct Interrupt {
    running: Arc<AtomicU64>,
    cancelled: Arc<AtomicU64>,
}

impl Interrupt {
    /// True while the running job has been asked to stop.
    pub fn is_raised(&self) -> bool {
        let running = self.running.load(Ordering::SeqCst);
        running != 0 && self.cancelled.load(Ordering::SeqCst) == running
    }

    pub(crate) fn begin(&self, ticket: u64) {
        self.running.store(ticket, Ordering::SeqCst);
    }

    pub(crate) fn end(&self) {
        self.running.store(0, Ordering::SeqCst);
    }

    pub(crate) fn raise(&self, ticket: u64) {
        self.cancelled.store(ticket, Ordering::SeqCst);
    }
}

struct SlotState {
    pending: AtomicUsize,
    next_ticket: AtomicU64,
    interrupt: Interrupt,
}

struct Slot {
    index: usize,
    jobs: Mutex<Sender<Envelope>>,
    state: Arc<SlotState>,
}

enum SlotEvent {
    Started,
    Finished(Result<String, ScriptError>),
}

struct Envelope {
    ticket: u64,
    job: ScriptJob,
    reply: Sender<SlotEvent>,
}

pub struct InterpreterPool {
    label: &'static str,
    timeout: Duration,
    slots: Vec<Slot>,
}

impl InterpreterPool {
    /// Start `config.size` workers, each building its runtime with `factory`.
    ///
    /// Returns once every worker is ready; any worker failing to start fails
    /// the whole pool.
    pub fn new<R, F>(label: &'static str, config: &PoolConfig, factory: F) -> Result<Self>
    where
        R: GuestRuntime + 'static,
        F: Fn(Interrupt) -> Result<R> + Send + Sync + 'static,
    {
        if config.size == 0 {
            return Err(anyhow!("{}: pool size must be greater than zero", label));
        }

        let factory = Arc::new(factory);
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let mut slots = Vec::with_capacity(config.size);

        for index in 0..config.size {
            let (jobs_tx, jobs_rx) = mpsc::channel::<Envelope>();
            let state = Arc::new(SlotState {
                pending: AtomicUsize::new(0),
                next_ticket: AtomicU64::new(1),
                interrupt: Interrupt::default(),
            });

            let worker_state = state.clone();
            let factory = factory.clone();
            let ready = ready_tx.clone();
            let confine = config.confine;
            thread::Builder::new()
                .name(format!("{label}-{index}"))
                .spawn(move || {
                    let started = if confine {
                        sandbox::confine_current_thread()
                            .and_then(|_| factory(worker_state.interrupt.clone()))
                    } else {
                        factory(worker_state.interrupt.clone())
                    };
                    let runtime = match started {
                        Ok(runtime) => {
                            let _ = ready.send(Ok(()));
                            runtime
                        }
                        Err(err) => {
                            let _ = ready.send(Err(err));
                            return;
                        }
                    };
                    drop(ready);
                    worker_loop(runtime, &worker_state, jobs_rx);
                })
                .with_context(|| format!("{label}: failed to spawn worker {index}"))?;

            slots.push(Slot {
                index,
                jobs: Mutex::new(jobs_tx),
                state,
            });
        }
        drop(ready_tx);

        for _ in 0..config.size {
            ready_rx
                .recv()
                .map_err(|_| anyhow!("{}: worker exited during startup", label))?
                .with_context(|| format!("{label}: worker failed to start"))?;
        }

        log::info!(
            "{} pool ready: {} slots, timeout {}ms",
            label,
            config.size,
            config.timeout.as_millis()
        );
        Ok(Self {
            label,
            timeout: config.timeout,
            slots,
        })
    }

    /// Run one job, returning at the latest `timeout` after it starts.
    ///
    /// On timeout the runtime is asked to stop at its next yield point; the
    /// slot stays busy until it actually does.
    pub fn run(&self, job: ScriptJob) -> Result<String, ScriptError> {
        let slot = self.acquire();
        let ticket = slot.state.next_ticket.fetch_add(1, Ordering::SeqCst);
        let (reply, events) = mpsc::channel();

        let sent = {
            let jobs = slot.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.send(Envelope { ticket, job, reply })
        };
        if sent.is_err() {
            slot.state.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(self.unavailable(slot));
        }

        // waiting here is waiting for the slot, not part of the time budget
        match events.recv() {
            Ok(SlotEvent::Started) => {}
            Ok(SlotEvent::Finished(result)) => return result,
            Err(_) => return Err(self.unavailable(slot)),
        }

        match events.recv_timeout(self.timeout) {
            Ok(SlotEvent::Finished(result)) => result,
            Ok(SlotEvent::Started) => Err(self.unavailable(slot)),
            Err(RecvTimeoutError::Timeout) => {
                slot.state.interrupt.raise(ticket);
                log::warn!(
                    "{} slot {} timed out after {}ms, interrupt requested",
                    self.label,
                    slot.index,
                    self.timeout.as_millis()
                );
                Err(ScriptError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.unavailable(slot)),
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently running or holding queued jobs.
    pub fn busy(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state.pending.load(Ordering::SeqCst) > 0)
            .count()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // First idle slot wins. When all are busy the job queues on slot 0, which
    // lets overflow traffic past the pool bound instead of rejecting it.
    fn acquire(&self) -> &Slot {
        for slot in &self.slots {
            if slot
                .state
                .pending
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return slot;
            }
        }
        let fallback = &self.slots[0];
        fallback.state.pending.fetch_add(1, Ordering::SeqCst);
        log::debug!("{} pool saturated, queueing on slot 0", self.label);
        fallback
    }

    fn unavailable(&self, slot: &Slot) -> ScriptError {
        log::error!("{} slot {} worker is not running", self.label, slot.index);
        ScriptError::Unavailable(format!("{} slot {} is not running", self.label, slot.index))
    }
}

fn worker_loop<R: GuestRuntime>(mut runtime: R, state: &SlotState, jobs: Receiver<Envelope>) {
    while let Ok(Envelope { ticket, job, reply }) = jobs.recv() {
        state.interrupt.begin(ticket);
        let _ = reply.send(SlotEvent::Started);

        let result = panic::catch_unwind(AssertUnwindSafe(|| runtime.execute(&job)))
            .unwrap_or_else(|_| Err(ScriptError::Runtime("interpreter panicked".to_string())));
        if state.interrupt.is_raised() {
            log::debug!("slot job {} stopped after interrupt", ticket);
        }
        state.interrupt.end();

        // the next job must not see anything this one left behind
        if let Err(err) = runtime.reset() {
            log::error!("failed to reset interpreter: {:#}", err);
        }

        state.pending.fetch_sub(1, Ordering::SeqCst);
        let _ = reply.send(SlotEvent::Finished(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// Test runtime: `sleep:<ms>` sleeps, `spin` loops until interrupted,
    /// `taint` marks the interpreter dirty, `state` reports it, anything else
    /// echoes the params.
    struct FakeRuntime {
        interrupt: Interrupt,
        dirty: bool,
    }

    impl GuestRuntime for FakeRuntime {
        fn execute(&mut self, job: &ScriptJob) -> Result<String, ScriptError> {
            match job.source.as_str() {
                "taint" => {
                    self.dirty = true;
                    return Ok("tainted".to_string());
                }
                "state" => return Ok(if self.dirty { "dirty" } else { "clean" }.to_string()),
                _ => {}
            }
            if let Some(ms) = job.source.strip_prefix("sleep:") {
                let ms: u64 = ms.parse().unwrap();
                thread::sleep(Duration::from_millis(ms));
                return Ok(thread::current().name().unwrap_or("").to_string());
            }
            if job.source == "spin" {
                while !self.interrupt.is_raised() {
                    thread::sleep(Duration::from_millis(1));
                }
                return Err(ScriptError::Runtime("interrupted".to_string()));
            }
            Ok(job.params.clone())
        }

        fn reset(&mut self) -> Result<()> {
            self.dirty = false;
            Ok(())
        }
    }

    fn fake(interrupt: Interrupt) -> Result<FakeRuntime> {
        Ok(FakeRuntime {
            interrupt,
            dirty: false,
        })
    }

    fn pool(size: usize, timeout_ms: u64) -> InterpreterPool {
        let config = PoolConfig {
            size,
            timeout: Duration::from_millis(timeout_ms),
            confine: false,
        };
        InterpreterPool::new("fake", &config, fake).unwrap()
    }

    fn job(source: &str, params: &str) -> ScriptJob {
        ScriptJob {
            cache_id: String::new(),
            source: source.to_string(),
            params: params.to_string(),
        }
    }

    #[test]
    fn runs_job_and_releases_slot() {
        let pool = pool(2, 500);
        assert_eq!(pool.run(job("echo", "{\"a\":1}")).unwrap(), "{\"a\":1}");
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn successful_job_leaves_no_state_for_the_next() {
        let pool = pool(1, 500);
        assert_eq!(pool.run(job("taint", "")).unwrap(), "tainted");
        assert_eq!(pool.run(job("state", "")).unwrap(), "clean");
    }

    #[test]
    fn timeout_returns_at_deadline_and_interrupts() {
        let pool = pool(1, 50);
        let started = Instant::now();
        let err = pool.run(job("spin", "")).unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(_)));
        assert!(err.to_string().contains("execution timeout"));
        assert!(started.elapsed() < Duration::from_secs(2));

        // the single slot becomes usable again once the spin notices the interrupt
        assert_eq!(pool.run(job("echo", "after")).unwrap(), "after");
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn slot_stays_busy_until_timed_out_job_finishes() {
        let pool = pool(2, 20);
        let err = pool.run(job("sleep:300", "")).unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(_)));
        assert_eq!(pool.busy(), 1);

        // the next job lands on the other, idle slot
        assert_eq!(pool.run(job("sleep:0", "")).unwrap(), "fake-1");

        thread::sleep(Duration::from_millis(400));
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn saturated_pool_queues_on_first_slot() {
        let pool = Arc::new(pool(2, 2_000));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || pool.run(job("sleep:30", "")).unwrap())
            })
            .collect();
        let names: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(names.len(), 6);
        assert!(names.iter().all(|name| name == "fake-0" || name == "fake-1"));
        assert_eq!(pool.busy(), 0);
    }

    #[test]
    fn late_interrupt_does_not_hit_next_job() {
        let interrupt = Interrupt::default();
        interrupt.begin(1);
        interrupt.end();
        interrupt.raise(1);
        interrupt.begin(2);
        assert!(!interrupt.is_raised());
        interrupt.raise(2);
        assert!(interrupt.is_raised());
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let config = PoolConfig {
            size: 0,
            ..PoolConfig::default()
        };
        let result = InterpreterPool::new("fake", &config, fake);
        assert!(result.is_err());
    }

    #[test]
    fn failing_factory_fails_pool_startup() {
        let config = PoolConfig {
            size: 3,
            ..PoolConfig::default()
        };
        let result: Result<InterpreterPool> =
            InterpreterPool::new("broken", &config, |_| -> Result<FakeRuntime> {
                Err(anyhow!("no runtime"))
            });
        let err = result.err().unwrap();
        assert!(format!("{err:#}").contains("no runtime"));
    }
}
