//! Sweep worker: releases collected objects' handles after each GC cycle.
//!
//! One dedicated thread per agent, started at VM init. It sleeps on the
//! [`SweepSignal`] and, each time a collection finishes, detaches the whole
//! [`CleanupQueue`] and releases every handle through the [`ReferenceOwner`].
//!
//! ```text
//!            collection finished
//!   Idle ─────────────────────────▶ Draining
//!    ▲                                 │
//!    └──────── queue released ─────────┘
//!    │
//!    │ stop requested / wait error
//!    ▼
//!  Terminated
//! ```
//!
//! Release work never runs under the queue lock or the signal lock: the
//! collector may be holding its own locks when it pushes onto the queue or
//! signals, and global reference deletion can enter the runtime.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use super::cleanup_queue::CleanupQueue;
use super::reference_owner::ReferenceOwner;
use crate::host::{HostRuntime, SetupError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SweepState {
    Idle = 0,
    Draining = 1,
    Terminated = 2,
}

impl SweepState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SweepState::Idle,
            1 => SweepState::Draining,
            _ => SweepState::Terminated,
        }
    }
}

#[derive(Debug, Default)]
struct SignalState {
    work_pending: bool,
    stop_requested: bool,
}

/// Outcome of waiting on the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wake {
    Work,
    Stop,
    /// The lock was poisoned; the wait can never be trusted again.
    Broken,
}

/// Wake condition shared by the collection-finished callback and the worker.
///
/// Several collections between two wakes collapse into one pending flag.
#[derive(Debug, Default)]
pub struct SweepSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
    cycles: AtomicU64,
}

impl SweepSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark work pending and wake the worker. Never blocks beyond the lock.
    pub fn notify_collection_finished(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);

        match self.state.lock() {
            Ok(mut state) => {
                state.work_pending = true;
                self.cond.notify_one();
            }
            Err(_) => log::warn!("Sweep signal lock poisoned; collection not signalled"),
        }
    }

    /// Ask the worker to exit at its next wake.
    pub fn request_stop(&self) {
        match self.state.lock() {
            Ok(mut state) => {
                state.stop_requested = true;
                self.cond.notify_all();
            }
            Err(_) => log::warn!("Sweep signal lock poisoned; stop not signalled"),
        }
    }

    /// Collections signalled so far.
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn wait(&self) -> Wake {
        let Ok(mut state) = self.state.lock() else {
            return Wake::Broken;
        };

        loop {
            if state.stop_requested {
                return Wake::Stop;
            }
            if state.work_pending {
                state.work_pending = false;
                return Wake::Work;
            }
            state = match self.cond.wait(state) {
                Ok(state) => state,
                Err(_) => return Wake::Broken,
            };
        }
    }
}

/// State and counters observable from outside the worker thread.
#[derive(Debug, Default)]
pub struct SweepStatus {
    state: AtomicU8,
    sweeps: AtomicU64,
}

impl SweepStatus {
    pub fn state(&self) -> SweepState {
        SweepState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Completed drain passes (including empty ones).
    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Acquire)
    }

    fn set(&self, state: SweepState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Everything the worker thread needs, shared with the agent.
pub struct Sweeper<H: HostRuntime> {
    pub(crate) queue: Arc<CleanupQueue>,
    pub(crate) owner: Arc<ReferenceOwner<H>>,
    pub(crate) signal: Arc<SweepSignal>,
    pub(crate) status: Arc<SweepStatus>,
    /// Set once the host is dead; no host calls are allowed after that.
    pub(crate) host_dead: Arc<AtomicBool>,
}

impl<H: HostRuntime> Clone for Sweeper<H> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            owner: self.owner.clone(),
            signal: self.signal.clone(),
            status: self.status.clone(),
            host_dead: self.host_dead.clone(),
        }
    }
}

impl<H: HostRuntime> Sweeper<H> {
    /// Detach the queue and release every handle. Returns how many were released.
    pub fn sweep_once(&self) -> usize {
        let handles = self.queue.drain_all();

        if self.host_dead.load(Ordering::Acquire) {
            if !handles.is_empty() {
                tracing::debug!(
                    "Host is dead, abandoning {} pending tag handles",
                    handles.len()
                );
            }
            return 0;
        }

        let released = handles
            .into_iter()
            .filter(|handle| self.owner.release(*handle))
            .count();

        self.status.sweeps.fetch_add(1, Ordering::AcqRel);
        if released > 0 {
            tracing::debug!("Sweep released {} tag handles", released);
        }
        released
    }

    fn run(self) {
        self.status.set(SweepState::Idle);

        loop {
            match self.signal.wait() {
                Wake::Work => {
                    self.status.set(SweepState::Draining);
                    self.sweep_once();
                    self.status.set(SweepState::Idle);
                }
                Wake::Stop => {
                    log::debug!("Tag sweep worker stopping");
                    break;
                }
                Wake::Broken => {
                    log::warn!(
                        "Tag sweep worker wait failed; collected tags will no longer be released"
                    );
                    break;
                }
            }
        }

        self.status.set(SweepState::Terminated);
    }
}

/// Handle to the running sweep thread.
pub struct SweepWorker {
    signal: Arc<SweepSignal>,
    status: Arc<SweepStatus>,
    thread: Option<JoinHandle<()>>,
}

impl SweepWorker {
    /// Start the worker on a host agent thread.
    pub fn spawn<H: HostRuntime>(
        host: &H,
        name: &str,
        sweeper: Sweeper<H>,
    ) -> Result<Self, SetupError> {
        let signal = sweeper.signal.clone();
        let status = sweeper.status.clone();
        let thread = host.spawn_agent_thread(name, Box::new(move || sweeper.run()))?;

        log::debug!("Tag sweep worker started on thread {}", name);

        Ok(Self {
            signal,
            status,
            thread: Some(thread),
        })
    }

    pub fn state(&self) -> SweepState {
        self.status.state()
    }

    /// Request a stop and join the thread.
    pub fn stop(&mut self) {
        self.signal.request_stop();

        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Tag sweep worker panicked: {:?}", e);
            }
        }
    }
}

impl Drop for SweepWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for SweepWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SweepWorker")
            .field("state", &self.state())
            .field("sweeps", &self.status.sweeps())
            .finish()
    }
}
