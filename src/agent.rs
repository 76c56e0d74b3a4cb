//! Lifecycle coordinator.
//!
//! [`TagAgent`] is the single process-scoped context of the tag subsystem. The
//! host glue creates it at load time and forwards lifecycle events to it
//! through [`HostEvents`]:
//!
//! | Event | Effect |
//! |-------|--------|
//! | load | request capabilities, enable events |
//! | VM start | bind `_setTag`/`_getTag`, set `engaged`, become ready |
//! | VM init | start the sweep worker |
//! | object free | queue the freed object's handle |
//! | GC finish | wake the sweep worker |
//! | VM death | refuse every further tag operation |
//!
//! The ready and dead flags are best-effort guards, as racy as the host's own
//! phase checks. Setup failures during start/init are fatal: the process exits
//! with [`FATAL_EXIT_CODE`].

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::AgentConfig;
use crate::host::{
    Capabilities, HostEvent, HostRuntime, NativeBinding, SetupError, TagWord, check_host_error,
};
use crate::tags::{
    CleanupQueue, ReferenceOwner, SweepSignal, SweepState, SweepStatus, SweepWorker, Sweeper,
    handle_from_word,
};

/// Exit code used when the agent cannot be wired into the host.
pub const FATAL_EXIT_CODE: i32 = 3;

/// Write a diagnostic and terminate the process immediately.
pub fn fatal_error(message: impl Display) -> ! {
    eprintln!("[openworkers-heap-tags] {}", message);
    std::process::exit(FATAL_EXIT_CODE)
}

/// Lifecycle callbacks delivered by the host.
///
/// `object_free` and `garbage_collection_finish` run on collector threads and
/// must stay short and non-blocking.
pub trait HostEvents: Send + Sync {
    fn vm_start(&self);
    fn vm_init(&self);
    fn object_free(&self, tag: TagWord);
    fn garbage_collection_finish(&self);
    fn vm_death(&self);
}

/// Snapshot of the agent's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagStats {
    /// Owned handles created
    pub allocated: u64,
    /// Owned handles released (overwrite, clear or sweep)
    pub released: u64,
    /// Owned handles currently alive
    pub live: u64,
    /// Handles waiting in the cleanup queue
    pub pending: u64,
    /// Frees reported after shutdown and dropped without queueing
    pub discarded: u64,
    /// Collections signalled by the host
    pub gc_cycles: u64,
    /// Sweep passes completed
    pub sweeps: u64,
    /// Worker state, `None` before VM init
    pub worker: Option<SweepState>,
}

pub struct TagAgent<H: HostRuntime> {
    host: Arc<H>,
    config: AgentConfig,
    binding: NativeBinding,

    /// Serializes native registration against the ready transition
    start_lock: Mutex<()>,
    ready: AtomicBool,
    dead: Arc<AtomicBool>,
    shut_down: AtomicBool,
    discarded: AtomicU64,

    sweeper: Sweeper<H>,
    worker: Mutex<Option<SweepWorker>>,
    worker_started: AtomicBool,
}

impl<H: HostRuntime> TagAgent<H> {
    /// Create the agent and subscribe to the host events it needs.
    ///
    /// Capability and event registration failures are logged, not fatal.
    pub fn load(host: Arc<H>, config: AgentConfig) -> Self {
        check_host_error(
            &*host,
            host.add_capabilities(&Capabilities::tagging()),
            "Unable to get necessary capabilities",
        );

        for event in HostEvent::ALL {
            check_host_error(&*host, host.enable_event(event), "Cannot set event notification");
        }

        let dead = Arc::new(AtomicBool::new(false));
        let sweeper = Sweeper {
            queue: Arc::new(CleanupQueue::new()),
            owner: Arc::new(ReferenceOwner::with_dead_flag(host.clone(), dead.clone())),
            signal: Arc::new(SweepSignal::new()),
            status: Arc::new(SweepStatus::default()),
            host_dead: dead.clone(),
        };

        log::info!("Heap tag agent loaded (class: {})", config.tagger_class);

        Self {
            binding: config.native_binding(),
            host,
            config,
            start_lock: Mutex::new(()),
            ready: AtomicBool::new(false),
            dead,
            shut_down: AtomicBool::new(false),
            discarded: AtomicU64::new(0),
            sweeper,
            worker: Mutex::new(None),
            worker_started: AtomicBool::new(false),
        }
    }

    /// Bind the native entry points and mark the agent ready.
    pub fn try_start(&self) -> Result<(), SetupError> {
        let _guard = self.start_lock.lock();

        self.host.register_natives(&self.binding)?;
        self.host.set_engaged(&self.binding)?;
        self.ready.store(true, Ordering::Release);

        log::info!("Heap tag natives registered on {}", self.binding.class);
        Ok(())
    }

    /// Start the sweep worker. Starting twice is a no-op.
    pub fn try_init(&self) -> Result<(), SetupError> {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.worker_started.load(Ordering::Acquire) {
            log::warn!("Heap tag sweep worker already started");
            return Ok(());
        }

        *worker = Some(SweepWorker::spawn(
            &*self.host,
            &self.config.sweeper_thread_name,
            self.sweeper.clone(),
        )?);
        self.worker_started.store(true, Ordering::Release);
        Ok(())
    }

    /// `_setTag(object, expression)`
    pub fn set_tag(&self, object: Option<&H::Object>, expression: Option<&H::Value>) {
        if !self.accepts_calls() {
            return;
        }
        self.sweeper.owner.set_association(object, expression);
    }

    /// `_getTag(object)`
    pub fn get_tag(&self, object: Option<&H::Object>) -> Option<H::Value> {
        if !self.accepts_calls() {
            return None;
        }
        self.sweeper.owner.get_association(object)
    }

    fn accepts_calls(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.dead.load(Ordering::Acquire)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn stats(&self) -> TagStats {
        let owner = &self.sweeper.owner;
        TagStats {
            allocated: owner.allocated(),
            released: owner.released(),
            live: owner.live(),
            pending: self.sweeper.queue.len(),
            discarded: self.discarded.load(Ordering::Relaxed),
            gc_cycles: self.sweeper.signal.cycles(),
            sweeps: self.sweeper.status.sweeps(),
            worker: self
                .worker_started
                .load(Ordering::Acquire)
                .then(|| self.sweeper.status.state()),
        }
    }

    /// Stop and join the sweep worker, then drain the queue one last time.
    ///
    /// The final drain is skipped once the host is dead or when disabled in
    /// the configuration. Nothing drains the queue after this returns, so
    /// frees reported later are counted in [`TagStats::discarded`] and dropped.
    pub fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        self.shut_down.store(true, Ordering::Release);

        let worker = self.worker.lock().take();
        let Some(mut worker) = worker else {
            return;
        };
        worker.stop();

        if self.config.final_sweep_on_shutdown && !self.is_dead() {
            let released = self.sweeper.sweep_once();
            log::debug!("Final sweep released {} tag handles", released);
        }

        log::info!("Heap tag agent shut down");
    }
}

impl<H: HostRuntime> HostEvents for TagAgent<H> {
    fn vm_start(&self) {
        if let Err(e) = self.try_start() {
            fatal_error(format!("ERROR: {}", e));
        }
    }

    fn vm_init(&self) {
        if let Err(e) = self.try_init() {
            fatal_error(format!("ERROR: {}", e));
        }
    }

    fn object_free(&self, tag: TagWord) {
        if self.is_dead() {
            return;
        }
        let Some(handle) = handle_from_word(tag) else {
            return;
        };
        if self.shut_down.load(Ordering::Acquire) {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Discarding tag handle {} freed after shutdown", handle.id());
            return;
        }
        self.sweeper.queue.enqueue(handle);
    }

    fn garbage_collection_finish(&self) {
        self.sweeper.signal.notify_collection_finished();
    }

    fn vm_death(&self) {
        self.dead.store(true, Ordering::Release);
        log::info!("VM death: heap tag operations disabled");
    }
}

impl<H: HostRuntime> Drop for TagAgent<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<H: HostRuntime> std::fmt::Debug for TagAgent<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagAgent")
            .field("ready", &self.is_ready())
            .field("dead", &self.is_dead())
            .field("stats", &self.stats())
            .finish()
    }
}
