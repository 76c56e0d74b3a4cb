//! A host whose reference calls re-enter the agent's collector callbacks.
//!
//! Real hosts may run a collection, and so deliver `object_free` and
//! `garbage_collection_finish`, from inside any allocating call. The agent must
//! not hold one of its own locks across such a call.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak, mpsc};
use std::thread;
use std::time::Duration;

use openworkers_heap_tags::sim::{Phase, SimGlobal, SimHost, SimObject, SimValue};
use openworkers_heap_tags::{
    AgentConfig, Capabilities, HostError, HostEvent, HostEvents, HostRuntime, NativeBinding,
    SetupError, TagAgent, TagWord,
};

/// Word that never matches a live handle id.
const FOREIGN_TAG: TagWord = u64::MAX;

struct ReentrantHost {
    inner: Arc<SimHost>,
    listener: OnceLock<Weak<dyn HostEvents>>,
    reentries: AtomicU64,
}

impl ReentrantHost {
    fn new(inner: Arc<SimHost>) -> Self {
        Self {
            inner,
            listener: OnceLock::new(),
            reentries: AtomicU64::new(0),
        }
    }

    fn reenter(&self) {
        let Some(events) = self.listener.get().and_then(Weak::upgrade) else {
            return;
        };
        self.reentries.fetch_add(1, Ordering::Relaxed);
        events.object_free(FOREIGN_TAG);
        events.garbage_collection_finish();
    }
}

impl HostRuntime for ReentrantHost {
    type Object = SimObject;
    type Value = SimValue;
    type Global = SimGlobal;

    fn get_tag(&self, object: &SimObject) -> Result<TagWord, HostError> {
        self.inner.get_tag(object)
    }

    fn set_tag(&self, object: &SimObject, tag: TagWord) -> Result<(), HostError> {
        self.inner.set_tag(object, tag)
    }

    fn new_global_ref(&self, value: &SimValue) -> Result<SimGlobal, HostError> {
        let global = self.inner.new_global_ref(value);
        self.reenter();
        global
    }

    fn delete_global_ref(&self, global: SimGlobal) {
        self.inner.delete_global_ref(global);
        self.reenter();
    }

    fn resolve_global(&self, global: &SimGlobal) -> SimValue {
        self.inner.resolve_global(global)
    }

    fn add_capabilities(&self, capabilities: &Capabilities) -> Result<(), HostError> {
        self.inner.add_capabilities(capabilities)
    }

    fn enable_event(&self, event: HostEvent) -> Result<(), HostError> {
        self.inner.enable_event(event)
    }

    fn register_natives(&self, binding: &NativeBinding) -> Result<(), SetupError> {
        self.inner.register_natives(binding)
    }

    fn set_engaged(&self, binding: &NativeBinding) -> Result<(), SetupError> {
        self.inner.set_engaged(binding)
    }

    fn error_name(&self, code: i32) -> Option<String> {
        self.inner.error_name(code)
    }
}

fn launch_reentrant() -> (Arc<SimHost>, Arc<ReentrantHost>, Arc<TagAgent<ReentrantHost>>) {
    let sim = Arc::new(SimHost::new());
    let host = Arc::new(ReentrantHost::new(sim.clone()));
    let agent = Arc::new(TagAgent::load(host.clone(), AgentConfig::default()));

    let listener: Weak<dyn HostEvents> = Arc::downgrade(&agent) as Weak<dyn HostEvents>;
    assert!(host.listener.set(listener.clone()).is_ok());
    sim.attach(listener);
    sim.start_vm();
    sim.init_vm();
    assert_eq!(sim.phase(), Phase::Live);

    (sim, host, agent)
}

#[test]
fn test_reentrant_host_calls_do_not_deadlock() {
    let (sim, host, agent) = launch_reentrant();
    let (done_tx, done_rx) = mpsc::channel();

    let worker_sim = sim.clone();
    let worker_agent = agent.clone();
    let driver = thread::spawn(move || {
        let objects: Vec<_> = (0..20).map(|_| worker_sim.alloc()).collect();
        for (i, object) in objects.iter().enumerate() {
            worker_agent.set_tag(Some(object), Some(&SimValue::new(&format!("v{i}"))));
            // Overwrite releases the first reference inside the same call.
            worker_agent.set_tag(Some(object), Some(&SimValue::new(&format!("w{i}"))));
            assert_eq!(
                worker_agent.get_tag(Some(object)),
                Some(SimValue::new(&format!("w{i}")))
            );
        }
        worker_agent.set_tag(Some(&objects[0]), None);

        for object in &objects {
            worker_sim.unroot(object);
        }
        worker_sim.collect();
        done_tx.send(()).ok();
    });

    assert!(
        done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "tag calls deadlocked against a re-entering host"
    );
    driver.join().unwrap();

    assert!(common::wait_for(|| {
        let stats = agent.stats();
        stats.released == 40 && stats.pending == 0
    }));
    // 40 creations and 40 deletions, each calling back in once.
    assert_eq!(host.reentries.load(Ordering::Relaxed), 80);

    let stats = agent.stats();
    assert_eq!(stats.allocated, 40);
    assert_eq!(stats.live, 0);
    assert_eq!(sim.live_globals(), 0);
    assert_eq!(sim.invalid_deletes(), 0);
}

#[test]
fn test_shutdown_with_reentrant_final_sweep() {
    let (sim, _host, agent) = launch_reentrant();
    let object = sim.alloc();
    agent.set_tag(Some(&object), Some(&SimValue::new("v")));
    let tag = sim.get_tag(&object).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let worker_agent = agent.clone();
    let driver = thread::spawn(move || {
        // Whichever sweep deletes it, the host calls back in from that delete.
        worker_agent.object_free(tag);
        worker_agent.shutdown();
        done_tx.send(()).ok();
    });

    assert!(
        done_rx.recv_timeout(Duration::from_secs(5)).is_ok(),
        "shutdown deadlocked against a re-entering host"
    );
    driver.join().unwrap();

    assert_eq!(sim.live_globals(), 0);
    assert_eq!(sim.invalid_deletes(), 0);
}
