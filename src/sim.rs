//! In-process simulated host runtime.
//!
//! [`SimHost`] is a tiny managed heap with everything the tag subsystem
//! consumes from a real host: a tag word per object, counted global
//! references, lifecycle phases, managed-side class binding and event
//! delivery. [`SimHost::collect`] reclaims every unrooted object, reports each
//! tagged one through `object_free` while holding a collector lock, then
//! reports `garbage_collection_finish`, the same order a real collector uses.
//!
//! ```ignore
//! let (host, agent) = sim::launch(AgentConfig::default());
//! let object = host.alloc();
//! agent.set_tag(Some(&object), Some(&SimValue::new("expr")));
//! host.unroot(&object);
//! host.collect();
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::agent::{HostEvents, TagAgent};
use crate::config::{AgentConfig, DEFAULT_ENGAGED_FIELD, DEFAULT_TAGGER_CLASS};
use crate::host::{
    Capabilities, HostError, HostEvent, HostRuntime, NO_TAG, NativeBinding, SetupError, TagWord,
};

pub const ERROR_INVALID_OBJECT: i32 = 20;
pub const ERROR_MUST_POSSESS_CAPABILITY: i32 = 99;
pub const ERROR_WRONG_PHASE: i32 = 112;

/// Host lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    OnLoad,
    Start,
    Live,
    Dead,
}

impl Phase {
    fn allows_tagging(self) -> bool {
        matches!(self, Phase::Start | Phase::Live)
    }
}

/// Reference to a simulated managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimObject(u64);

impl SimObject {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A simulated managed value used as a tag expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimValue(Arc<str>);

impl SimValue {
    pub fn new(value: &str) -> Self {
        Self(Arc::from(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A counted global reference to a [`SimValue`].
#[derive(Debug)]
pub struct SimGlobal {
    id: u64,
    value: SimValue,
}

#[derive(Debug, Default)]
struct Heap {
    next_object: u64,
    /// object id → (tag, rooted)
    objects: HashMap<u64, (TagWord, bool)>,
}

#[derive(Debug, Default)]
struct Globals {
    next_id: u64,
    live: HashSet<u64>,
    created: u64,
    deleted: u64,
    invalid_deletes: u64,
}

#[derive(Debug, Default)]
struct Managed {
    classes: HashSet<String>,
    natives: Vec<String>,
    engaged: bool,
    capabilities: Option<Capabilities>,
    refuse_capabilities: Option<HostError>,
    events: HashSet<HostEvent>,
}

pub struct SimHost {
    phase: RwLock<Phase>,
    heap: Mutex<Heap>,
    globals: Mutex<Globals>,
    managed: Mutex<Managed>,
    /// Held for the whole of a collection, like a collector-internal lock.
    collector: Mutex<()>,
    listener: RwLock<Option<Weak<dyn HostEvents>>>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHost {
    /// A host whose managed side defines the default tagger class.
    pub fn new() -> Self {
        Self::with_classes(&[DEFAULT_TAGGER_CLASS])
    }

    pub fn with_classes(classes: &[&str]) -> Self {
        let managed = Managed {
            classes: classes.iter().map(|c| c.to_string()).collect(),
            ..Managed::default()
        };

        Self {
            phase: RwLock::new(Phase::OnLoad),
            heap: Mutex::new(Heap::default()),
            globals: Mutex::new(Globals::default()),
            managed: Mutex::new(managed),
            collector: Mutex::new(()),
            listener: RwLock::new(None),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    pub fn set_phase(&self, phase: Phase) {
        *self.phase.write() = phase;
    }

    /// Deliver lifecycle events to `listener` from now on.
    pub fn attach(&self, listener: Weak<dyn HostEvents>) {
        *self.listener.write() = Some(listener);
    }

    /// Enter the start phase and deliver VM start.
    pub fn start_vm(&self) {
        self.set_phase(Phase::Start);
        self.dispatch(HostEvent::VmStart, |events| events.vm_start());
    }

    /// Enter the live phase and deliver VM init.
    pub fn init_vm(&self) {
        self.set_phase(Phase::Live);
        self.dispatch(HostEvent::VmInit, |events| events.vm_init());
    }

    /// Deliver VM death and enter the dead phase.
    pub fn kill_vm(&self) {
        self.dispatch(HostEvent::VmDeath, |events| events.vm_death());
        self.set_phase(Phase::Dead);
    }

    /// Allocate a rooted object.
    pub fn alloc(&self) -> SimObject {
        let mut heap = self.heap.lock();
        heap.next_object += 1;
        let id = heap.next_object;
        heap.objects.insert(id, (NO_TAG, true));
        SimObject(id)
    }

    /// Drop the root on `object`, making it collectable.
    pub fn unroot(&self, object: &SimObject) {
        if let Some(entry) = self.heap.lock().objects.get_mut(&object.0) {
            entry.1 = false;
        }
    }

    pub fn is_alive(&self, object: &SimObject) -> bool {
        self.heap.lock().objects.contains_key(&object.0)
    }

    /// Run one collection. Returns the number of objects reclaimed.
    pub fn collect(&self) -> usize {
        let _collector = self.collector.lock();

        let freed: Vec<TagWord> = {
            let mut heap = self.heap.lock();
            let dead: Vec<u64> = heap
                .objects
                .iter()
                .filter(|(_, (_, rooted))| !rooted)
                .map(|(id, _)| *id)
                .collect();
            dead.iter()
                .filter_map(|id| heap.objects.remove(id))
                .map(|(tag, _)| tag)
                .collect()
        };

        if self.phase().allows_tagging() {
            for tag in freed.iter().copied().filter(|tag| *tag != NO_TAG) {
                self.dispatch(HostEvent::ObjectFree, |events| events.object_free(tag));
            }
            self.dispatch(HostEvent::GarbageCollectionFinish, |events| {
                events.garbage_collection_finish()
            });
        }

        tracing::trace!("Simulated collection reclaimed {} objects", freed.len());
        freed.len()
    }

    fn dispatch(&self, event: HostEvent, deliver: impl FnOnce(&dyn HostEvents)) {
        if !self.is_event_enabled(event) {
            return;
        }
        let listener = self.listener.read().as_ref().and_then(Weak::upgrade);
        if let Some(listener) = listener {
            deliver(&*listener);
        }
    }

    pub fn globals_created(&self) -> u64 {
        self.globals.lock().created
    }

    pub fn globals_deleted(&self) -> u64 {
        self.globals.lock().deleted
    }

    pub fn live_globals(&self) -> usize {
        self.globals.lock().live.len()
    }

    /// Deletes of a reference that was not alive (double release).
    pub fn invalid_deletes(&self) -> u64 {
        self.globals.lock().invalid_deletes
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.managed.lock().capabilities
    }

    /// Make `add_capabilities` fail with `error`.
    pub fn refuse_capabilities(&self, error: HostError) {
        self.managed.lock().refuse_capabilities = Some(error);
    }

    pub fn is_event_enabled(&self, event: HostEvent) -> bool {
        self.managed.lock().events.contains(&event)
    }

    /// Value of the managed-side `engaged` flag.
    pub fn is_engaged(&self) -> bool {
        self.managed.lock().engaged
    }

    pub fn registered_natives(&self) -> Vec<String> {
        self.managed.lock().natives.clone()
    }

    fn check_object(&self, object: &SimObject) -> Result<(), HostError> {
        if !self.phase().allows_tagging() {
            return Err(HostError::WrongPhase);
        }
        if !self.is_alive(object) {
            return Err(HostError::code(ERROR_INVALID_OBJECT));
        }
        Ok(())
    }
}

impl HostRuntime for SimHost {
    type Object = SimObject;
    type Value = SimValue;
    type Global = SimGlobal;

    fn get_tag(&self, object: &SimObject) -> Result<TagWord, HostError> {
        self.check_object(object)?;
        let heap = self.heap.lock();
        heap.objects
            .get(&object.0)
            .map(|(tag, _)| *tag)
            .ok_or_else(|| HostError::code(ERROR_INVALID_OBJECT))
    }

    fn set_tag(&self, object: &SimObject, tag: TagWord) -> Result<(), HostError> {
        self.check_object(object)?;
        let mut heap = self.heap.lock();
        let entry = heap
            .objects
            .get_mut(&object.0)
            .ok_or_else(|| HostError::code(ERROR_INVALID_OBJECT))?;
        entry.0 = tag;
        Ok(())
    }

    fn new_global_ref(&self, value: &SimValue) -> Result<SimGlobal, HostError> {
        let mut globals = self.globals.lock();
        globals.next_id += 1;
        let id = globals.next_id;
        globals.live.insert(id);
        globals.created += 1;
        Ok(SimGlobal {
            id,
            value: value.clone(),
        })
    }

    fn delete_global_ref(&self, global: SimGlobal) {
        let mut globals = self.globals.lock();
        if globals.live.remove(&global.id) {
            globals.deleted += 1;
        } else {
            globals.invalid_deletes += 1;
        }
    }

    fn resolve_global(&self, global: &SimGlobal) -> SimValue {
        global.value.clone()
    }

    fn add_capabilities(&self, capabilities: &Capabilities) -> Result<(), HostError> {
        let mut managed = self.managed.lock();
        if let Some(error) = managed.refuse_capabilities.clone() {
            return Err(error);
        }
        managed.capabilities = Some(*capabilities);
        Ok(())
    }

    fn enable_event(&self, event: HostEvent) -> Result<(), HostError> {
        self.managed.lock().events.insert(event);
        Ok(())
    }

    fn register_natives(&self, binding: &NativeBinding) -> Result<(), SetupError> {
        let mut managed = self.managed.lock();
        if !managed.classes.contains(&binding.class) {
            return Err(SetupError::ClassNotFound(binding.class.clone()));
        }
        managed.natives = vec![binding.set_tag.name.clone(), binding.get_tag.name.clone()];
        Ok(())
    }

    fn set_engaged(&self, binding: &NativeBinding) -> Result<(), SetupError> {
        let mut managed = self.managed.lock();
        if !managed.classes.contains(&binding.class) {
            return Err(SetupError::ClassNotFound(binding.class.clone()));
        }
        if binding.engaged_field != DEFAULT_ENGAGED_FIELD {
            return Err(SetupError::FieldNotFound {
                class: binding.class.clone(),
                field: binding.engaged_field.clone(),
            });
        }
        managed.engaged = true;
        Ok(())
    }

    fn error_name(&self, code: i32) -> Option<String> {
        let name = match code {
            ERROR_INVALID_OBJECT => "INVALID_OBJECT",
            ERROR_MUST_POSSESS_CAPABILITY => "MUST_POSSESS_CAPABILITY",
            ERROR_WRONG_PHASE => "WRONG_PHASE",
            _ => return None,
        };
        Some(name.to_string())
    }
}

impl std::fmt::Debug for SimHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHost")
            .field("phase", &self.phase())
            .field("objects", &self.heap.lock().objects.len())
            .field("live_globals", &self.live_globals())
            .finish()
    }
}

/// Load an agent into a fresh simulated host and drive it to the live phase.
pub fn launch(config: AgentConfig) -> (Arc<SimHost>, Arc<TagAgent<SimHost>>) {
    let host = Arc::new(SimHost::new());
    let agent = Arc::new(TagAgent::load(host.clone(), config));
    let listener: Weak<dyn HostEvents> = Arc::downgrade(&agent) as Weak<dyn HostEvents>;
    host.attach(listener);
    host.start_vm();
    host.init_vm();
    (host, agent)
}
