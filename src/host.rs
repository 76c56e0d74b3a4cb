//! Host runtime seam.
//!
//! Everything the tag subsystem needs from the garbage-collected host lives
//! behind [`HostRuntime`]: the per-object tag slot, long-lived (global)
//! references, load-time capability and event registration, and the binding
//! of the two native entry points on the managed side.
//!
//! ## Threads
//!
//! Implementations are called from three kinds of threads:
//! - application threads (tag get/set through the native entry points)
//! - collector threads (object-free and collection-finished events)
//! - the sweep worker (global reference release)
//!
//! `resolve_global` may be called while the handle table lock is held, so it
//! must never allocate on the managed heap or otherwise re-enter the collector.

use std::thread::{self, JoinHandle};

/// Raw value of a host tag slot. Zero means the object carries no tag.
pub type TagWord = u64;

/// The untagged slot value.
pub const NO_TAG: TagWord = 0;

/// Error returned by a call into the host's instrumentation interface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The host is in a lifecycle phase that forbids the call.
    #[error("operation not permitted in the current lifecycle phase")]
    WrongPhase,

    /// Any other non-success code reported by the host.
    #[error("{code}({})", .name.as_deref().unwrap_or("Unknown"))]
    Code { code: i32, name: Option<String> },
}

impl HostError {
    pub fn code(code: i32) -> Self {
        Self::Code { code, name: None }
    }

    pub fn is_wrong_phase(&self) -> bool {
        matches!(self, Self::WrongPhase)
    }
}

/// Unrecoverable failure while wiring the agent into the host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    #[error("cannot find class {0}")]
    ClassNotFound(String),

    #[error("cannot register natives for {class}: {reason}")]
    RegisterNatives { class: String, reason: String },

    #[error("cannot find static field {field} on {class}")]
    FieldNotFound { class: String, field: String },

    #[error("cannot start agent thread {name}: {reason}")]
    ThreadSpawn { name: String, reason: String },
}

/// Capabilities the agent requests at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub can_tag_objects: bool,
    pub can_generate_object_free_events: bool,
    pub can_generate_garbage_collection_events: bool,
    pub can_signal_thread: bool,
}

impl Capabilities {
    /// The set required for tagging with collector-driven cleanup.
    pub fn tagging() -> Self {
        Self {
            can_tag_objects: true,
            can_generate_object_free_events: true,
            can_generate_garbage_collection_events: true,
            can_signal_thread: true,
        }
    }
}

/// Host events the agent subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEvent {
    VmStart,
    VmInit,
    VmDeath,
    ObjectFree,
    GarbageCollectionFinish,
}

impl HostEvent {
    pub const ALL: [HostEvent; 5] = [
        HostEvent::VmStart,
        HostEvent::GarbageCollectionFinish,
        HostEvent::VmInit,
        HostEvent::VmDeath,
        HostEvent::ObjectFree,
    ];
}

/// One native method exposed to managed code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeMethod {
    pub name: String,
    pub signature: String,
}

/// Where the native entry points are bound on the managed side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeBinding {
    /// Internal class name, e.g. `net/jonbell/examples/jvmti/tagging/runtime/Tagger`.
    pub class: String,
    pub set_tag: NativeMethod,
    pub get_tag: NativeMethod,
    /// Static `int` field set to 1 once the natives are registered.
    pub engaged_field: String,
}

/// Interface to the garbage-collected host runtime.
pub trait HostRuntime: Send + Sync + 'static {
    /// Reference to a managed object, as handed to a native entry point.
    type Object;
    /// Short-lived reference to a tag expression.
    type Value;
    /// Long-lived reference that keeps its target alive until deleted.
    type Global: Send + 'static;

    fn get_tag(&self, object: &Self::Object) -> Result<TagWord, HostError>;

    fn set_tag(&self, object: &Self::Object, tag: TagWord) -> Result<(), HostError>;

    fn new_global_ref(&self, value: &Self::Value) -> Result<Self::Global, HostError>;

    fn delete_global_ref(&self, global: Self::Global);

    /// Borrow the target of a global reference as a value. Must not allocate.
    fn resolve_global(&self, global: &Self::Global) -> Self::Value;

    fn add_capabilities(&self, capabilities: &Capabilities) -> Result<(), HostError>;

    fn enable_event(&self, event: HostEvent) -> Result<(), HostError>;

    fn register_natives(&self, binding: &NativeBinding) -> Result<(), SetupError>;

    /// Flip the managed-side `engaged` flag so managed code starts calling in.
    fn set_engaged(&self, binding: &NativeBinding) -> Result<(), SetupError>;

    /// Human-readable name for a host error code, if the host knows one.
    fn error_name(&self, _code: i32) -> Option<String> {
        None
    }

    /// Start a host-visible agent thread running `body`.
    ///
    /// Hosts that need agent threads registered with the runtime (so they can
    /// call back into it) override this.
    fn spawn_agent_thread(
        &self,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> Result<JoinHandle<()>, SetupError> {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map_err(|e| SetupError::ThreadSpawn {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Log a failed instrumentation call and carry on.
///
/// Restricted-phase errors are expected and stay silent. Returns `true` when
/// the call succeeded.
pub fn check_host_error<H: HostRuntime + ?Sized>(
    host: &H,
    result: Result<(), HostError>,
    context: &str,
) -> bool {
    match result {
        Ok(()) => true,
        Err(HostError::WrongPhase) => false,
        Err(HostError::Code { code, name }) => {
            let name = name.or_else(|| host.error_name(code));
            log::error!(
                "host instrumentation call failed: {}({}): {}",
                code,
                name.as_deref().unwrap_or("Unknown"),
                context
            );
            false
        }
    }
}
