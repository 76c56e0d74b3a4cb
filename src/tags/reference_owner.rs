//! Reference Owner: turns tag expressions into long-lived handles.
//!
//! Each non-null tag owns exactly one host global reference, parked in an
//! explicit handle table keyed by [`OwnedHandle`]. The tag slot only ever holds
//! the handle id. Ids come from a monotonic counter and are never reused, so a
//! stale id read back from a slot can at worst miss the table, never release
//! somebody else's reference.
//!
//! The table lock is held for O(1) insert/remove/lookup only. Global reference
//! creation and deletion happen outside it.
//!
//! Both entry points do nothing once the shared dead flag is raised, or when
//! the host refuses to read the object's slot.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use super::tag_store::{OwnedHandle, TagStore};
use crate::host::{HostRuntime, check_host_error};

pub struct ReferenceOwner<H: HostRuntime> {
    host: Arc<H>,
    /// Raised at VM death; no host calls after that.
    dead: Arc<AtomicBool>,
    table: Mutex<HashMap<OwnedHandle, H::Global>>,
    next_id: AtomicU64,
    allocated: AtomicU64,
    released: AtomicU64,
}

impl<H: HostRuntime> ReferenceOwner<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self::with_dead_flag(host, Arc::new(AtomicBool::new(false)))
    }

    /// Share the agent's dead flag so the owner refuses calls after VM death.
    pub fn with_dead_flag(host: Arc<H>, dead: Arc<AtomicBool>) -> Self {
        Self {
            host,
            dead,
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            allocated: AtomicU64::new(0),
            released: AtomicU64::new(0),
        }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    fn store(&self) -> TagStore<'_, H> {
        TagStore::new(&self.host)
    }

    /// Associate `value` with `object`, or clear the association.
    ///
    /// Any handle previously stored on `object` is released before the new
    /// one is installed, for both overwrite and explicit clear. A null object,
    /// a dead host, or a refused slot read is a no-op.
    pub fn set_association(&self, object: Option<&H::Object>, value: Option<&H::Value>) {
        let Some(object) = object else {
            return;
        };
        if self.is_dead() {
            return;
        }
        let store = self.store();

        let Ok(previous) = store.read(object) else {
            return;
        };
        if let Some(previous) = previous {
            self.release(previous);
        }

        let Some(value) = value else {
            store.set(object, None);
            return;
        };

        let Some(handle) = self.acquire(value) else {
            // Slot may still hold the id we just released; it now misses the table.
            store.set(object, None);
            return;
        };

        if !store.set(object, Some(handle)) {
            self.release(handle);
        }
    }

    /// The value currently associated with `object`, if any.
    pub fn get_association(&self, object: Option<&H::Object>) -> Option<H::Value> {
        if self.is_dead() {
            return None;
        }
        let handle = self.store().get(object?)?;
        let table = self.table.lock();
        table.get(&handle).map(|global| self.host.resolve_global(global))
    }

    /// Create an owned handle for `value`.
    pub fn acquire(&self, value: &H::Value) -> Option<OwnedHandle> {
        let global = match self.host.new_global_ref(value) {
            Ok(global) => global,
            Err(e) => {
                check_host_error(&*self.host, Err(e), "Cannot create global reference");
                return None;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = OwnedHandle::from_id(NonZeroU64::new(id)?);
        self.table.lock().insert(handle, global);
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Some(handle)
    }

    /// Release the reference behind `handle`. Unknown handles are ignored.
    ///
    /// Returns whether a reference was actually released.
    pub fn release(&self, handle: OwnedHandle) -> bool {
        let global = self.table.lock().remove(&handle);

        match global {
            Some(global) => {
                self.host.delete_global_ref(global);
                self.released.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                tracing::trace!("Ignoring release of unknown tag handle {}", handle.id());
                false
            }
        }
    }

    /// Number of handles created so far.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Number of handles released so far.
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }

    /// Number of handles currently alive.
    pub fn live(&self) -> u64 {
        self.table.lock().len() as u64
    }
}

impl<H: HostRuntime> std::fmt::Debug for ReferenceOwner<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceOwner")
            .field("allocated", &self.allocated())
            .field("released", &self.released())
            .field("live", &self.live())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{Phase, SimHost, SimValue};

    fn live_host() -> Arc<SimHost> {
        let host = Arc::new(SimHost::new());
        host.set_phase(Phase::Live);
        host
    }

    #[test]
    fn test_set_then_get() {
        let host = live_host();
        let owner = ReferenceOwner::new(host.clone());
        let object = host.alloc();
        let v1 = SimValue::new("v1");

        owner.set_association(Some(&object), Some(&v1));

        assert_eq!(owner.get_association(Some(&object)), Some(v1));
        assert_eq!(owner.allocated(), 1);
        assert_eq!(host.live_globals(), 1);
    }

    #[test]
    fn test_overwrite_releases_previous() {
        let host = live_host();
        let owner = ReferenceOwner::new(host.clone());
        let object = host.alloc();

        owner.set_association(Some(&object), Some(&SimValue::new("a")));
        owner.set_association(Some(&object), Some(&SimValue::new("b")));

        assert_eq!(owner.get_association(Some(&object)), Some(SimValue::new("b")));
        assert_eq!(owner.allocated(), 2);
        assert_eq!(owner.released(), 1);
        assert_eq!(owner.live(), 1);
        assert_eq!(host.live_globals(), 1);
    }

    #[test]
    fn test_clear_releases_immediately() {
        let host = live_host();
        let owner = ReferenceOwner::new(host.clone());
        let object = host.alloc();

        owner.set_association(Some(&object), Some(&SimValue::new("a")));
        owner.set_association(Some(&object), None);

        assert_eq!(owner.get_association(Some(&object)), None);
        assert_eq!(owner.released(), 1);
        assert_eq!(host.live_globals(), 0);
        assert_eq!(host.get_tag(&object), Ok(0));
    }

    #[test]
    fn test_null_object_is_noop() {
        let host = live_host();
        let owner = ReferenceOwner::new(host.clone());

        owner.set_association(None, Some(&SimValue::new("a")));

        assert_eq!(owner.get_association(None), None);
        assert_eq!(owner.allocated(), 0);
        assert_eq!(host.globals_created(), 0);
    }

    #[test]
    fn test_release_is_exactly_once() {
        let host = live_host();
        let owner = ReferenceOwner::new(host.clone());
        let handle = owner.acquire(&SimValue::new("x")).unwrap();

        assert!(owner.release(handle));
        assert!(!owner.release(handle));
        assert_eq!(host.globals_deleted(), 1);
        assert_eq!(host.invalid_deletes(), 0);
    }

    #[test]
    fn test_refused_install_does_not_leak() {
        let host = live_host();
        let owner = ReferenceOwner::new(host.clone());
        let object = host.alloc();

        host.set_phase(Phase::Dead);
        owner.set_association(Some(&object), Some(&SimValue::new("a")));

        assert_eq!(owner.live(), 0);
        assert_eq!(owner.allocated(), 0);
        assert_eq!(owner.released(), 0);
        assert_eq!(host.globals_created(), 0);
        assert_eq!(host.globals_deleted(), 0);
    }

    #[test]
    fn test_restricted_phase_keeps_existing_tag() {
        let host = live_host();
        let owner = ReferenceOwner::new(host.clone());
        let object = host.alloc();
        owner.set_association(Some(&object), Some(&SimValue::new("a")));

        host.set_phase(Phase::Dead);
        owner.set_association(Some(&object), None);
        owner.set_association(Some(&object), Some(&SimValue::new("b")));

        assert_eq!(owner.allocated(), 1);
        assert_eq!(owner.released(), 0);
        assert_eq!(host.globals_created(), 1);
        assert_eq!(host.globals_deleted(), 0);
    }

    #[test]
    fn test_dead_flag_silences_owner() {
        let host = live_host();
        let dead = Arc::new(AtomicBool::new(false));
        let owner = ReferenceOwner::with_dead_flag(host.clone(), dead.clone());
        let object = host.alloc();
        owner.set_association(Some(&object), Some(&SimValue::new("a")));

        dead.store(true, Ordering::Release);
        owner.set_association(Some(&object), Some(&SimValue::new("b")));
        owner.set_association(Some(&object), None);

        assert_eq!(owner.get_association(Some(&object)), None);
        assert_eq!(owner.allocated(), 1);
        assert_eq!(owner.released(), 0);
        assert_eq!(host.globals_created(), 1);
    }

    #[test]
    fn test_handle_ids_are_not_reused() {
        let host = live_host();
        let owner = ReferenceOwner::new(host.clone());
        let first = owner.acquire(&SimValue::new("x")).unwrap();
        owner.release(first);
        let second = owner.acquire(&SimValue::new("y")).unwrap();
        assert_ne!(first, second);
    }
}
