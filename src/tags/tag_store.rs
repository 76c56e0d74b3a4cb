//! Tag Store: a thin view over the host's per-object tag slot.
//!
//! This is the only place a [`TagWord`] is turned into an [`OwnedHandle`] or
//! back. Restricted-phase refusals are silent: `get` reports them as "no
//! tag", `set` as "not stored", and `read` hands them back so a caller can stop
//! before touching the host again.

use std::num::NonZeroU64;

use crate::host::{HostError, HostRuntime, NO_TAG, TagWord, check_host_error};

/// Typed handle to one entry in the reference owner's handle table.
///
/// Never zero, so `Option<OwnedHandle>` maps one-to-one onto a tag slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnedHandle(NonZeroU64);

impl OwnedHandle {
    pub(crate) fn from_id(id: NonZeroU64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0.get()
    }
}

/// Slot word to handle.
#[inline]
pub fn handle_from_word(word: TagWord) -> Option<OwnedHandle> {
    NonZeroU64::new(word).map(OwnedHandle)
}

/// Handle to slot word.
#[inline]
pub fn word_from_handle(handle: Option<OwnedHandle>) -> TagWord {
    handle.map_or(NO_TAG, |h| h.0.get())
}

/// Borrowed view of the host's tag slots.
pub struct TagStore<'h, H: HostRuntime> {
    host: &'h H,
}

impl<'h, H: HostRuntime> TagStore<'h, H> {
    pub fn new(host: &'h H) -> Self {
        Self { host }
    }

    /// Current handle stored on `object`, if any.
    pub fn get(&self, object: &H::Object) -> Option<OwnedHandle> {
        self.read(object).unwrap_or(None)
    }

    /// Like [`get`](Self::get), but reports a refused read instead of folding
    /// it into "untagged". The error has already been logged if it warrants it.
    pub fn read(&self, object: &H::Object) -> Result<Option<OwnedHandle>, HostError> {
        match self.host.get_tag(object) {
            Ok(word) => Ok(handle_from_word(word)),
            Err(e) => {
                check_host_error(self.host, Err(e.clone()), "Cannot get object tag");
                Err(e)
            }
        }
    }

    /// Store `handle` (or clear the slot). Returns whether the host accepted it.
    pub fn set(&self, object: &H::Object, handle: Option<OwnedHandle>) -> bool {
        let result = self.host.set_tag(object, word_from_handle(handle));
        check_host_error(self.host, result, "Cannot set object tag")
    }
}
