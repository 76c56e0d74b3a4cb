//! Cleanup queue for handles whose tagged object has been collected.
//!
//! ## Problem
//!
//! The host reports a freed tagged object from inside the collector, on a
//! collector thread, possibly while collector-internal locks are held. Releasing
//! the global reference there could call back into the runtime and deadlock.
//!
//! ## Solution
//!
//! The object-free callback only records the handle (`enqueue`, O(1) under a
//! short lock). The sweep worker later detaches the whole list in one swap
//! (`drain_all`) and releases each handle after the lock has been dropped.
//!
//! ```ignore
//! // Collector thread
//! queue.enqueue(handle);
//!
//! // Sweep worker, after a collection-finished signal
//! for handle in queue.drain_all() {
//!     owner.release(handle);
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::tag_store::OwnedHandle;

/// Stack of handles pending release. Order of release is unspecified.
pub struct CleanupQueue {
    pending: Mutex<Vec<OwnedHandle>>,

    /// Fast check for pending items (avoids lock acquisition on the sweep path)
    pending_count: AtomicU64,
}

impl Default for CleanupQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::with_capacity(64)),
            pending_count: AtomicU64::new(0),
        }
    }

    /// Record a handle for release. Safe to call from collector threads.
    pub fn enqueue(&self, handle: OwnedHandle) {
        {
            let mut pending = self.pending.lock();
            pending.push(handle);
            self.pending_count.fetch_add(1, Ordering::Release);
        }

        tracing::trace!("Queued tag handle {} for release", handle.id());
    }

    /// Detach every pending handle.
    ///
    /// The lock is held only for the swap; the caller releases the returned
    /// handles with no queue lock held.
    pub fn drain_all(&self) -> Vec<OwnedHandle> {
        if !self.has_pending() {
            return Vec::new();
        }

        let mut handles = {
            let mut pending = self.pending.lock();
            let handles = std::mem::take(&mut *pending);
            self.pending_count
                .fetch_sub(handles.len() as u64, Ordering::Release);
            handles
        };

        // Most recent first, like the list the collector pushes onto.
        handles.reverse();

        if !handles.is_empty() {
            tracing::trace!("Detached {} pending tag handles", handles.len());
        }
        handles
    }

    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }
}

impl std::fmt::Debug for CleanupQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupQueue")
            .field("pending_count", &self.len())
            .finish()
    }
}
