//! Object tags and their collector-driven cleanup.
//!
//! A tag associates one value with one managed object without touching the
//! object. The value is kept alive by a host global reference owned by this
//! module; that reference must be released exactly once, either when the tag
//! is overwritten or cleared, or after the object has been collected.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ReferenceOwner                                             │
//! │  ├── set/get association (application threads)             │
//! │  ├── Handle table: OwnedHandle → host global reference     │
//! │  └── Releases on overwrite, clear, or sweep                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TagStore                                                   │
//! │  ├── Host per-object tag slot (one word per object)         │
//! │  └── Only OwnedHandle ↔ TagWord conversion                  │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CleanupQueue                                               │
//! │  ├── enqueue() from object-free (collector thread)          │
//! │  └── drain_all() swap-to-empty from the sweep worker        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  SweepWorker                                                │
//! │  ├── Woken by SweepSignal at collection finish              │
//! │  └── Releases detached handles outside every lock           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod cleanup_queue;
mod reference_owner;
mod sweep_worker;
mod tag_store;

pub use cleanup_queue::CleanupQueue;
pub use reference_owner::ReferenceOwner;
pub use sweep_worker::{SweepSignal, SweepState, SweepStatus, SweepWorker, Sweeper};
pub use tag_store::{OwnedHandle, TagStore, handle_from_word, word_from_handle};
