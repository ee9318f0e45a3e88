//! Persistence for the Updraft control plane.
//!
//! The backing store is a wide-column database with upsert-only writes
//! and no atomic read-modify-write. Two consequences shape everything
//! here: every update or delete is preceded by a read that proves the
//! row exists, and a row missing its `created_at` column is a tombstone
//! resurrection to be treated as absent and purged on sight.

pub mod backend;
pub mod codec;
pub mod collection;
pub mod group;
pub mod lock;
pub mod memory;

pub use backend::{Consistency, GroupRow, LockRow, Mutation, PolicyRow, StorageBackend, WebhookRow};
pub use collection::{ScalingStore, SCHEDULE_LOCK};
pub use group::{GroupManifest, PolicyRecord, ScalingGroup, WebhookRecord};
pub use lock::LockService;
pub use memory::MemBackend;
