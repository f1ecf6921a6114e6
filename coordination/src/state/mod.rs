//! Best-effort persistence for an agent process.
//!
//! Conversation snapshots and status blobs are stored as opaque JSON under
//! a scope and a key:
//!
//! - `conversations`: one snapshot per channel id
//! - `status`: one status report per agent identity
//!
//! Nothing here is the source of truth while a process is alive; the
//! in-memory state is. The store lets a restarted process pick up where it
//! left off.

pub mod schema;
pub mod store;

pub use schema::{SCOPE_CONVERSATIONS, SCOPE_STATUS};
pub use store::{FileKvStore, KvError, KvResult, KvStore, MemoryKvStore, SharedKvStore};
