//! redb table definitions for the coordination store.

use redb::TableDefinition;

/// Coordination entries (lock, maps, sets) keyed by their full
/// `{prefix}:...` key, JSON-serialized values.
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("coordination");

/// Work-queue messages keyed by sequence number, raw payload bytes.
pub const QUEUE: TableDefinition<u64, &[u8]> = TableDefinition::new("queue");

/// Per-message lease expiry (unix millis) keyed by sequence number.
pub const QUEUE_LEASES: TableDefinition<u64, u64> = TableDefinition::new("queue_leases");

/// Queue metadata (next sequence number).
pub const QUEUE_META: TableDefinition<&str, u64> = TableDefinition::new("queue_meta");
