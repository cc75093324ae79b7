//! redb table definitions for the cutover state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Active rollout state keyed by service name.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Stable environment keyed by service name.
pub const STABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("stable");

/// Finished rollouts keyed by `{service}:{started_at:020}:{version}`.
pub const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");
