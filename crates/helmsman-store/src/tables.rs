//! redb table definitions for the deployment store.

use redb::TableDefinition;

/// Deployment documents keyed by `{deployment_id}`, JSON-serialized.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");
