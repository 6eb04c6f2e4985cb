//! redb table definitions for the deployment store.
//!
//! Both tables use `&str` keys. Deployment values are JSON-serialized
//! records; the active table stores a bare deployment id.

use redb::TableDefinition;

/// Deployment records keyed by deployment id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Non-terminal deployment id keyed by service name.
pub const ACTIVE: TableDefinition<&str, &str> = TableDefinition::new("active");
