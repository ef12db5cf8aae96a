//! redb table definitions for the Vane object store.
//!
//! Every object table uses `&str` keys (`{namespace}/{name}`) and `&[u8]`
//! values holding the JSON-serialized object.

use redb::TableDefinition;

pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

pub const REPLICA_SETS: TableDefinition<&str, &[u8]> = TableDefinition::new("replica_sets");

pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

pub const ANALYSIS_TEMPLATES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("analysis_templates");

pub const ANALYSIS_RUNS: TableDefinition<&str, &[u8]> = TableDefinition::new("analysis_runs");

pub const EXPERIMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("experiments");

/// Store-wide counters (currently only the resource version sequence).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

pub const RESOURCE_VERSION_KEY: &str = "resource_version";
