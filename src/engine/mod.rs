//! Schema upgrade engine: unit registry, path resolution, the migration
//! lock, per-unit execution, deferred cleanup and the startup wait flow.

pub mod actions;
pub mod cleanup;
pub mod executor;
pub mod fleet;
pub mod lock;
pub mod manifest;
pub mod registry;
pub mod resolver;
pub mod startup;
pub mod version;
