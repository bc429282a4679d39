//! Configuration loading: file discovery, `${ENV}` substitution and the memory schema.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, data_dir, discover_and_load, load_config},
    schema::{MemorySearchConfig, MemorySource, RecallConfig},
};
