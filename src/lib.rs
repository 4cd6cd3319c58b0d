//! Write-once, sharded storage of per-position results keyed by genomic
//! coordinate, and a disk-queued task layer to fill it from worker processes.
//!
//! A [`Database`] lays shards out by a [`Schema`]; each shard is a [`Node`]
//! that is filled in memory and committed in one rename. [`dispatch`] writes
//! "run handler H on node N with args A" to task files that workers execute.

#[macro_use]
extern crate derive_new;

#[macro_use]
pub mod rdbg;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod genome;
pub mod new_types;
pub mod node;
pub mod schema;

pub use config::Config;
pub use db::Database;
pub use dispatch::{execute_task, serialize_task, MapJob, Registry};
pub use error::{Error, Result};
pub use executor::{CpuLimit, Executor, Local};
pub use genome::Genome;
pub use new_types::key::Key;
pub use new_types::value::{Value, ValueType};
pub use node::Node;
pub use schema::Schema;
