//! Plan B - sharded temporal key/value store with snapshot serving
//!
//! Storage nodes own writable shards and merge staged part files into them.
//! Reader nodes serve reads from snapshots fetched from storage nodes and
//! rotate those snapshots in the background without blocking readers.
//!
//! # Modules
//!
//! - [`guard`]: fail-fast acquire / deferred destroy for shared resources
//! - [`db`], [`env`]: the database collaborator and its guarded, lazily
//!   opened environments
//! - [`shard`]: local and snapshot shards plus the registry
//! - [`receive`], [`staging`]: drop-off and ordered holding area for parts
//! - [`merge`], [`maintenance`]: background workers
//! - [`transfer`]: snapshot fetch and part upload between nodes

pub mod config;
pub mod db;
pub mod descriptor;
pub mod env;
pub mod error;
pub mod guard;
pub mod maintenance;
pub mod merge;
pub mod paths;
pub mod receive;
pub mod shard;
pub mod staging;
pub mod transfer;
pub mod worker;

pub use config::{ConfigProvider, PlanBConfig, ShardDoc, SharedConfig};
pub use db::{Db, DbFactory, FileDb, FileDbFactory};
pub use descriptor::FileDescriptor;
pub use error::{PlanBError, Result};
pub use guard::{Guard, GuardState};
pub use merge::MergeProcessor;
pub use paths::StatePaths;
pub use shard::{LocalShard, Shard, ShardManager, SnapshotShard};
pub use staging::{SequentialFile, StagingFileStore};
pub use transfer::{FileTransferClient, LocalFileTransferClient, LocalNode, SnapshotRequest};
