//! SegStore DAO: persistence of tracked segmented-object graphs
//!
//! Objects detected in time-lapse images form a graph: every object has a
//! parent of the enclosing structure class, and objects of consecutive frames
//! are chained into tracks. This crate stores that graph in `segstore-core`
//! tables, one objects table and one measurements table per structure class
//! and position.
//!
//! # Architecture
//!
//! - `MasterDao`: one per dataset; experiment descriptor, configuration lock
//!   and a bounded working set of position stores
//! - `ObjectDao`: one per position; position lock, per-class tables and the
//!   shard cache
//! - `ShardCache`: objects grouped by `(parent track head, structure class)`,
//!   loaded lazily with one prefix scan and relinked in memory
//! - `SelectionStore`: named object selections of a dataset
//!
//! Relations between objects are ids. Nothing holds a pointer to another
//! object; links are resolved inside a loaded shard.

pub mod config;
pub mod error;
pub mod experiment;
pub mod ids;
pub mod layout;
pub mod lock;
pub mod master_dao;
pub mod notify;
pub mod object;
pub mod object_dao;
pub mod registry;
pub mod selection;
pub mod serializer;
pub mod shard_cache;

pub use config::StoreConfig;
pub use error::{DaoError, DaoResult};
pub use experiment::{Experiment, ExperimentDescriptor, StructureClass, StructureHierarchy, ROOT_CLASS};
pub use ids::{IdGenerator, ObjectId};
pub use lock::FileLock;
pub use master_dao::{MasterDao, SafeModePrompt};
pub use notify::{Notifier, TracingNotifier};
pub use object::{Measurements, SegmentedObject};
pub use object_dao::ObjectDao;
pub use registry::DatasetRegistry;
pub use selection::{Selection, SelectionElement, SelectionStore};
pub use serializer::{JsonSerializer, ObjectSerializer};
pub use shard_cache::{Shard, ShardKey};
