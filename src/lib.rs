//! # Indexflow
//!
//! Secondary indexes over many independently addressed, concurrently
//! mutating actors. Every change to an actor's indexed properties becomes a
//! before/after-image diff that is either applied to the index partitions
//! right away (eager) or appended to a per-shard workflow queue and applied
//! by a background drain (lazy).
//!
//! Lazy propagation batches updates through punctuation-delimited queues,
//! coalesces queue persistence with group commit, and with fault tolerance
//! on, tracks each actor's in-flight workflows so that recovery after a
//! crash re-applies exactly what is missing. Unique indexes reserve keys
//! tentatively and roll the reservation back when a later index rejects
//! the update.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use indexflow::partition::{create_partition, IndexLayout, IndexMetaData};
//! use indexflow::{
//!     ActivationTable, ActorProperties, ActorRef, FaultTolerancePolicy, IndexDescriptor,
//!     IndexRegistry, IndexValue, IndexedInterface, IndexingConfig, IndexingRuntime,
//!     MembershipDirectory, MemoryStateStore, StateStore, StaticMembership,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> indexflow::Result<()> {
//! let config = IndexingConfig::from_env();
//! let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
//! let membership: Arc<dyn MembershipDirectory> = Arc::new(StaticMembership::single("host-a"));
//! let activations = Arc::new(ActivationTable::new());
//! let env = IndexingRuntime::partition_env(&config, &store, &membership, &activations);
//!
//! let meta = IndexMetaData::total(IndexLayout::SingleBucket);
//! let partition = create_partition("location", &meta, &env).await?;
//! let registry = Arc::new(IndexRegistry::new());
//! registry.register_interface(
//!     IndexedInterface::new("IPlayer", FaultTolerancePolicy::FaultTolerant)
//!         .with_index(IndexDescriptor::for_field("location", "location", meta, partition)),
//! )?;
//! registry.bind("Player", &["IPlayer"])?;
//!
//! let runtime = IndexingRuntime::new(config, registry, store, membership, activations);
//! let p1 = runtime.activate(&ActorRef::new("Player", "p1")).await?;
//! p1.write_properties(ActorProperties::new().with("location", "Seattle")).await?;
//!
//! runtime.wait_for_quiescence().await;
//! let found = runtime.lookup("IPlayer", "location", &IndexValue::text("Seattle")).await?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod config;
pub mod directory;
pub mod error;
pub mod partition;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod update;
pub mod workflow;

pub use actor::{IndexableActor, IndexedActorState};
pub use config::{EagerApplyMode, IndexingConfig};
pub use directory::{
    ActivationTable, ActorDirectory, ActorPlacement, IndexedActorHandle, MembershipDirectory,
    QueueDirectory, StaticMembership,
};
pub use error::{IndexingError, Result};
pub use partition::{IndexMetaData, IndexPartition};
pub use registry::{FaultTolerancePolicy, IndexDescriptor, IndexRegistry, IndexedInterface};
pub use runtime::IndexingRuntime;
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use types::*;
pub use update::{MemberUpdate, Operation};
pub use workflow::{WorkflowQueue, WorkflowQueueState, WorkflowRecord};

pub use telemetry::init_from_env;
