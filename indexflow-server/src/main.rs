use clap::{Parser, Subcommand};
use indexflow::partition::{create_partition, IndexLayout, IndexMetaData};
use indexflow::{
    ActivationTable, ActorProperties, ActorRef, FileStateStore, IndexDescriptor, IndexRegistry,
    IndexValue, IndexedInterface, IndexingConfig, IndexingRuntime, MembershipDirectory,
    StateStore, WorkflowQueueState,
};
use indexflow_cluster::{ClusterConfig, ClusterMembership};
use std::path::Path;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "indexflow")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "INDEXFLOW_DATA_DIR", default_value = "./data")]
    data_dir: String,
}

#[derive(Subcommand)]
enum Command {
    /// Index three players by location and print the lookups
    Demo {
        /// Keep the interface lazy and fault tolerant instead of eager
        #[arg(long)]
        lazy: bool,
    },
    /// Print the persisted workflow queues found in the data dir
    Queues,
}

async fn run_demo(data_dir: &Path, lazy: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = IndexingConfig::from_env();
    let cluster = ClusterConfig::load(data_dir)?;
    let membership: Arc<dyn MembershipDirectory> = Arc::new(ClusterMembership::from_config(&cluster));
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::open(data_dir.join("state"))?);
    let activations = Arc::new(ActivationTable::new());
    let env = IndexingRuntime::partition_env(&config, &store, &membership, &activations);

    let meta = if lazy {
        IndexMetaData::total(IndexLayout::PartitionedByKey)
    } else {
        IndexMetaData::active(IndexLayout::PartitionedByHost).eager()
    };
    let policy = if lazy {
        indexflow::FaultTolerancePolicy::FaultTolerant
    } else {
        config.default_fault_tolerance()
    };
    let partition = create_partition("location", &meta, &env).await?;
    let registry = Arc::new(IndexRegistry::new());
    registry.register_interface(
        IndexedInterface::new("IPlayer", policy)
            .with_index(IndexDescriptor::for_field("location", "location", meta, partition)),
    )?;
    registry.bind("Player", &["IPlayer"])?;

    let runtime = IndexingRuntime::new(config, registry, store, membership, activations);
    for (id, city) in [("p1", "Seattle"), ("p2", "Seattle"), ("p3", "SF")] {
        let player = runtime.activate(&ActorRef::new("Player", id)).await?;
        player
            .write_properties(ActorProperties::new().with("location", city))
            .await?;
    }
    runtime.wait_for_quiescence().await;

    for city in ["Seattle", "SF"] {
        let mut found: Vec<String> = runtime
            .lookup("IPlayer", "location", &IndexValue::text(city))
            .await?
            .into_iter()
            .map(|a| a.to_string())
            .collect();
        found.sort();
        println!("{}: {}", city, found.join(", "));
    }
    runtime.shutdown().await?;
    Ok(())
}

async fn run_queues(data_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStateStore::open(data_dir.join("state"))?;
    let keys = store.keys("workflow-queue/").await?;
    if keys.is_empty() {
        eprintln!("No persisted workflow queues under {}", data_dir.display());
        return Ok(());
    }
    for key in keys {
        match indexflow::store::read_json::<WorkflowQueueState>(&store, &key).await {
            Ok(Some(state)) => {
                println!("{} ({} pending)", state.address, state.records.len());
                for record in &state.records {
                    println!("  {} {}", record.workflow_id, record.actor);
                }
            }
            Ok(None) => {}
            Err(e) => eprintln!("{}: unreadable: {}", key, e),
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    indexflow::init_from_env();
    let data_dir = Path::new(&cli.data_dir);

    match cli.command {
        Command::Demo { lazy } => run_demo(data_dir, lazy).await,
        Command::Queues => run_queues(data_dir).await,
    }
}
