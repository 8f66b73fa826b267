//! Stratus - declarative cluster provisioning for AWS

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratus::api::{Channel, Cluster, InstanceGroup};
use stratus::cloud::MockCloud;
use stratus::model::ModelContext;
use stratus::populate::{populate_cluster_spec, populate_instance_group_spec, write_completed_spec};
use stratus::target::{EmitterTarget, Target};
use stratus::task::Reconciler;
use stratus::vfs::VfsContext;

/// Stratus - declarative Kubernetes cluster provisioning for AWS
#[derive(Parser, Debug)]
#[command(name = "stratus", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Complete a cluster spec and reconcile it against the cloud
    Update(UpdateArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendArg {
    /// Execute against the cloud API
    Direct,
    /// Emit a declarative infrastructure description
    Emitter,
}

#[derive(Parser, Debug)]
struct UpdateArgs {
    /// Cluster document (YAML)
    #[arg(long)]
    cluster: PathBuf,

    /// Instance group documents (YAML), repeatable
    #[arg(long = "instance-group")]
    instance_groups: Vec<PathBuf>,

    /// Admin SSH public key to install on instances
    #[arg(long)]
    ssh_public_key: PathBuf,

    /// Back-end to render through
    #[arg(long, value_enum, default_value = "emitter")]
    target: BackendArg,

    /// Output directory for the emitter back-end
    #[arg(long, default_value = "out")]
    out: PathBuf,

    /// Cloud region
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// Maximum seconds any single task may take
    #[arg(long, default_value_t = stratus::DEFAULT_MAX_TASK_DURATION_SECS)]
    max_task_duration_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Update(args) => run_update(args).await,
    }
}

async fn run_update(args: UpdateArgs) -> anyhow::Result<()> {
    let cluster: Cluster = serde_yaml::from_slice(&tokio::fs::read(&args.cluster).await?)?;
    let mut instance_groups = Vec::new();
    for path in &args.instance_groups {
        let group: InstanceGroup = serde_yaml::from_slice(&tokio::fs::read(path).await?)?;
        instance_groups.push(group);
    }
    let ssh_public_key = tokio::fs::read_to_string(&args.ssh_public_key).await?;

    // The live AWS client is provided by the deployment environment; this
    // binary wires up the in-memory cloud, which is enough for the emitter
    // back-end and for dry runs.
    let cloud = MockCloud::new(&args.region);
    let vfs = VfsContext::cluster_readable_memfs();
    let channel = Channel::stable();

    tracing::info!(cluster = %cluster.name, "populating cluster spec");
    let full_cluster = populate_cluster_spec(&cluster, &instance_groups, &cloud, &vfs).await?;

    let mut full_groups = Vec::new();
    for group in &instance_groups {
        full_groups.push(populate_instance_group_spec(&full_cluster, group, &channel)?);
    }

    write_completed_spec(&full_cluster, &full_groups, &vfs).await?;

    let model = ModelContext {
        cluster: &full_cluster,
        instance_groups: &full_groups,
        ssh_public_key: ssh_public_key.trim(),
    };
    let mut graph = model.build_task_graph()?;
    tracing::info!(tasks = graph.len(), "built task graph");

    let reconciler = Reconciler::new(&cloud, &full_cluster.name)
        .with_max_task_duration(Duration::from_secs(args.max_task_duration_secs));

    match args.target {
        BackendArg::Direct => {
            let mut target = Target::Direct;
            reconciler.run(&mut graph, &mut target).await?;
            tracing::info!("cluster reconciled");
        }
        BackendArg::Emitter => {
            let mut target = Target::Emitter(EmitterTarget::new(&full_cluster.name, &args.region));
            reconciler.run(&mut graph, &mut target).await?;
            if let Target::Emitter(emitter) = target {
                emitter.commit(&args.out).await?;
            }
            tracing::info!(dir = %args.out.display(), "infrastructure description written");
        }
    }

    Ok(())
}
