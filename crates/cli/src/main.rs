mod recover;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use relq_core::QueueName;
use relq_infra::store::RedisStore;
use relq_infra::{RelqConfig, Supervisor};
use relq_observability::tracing::LogFormat;

use recover::RecoverOptions;

#[derive(Parser)]
#[command(name = "relq")]
#[command(about = "Operator tooling for relq job queues", version)]
struct Cli {
    /// Log output format (json or pretty)
    #[arg(long, env = "RELQ_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Return a node's in-progress jobs to their queues
    Recover {
        /// Queue to recover (repeatable; defaults to RELQ_QUEUES)
        #[arg(short, long = "queue")]
        queues: Vec<String>,
        /// Node whose in-progress lists are drained (defaults to RELQ_LOCAL_NODE_ID)
        #[arg(short, long)]
        node: Option<String>,
        /// Coordinator restarts allowed per queue before giving up
        #[arg(long, default_value_t = 3)]
        max_restarts: u32,
        /// How long each recovery call may take, in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    relq_observability::tracing::init(cli.log_format);

    match cli.command {
        Commands::Recover {
            queues,
            node,
            max_restarts,
            timeout_ms,
        } => run_recover(
            queues,
            node,
            RecoverOptions {
                max_restarts,
                call_timeout: Duration::from_millis(timeout_ms),
                ..RecoverOptions::default()
            },
        ),
    }
}

fn run_recover(queues: Vec<String>, node: Option<String>, options: RecoverOptions) -> Result<()> {
    let mut config = RelqConfig::from_env().context("failed to load configuration")?;
    if node.is_some() {
        config.local_node_id = node;
    }
    if !queues.is_empty() {
        config.queues = queues;
    }
    if config.local_node_id.is_none() {
        bail!("no node to recover; pass --node or set RELQ_LOCAL_NODE_ID");
    }
    // Recovery acts on an existing node and never announces it.
    config.generate_node_id = false;

    let validated = config.validate().context("invalid configuration")?;
    if validated.queues.is_empty() {
        bail!("no queues to recover; pass --queue or set RELQ_QUEUES");
    }

    info!(
        node_id = %validated.node.node_id,
        queues = validated.queues.len(),
        redis = %validated.redis.redacted_url(),
        "recovering in-progress jobs"
    );

    let redis = validated.redis.clone();
    let mut supervisor = Supervisor::new(validated.base().clone(), move |_queue: &QueueName| {
        RedisStore::open(redis.clone())
    });

    let mut failed = Vec::new();
    for queue in &validated.queues {
        match recover::drain_queue(&mut supervisor, queue, &options) {
            Ok(moved) => info!(queue = %queue, moved, "queue recovered"),
            Err(err) => {
                error!(queue = %queue, error = %err, "queue recovery failed");
                failed.push(queue.to_string());
            }
        }
    }
    supervisor.shutdown();

    if !failed.is_empty() {
        bail!("could not recover queue(s): {}", failed.join(", "));
    }
    Ok(())
}
