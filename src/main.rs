//! # drivewatch CLI (`dwatch`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dwatch init` | Create the SQLite database and run schema migrations |
//! | `dwatch serve` | Start the webhook server |
//! | `dwatch work notifications` | Consume the notifications queue |
//! | `dwatch work pipeline` | Consume the pipeline queue |
//! | `dwatch channels list` | Show registered channels and lease state |
//! | `dwatch channels add <folder>` | Start watching a folder |
//! | `dwatch channels renew` | Rotate channels that expire soon |
//! | `dwatch sweep` | Enqueue a poll for every channel |
//! | `dwatch queues` | Show queue depths |
//! | `dwatch stages stale` | List stages stuck in progress |
//! | `dwatch stages show <doc>` | Show a document and its stage records |
//! | `dwatch stages unstarted` | List recorded documents whose pipeline never started |
//! | `dwatch stages redispatch` | Start the pipeline again for those documents |
//!
//! ## Examples
//!
//! ```bash
//! dwatch init --config ./config/dwatch.toml
//! dwatch channels add 1AbCdEf --destination 9ZyXwV
//! dwatch serve &
//! dwatch work notifications &
//! dwatch work pipeline --once
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use drivewatch::worker::WorkKind;
use drivewatch::{config, migrate, register, server, status, worker, workflow};

/// drivewatch: turns Drive folder push notifications into exactly one
/// pipeline run per new file.
#[derive(Parser)]
#[command(name = "dwatch", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dwatch.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the webhook server on `[server].bind`.
    Serve,

    /// Consume a queue.
    Work {
        #[command(subcommand)]
        queue: WorkQueue,

        /// Drain what is currently visible, then exit.
        #[arg(long, global = true)]
        once: bool,
    },

    /// Manage watched folders.
    Channels {
        #[command(subcommand)]
        action: ChannelAction,
    },

    /// Enqueue one notification per registered channel.
    ///
    /// Run on a schedule so folders are polled even when push signals
    /// are lost.
    Sweep,

    /// Show queue depths.
    Queues {
        /// Print the bodies of dead-lettered messages in this queue.
        #[arg(long)]
        dead: Option<String>,
    },

    /// Inspect processing stages.
    Stages {
        #[command(subcommand)]
        action: StageAction,
    },
}

#[derive(Subcommand)]
enum WorkQueue {
    /// Ingest changes for queued channel notifications.
    Notifications,
    /// Run the document pipeline for queued jobs.
    Pipeline,
}

#[derive(Subcommand)]
enum ChannelAction {
    List,

    /// Watch a folder. An already watched folder gets a fresh channel.
    Add {
        folder_id: String,

        /// Folder that receives the pipeline's published output.
        #[arg(long)]
        destination: Option<String>,
    },

    /// Rotate channels that expire within `drive.renew_before_mins` or
    /// point at a different webhook.
    Renew,
}

#[derive(Subcommand)]
enum StageAction {
    /// In-progress stages older than the stage timeout.
    Stale {
        #[arg(long, value_parser = age_secs())]
        older_than_secs: Option<i64>,
    },

    Show { document_id: String },

    /// Documents recorded before the cutoff that have no stage record.
    Unstarted {
        #[arg(long, value_parser = age_secs())]
        older_than_secs: Option<i64>,
    },

    /// Dispatch every unstarted document again.
    Redispatch {
        #[arg(long, value_parser = age_secs())]
        older_than_secs: Option<i64>,
    },
}

fn age_secs() -> clap::builder::RangedI64ValueParser<i64> {
    clap::value_parser!(i64).range(0..=config::MAX_DURATION_SECS)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Work { queue, once } => {
            let kind = match queue {
                WorkQueue::Notifications => WorkKind::Notifications,
                WorkQueue::Pipeline => WorkKind::Pipeline,
            };
            worker::run_worker(&cfg, kind, once).await?;
        }
        Commands::Channels { action } => match action {
            ChannelAction::List => status::list_channels(&cfg).await?,
            ChannelAction::Add {
                folder_id,
                destination,
            } => register::run_add_folder(&cfg, &folder_id, destination).await?,
            ChannelAction::Renew => register::run_renew(&cfg).await?,
        },
        Commands::Sweep => {
            register::run_sweep(&cfg).await?;
        }
        Commands::Queues { dead } => match dead {
            Some(queue_name) => status::show_dead_letters(&cfg, &queue_name).await?,
            None => status::show_queues(&cfg).await?,
        },
        Commands::Stages { action } => match action {
            StageAction::Stale { older_than_secs } => {
                status::list_stale(&cfg, older_than_secs).await?
            }
            StageAction::Show { document_id } => {
                status::show_document(&cfg, &document_id).await?
            }
            StageAction::Unstarted { older_than_secs } => {
                status::list_unstarted(&cfg, older_than_secs).await?
            }
            StageAction::Redispatch { older_than_secs } => {
                workflow::run_redispatch(&cfg, older_than_secs).await?
            }
        },
    }

    Ok(())
}
