//! # mrkr CLI
//!
//! ```bash
//! mrkr --config ./config/mrkr.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `mrkr init` | Create the SQLite database and schema |
//! | `mrkr project create` | Register a project over a source pattern |
//! | `mrkr project list` / `show <id>` | Inspect projects |
//! | `mrkr tasks <project>` | List a project's tasks |
//! | `mrkr scan <project>` | Reconcile the source listing (and OCR if `auto_ocr`) |
//! | `mrkr ocr <project>` | Run OCR for a project or one task |
//! | `mrkr serve` | Start the HTTP API with background job queues |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use mrkr::{commands, config, migrate, server};
use mrkr_core::models::ProviderKind;

/// mrkr: scan document collections into OCR'd, labelable tasks.
#[derive(Parser)]
#[command(name = "mrkr", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/mrkr.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// List the tasks of a project.
    Tasks {
        project_id: String,
        /// Include abandoned tasks.
        #[arg(long)]
        all: bool,
    },

    /// Scan a project's source and reconcile its tasks.
    Scan {
        project_id: String,
        /// Skip OCR even when `scan.auto_ocr` is set.
        #[arg(long)]
        no_ocr: bool,
    },

    /// Run OCR for a project's tasks.
    Ocr {
        project_id: String,
        /// Only this task.
        #[arg(long)]
        task: Option<String>,
        /// Recognize again even if the content is unchanged.
        #[arg(long)]
        force: bool,
    },

    /// Start the HTTP API.
    Serve,
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project.
    Create {
        #[arg(long)]
        name: String,
        /// Source pattern, e.g. `invoices/**/*.pdf` or `s3://bucket/scans/*.png`.
        #[arg(long)]
        uri: String,
        /// `local` or `s3`.
        #[arg(long, default_value = "local")]
        provider: ProviderKind,
        #[arg(long)]
        description: Option<String>,
    },
    /// List projects.
    List,
    /// Show one project as JSON.
    Show { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => match action {
            ProjectAction::Create {
                name,
                uri,
                provider,
                description,
            } => {
                commands::run_project_create(&cfg, &name, provider, &uri, description).await?;
            }
            ProjectAction::List => commands::run_project_list(&cfg).await?,
            ProjectAction::Show { id } => commands::run_project_show(&cfg, &id).await?,
        },
        Commands::Tasks { project_id, all } => {
            commands::run_tasks(&cfg, &project_id, all).await?;
        }
        Commands::Scan { project_id, no_ocr } => {
            commands::run_scan_cmd(&cfg, &project_id, no_ocr).await?;
        }
        Commands::Ocr {
            project_id,
            task,
            force,
        } => {
            commands::run_ocr_cmd(&cfg, &project_id, task.as_deref(), force).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
