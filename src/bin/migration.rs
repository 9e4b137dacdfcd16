use clap::{Parser, Subcommand};
use sea_orm_migration::MigratorTrait;
use tracing::{error, info};

use marketplace_api::{config, db};
use migrations::Migrator;

#[derive(Debug, Parser)]
#[command(name = "migration", about = "Apply or inspect marketplace database migrations")]
struct Cli {
    /// Overrides the configured database URL
    #[arg(long, env = "APP__DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply pending migrations (default)
    Up {
        #[arg(long)]
        steps: Option<u32>,
    },
    /// Roll back applied migrations
    Down {
        #[arg(long, default_value_t = 1)]
        steps: u32,
    },
    /// Print applied and pending migrations
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut cfg = config::load_config()?;
    config::init_tracing(cfg.log_level(), cfg.log_json);
    if let Some(url) = cli.database_url {
        cfg.database_url = url;
    }

    let pool = db::establish_connection_from_app_config(&cfg).await?;

    let result = match cli.command.unwrap_or(Command::Up { steps: None }) {
        Command::Up { steps } => Migrator::up(&pool, steps).await,
        Command::Down { steps } => Migrator::down(&pool, Some(steps)).await,
        Command::Status => Migrator::status(&pool).await,
    };

    match result {
        Ok(()) => {
            info!("Migration command completed");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Migration command failed");
            Err(e.into())
        }
    }
}
