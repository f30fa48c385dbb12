use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use remm_classifier::{ClassifierConfig, ModerationClient};
use remm_core::ContentModerator;
use remm_moderation::{
    BackgroundModerationService, ListingService, ModerationConfig, SessionScopeFactory,
};
use remm_storage::{
    connect_pg, run_migrations, InMemoryListingStore, ListingRepository, PgListingRepository,
    PgSessionFactory, SessionFactory,
};
use remm_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Parser)]
#[command(name = "remm-cli")]
#[command(about = "Real estate listing moderation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API with background moderation.
    Serve,
    /// Apply database migrations.
    Migrate,
    /// Classify a single title/description pair and print the verdict.
    Classify {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await?,
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL")
                .context("DATABASE_URL must be set to run migrations")?;
            let pool = connect_pg(&url, DB_MAX_CONNECTIONS).await?;
            run_migrations(&pool).await?;
            println!("migrations applied");
        }
        Commands::Classify { title, description } => {
            let client = ModerationClient::from_config(ClassifierConfig::from_env())?;
            let result = client.classify(&title, &description).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn serve() -> Result<()> {
    let classifier_config = ClassifierConfig::from_env();
    if !classifier_config.enabled {
        warn!("moderation disabled; every listing will be auto-approved");
    }
    let moderator: Arc<dyn ContentModerator> =
        Arc::new(ModerationClient::from_config(classifier_config)?);

    let (listings, sessions): (Arc<dyn ListingRepository>, Arc<dyn SessionFactory>) =
        match std::env::var("DATABASE_URL") {
            Ok(url) if !url.trim().is_empty() => {
                let pool = connect_pg(&url, DB_MAX_CONNECTIONS).await?;
                run_migrations(&pool).await?;
                info!("using postgres listing store");
                let listings: Arc<dyn ListingRepository> =
                    Arc::new(PgListingRepository::new(pool.clone()));
                let sessions: Arc<dyn SessionFactory> = Arc::new(PgSessionFactory::new(pool));
                (listings, sessions)
            }
            _ => {
                warn!("DATABASE_URL not set; listings are kept in memory");
                let store = InMemoryListingStore::new();
                let listings: Arc<dyn ListingRepository> = Arc::new(store.session());
                let sessions: Arc<dyn SessionFactory> = Arc::new(store);
                (listings, sessions)
            }
        };

    let scopes = SessionScopeFactory::new(sessions, Arc::clone(&moderator));
    let background = Arc::new(BackgroundModerationService::start(
        Arc::new(scopes),
        &ModerationConfig::from_env(),
    ));
    let service = ListingService::new(listings, moderator, background.clone());

    let port: u16 = std::env::var("REMM_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let served = remm_web::serve(AppState::new(Arc::new(service)), port).await;

    background.shutdown().await;
    served
}
