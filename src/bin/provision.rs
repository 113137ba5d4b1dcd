/// Tenant-schema provisioning operations tool.
///
/// Usage: provision <run|enqueue|status>
///   run      : run one batch provisioning pass synchronously
///   enqueue  : push a wake-up onto the provisioning queue
///   status   : print tenant registry counts

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;

use tenancy_api::config::Config;
use tenancy_api::services::{provision_scheduler, provisioner};

#[derive(Parser)]
#[command(name = "provision", about = "Tenant schema provisioning operations")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one batch provisioning pass synchronously
    Run,
    /// Push a wake-up onto the provisioning queue
    Enqueue,
    /// Print tenant registry counts
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let _ = dotenvy::dotenv();
    let args = Args::parse();
    let config = Config::from_env()?;

    match args.command {
        Command::Run => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&config.database_url)
                .await?;

            tracing::info!("Starting batch provisioning pass...");
            let summary = provisioner::run(&pool, &config).await?;
            tracing::info!(
                "Pass complete: {} batch(es), {} created, {} skipped",
                summary.batches,
                summary.created,
                summary.skipped
            );
        }
        Command::Enqueue => {
            let client = redis::Client::open(config.redis_url.as_str())?;
            provision_scheduler::enqueue_provision(&client).await?;
            tracing::info!("Provisioning wake-up enqueued");
        }
        Command::Status => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&config.database_url)
                .await?;

            let (total, created, pending, running): (i64, i64, i64, i64) = sqlx::query_as(
                "SELECT COUNT(*),
                        COUNT(*) FILTER (WHERE schema_created),
                        COUNT(*) FILTER (WHERE NOT schema_created AND NOT schema_create_running),
                        COUNT(*) FILTER (WHERE schema_create_running)
                   FROM public.tenants",
            )
            .fetch_one(&pool)
            .await?;

            println!("tenants:  {total}");
            println!("created:  {created}");
            println!("pending:  {pending}");
            println!("claimed:  {running}");
        }
    }

    Ok(())
}
