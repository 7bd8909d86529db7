//! `cmw` — operational CLI: database housekeeping, one-shot ETL runs, and
//! the scheduler loop. The webhook daemon has its own binary (`cmw-webhook`).

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use cmw_etl::EtlContext;
use cmw_runtime::JobKind;

#[derive(Parser)]
#[command(name = "cmw")]
#[command(about = "Consultation sync middleware CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Run one puller once and exit
    Etl {
        #[arg(value_enum)]
        entity: EtlEntity,
    },

    /// Run every puller on its schedule until SIGTERM
    Schedule,
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum EtlEntity {
    /// Consultation puller (mode from ETL_MODE)
    Consultations,
    /// Open-update reconciliation of non-terminal consultations
    OpenUpdate,
    /// Bulk consultations for queue accounting
    Bulk,
    Calls,
    Reschedules,
    Ratings,
    QueueClosings,
    Users,
}

impl EtlEntity {
    fn job_kind(self) -> JobKind {
        match self {
            EtlEntity::Consultations => JobKind::Consultations,
            EtlEntity::OpenUpdate => JobKind::ConsultationsOpenUpdate,
            EtlEntity::Bulk => JobKind::BulkConsultations,
            EtlEntity::Calls => JobKind::Calls,
            EtlEntity::Reschedules => JobKind::Reschedules,
            EtlEntity::Ratings => JobKind::Ratings,
            EtlEntity::QueueClosings => JobKind::QueueClosings,
            EtlEntity::Users => JobKind::Users,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    cmw_config::bootstrap_env();
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let settings = cmw_config::Settings::from_env()?;
            let pool = cmw_db::connect(&settings.database_url).await?;
            match cmd {
                DbCmd::Status => {
                    let s = cmw_db::status(&pool).await?;
                    println!("db_ok={} has_cons_table={}", s.ok, s.has_cons_table);
                }
                DbCmd::Migrate => {
                    cmw_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }

        Commands::Etl { entity } => {
            let ctx = build_context().await?;
            let kind = entity.job_kind();
            // The same advisory lock as the scheduler: a one-shot run and a
            // scheduled run must not write the same entity concurrently.
            cmw_runtime::run_job_locked(&ctx, kind).await;
        }

        Commands::Schedule => {
            let ctx = build_context().await?;
            cmw_runtime::run_scheduler(ctx, cmw_runtime::default_schedule()).await?;
        }
    }

    Ok(())
}

async fn build_context() -> Result<EtlContext> {
    let settings = cmw_config::Settings::from_env()?;
    settings.require_odata()?;
    settings.require_chat()?;

    let pool = cmw_db::connect(&settings.database_url).await?;
    cmw_db::migrate(&pool).await?;

    let odata = cmw_odata::OdataClient::new(
        settings.odata_base_url.clone(),
        settings.odata_user.clone(),
        settings.odata_password.clone(),
        settings.http_timeout,
    )?;
    let chat = Arc::new(cmw_chat::ChatClient::new(
        settings.chat_api_url.clone(),
        settings.chat_account_id.clone(),
        settings.chat_api_token.clone(),
        settings.http_timeout,
    )?);

    Ok(EtlContext {
        pool,
        odata,
        chat,
        settings,
    })
}

fn init_tracing() {
    let fallback = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .init();
}
