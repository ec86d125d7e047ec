use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use settlepay::application::jobs;
use settlepay::application::{Ports, Services};
use settlepay::config::Settings;
use settlepay::domain::ids::{BatchId, LineItemId};
use settlepay::domain::ports::{
    DynAuditLog, DynPaymentStore, DynSettlementStore, DynTransferStore, LineItemFilter,
};
use settlepay::domain::settlement::LineItemState;
use settlepay::infrastructure::catalog::StaticCatalog;
use settlepay::infrastructure::clock::SystemClock;
use settlepay::infrastructure::gateway::DarajaClient;
use settlepay::infrastructure::in_memory::{
    InMemoryAuditLog, InMemoryPaymentStore, InMemorySettlementStore, InMemoryTransferStore,
};
use settlepay::interfaces::csv::line_item_writer::LineItemWriter;
use settlepay::interfaces::http::{self, AppState};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true, env = "SETTLEPAY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// TOML settings file
    #[arg(long, global = true, env = "SETTLEPAY_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "SETTLEPAY_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server together with settlement, payout and sweep jobs
    Serve {
        /// Overrides `listen` from the settings file
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
    /// Settle one calendar day (YYYY-MM-DD, settlement timezone)
    Settle {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Run one payout pass over due line items
    Payouts,
    /// Write payout line items as CSV to stdout
    Export {
        #[arg(long)]
        batch: Option<BatchId>,
        /// pending, processing, paid or failed
        #[arg(long)]
        state: Option<LineItemState>,
    },
    /// Give a failed line item a fresh retry budget
    Requeue { line_item: LineItemId },
}

struct Stores {
    payments: DynPaymentStore,
    settlements: DynSettlementStore,
    transfers: DynTransferStore,
    audit: DynAuditLog,
}

fn in_memory_stores() -> Stores {
    Stores {
        payments: Arc::new(InMemoryPaymentStore::new()),
        settlements: Arc::new(InMemorySettlementStore::new()),
        transfers: Arc::new(InMemoryTransferStore::new()),
        audit: Arc::new(InMemoryAuditLog::new()),
    }
}

#[cfg(feature = "storage-rocksdb")]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    use settlepay::infrastructure::rocksdb::RocksDBStore;

    match db_path {
        Some(path) => {
            let store = Arc::new(RocksDBStore::open(&path).into_diagnostic()?);
            info!(path = %path.display(), "Using RocksDB storage");
            Ok(Stores {
                payments: store.clone(),
                settlements: store.clone(),
                transfers: store.clone(),
                audit: store,
            })
        }
        None => Ok(in_memory_stores()),
    }
}

#[cfg(not(feature = "storage-rocksdb"))]
fn open_stores(db_path: Option<PathBuf>) -> Result<Stores> {
    if db_path.is_some() {
        eprintln!(
            "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
        );
    }
    Ok(in_memory_stores())
}

fn init_tracing(json: bool) {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    // stdout is reserved for command output (CSV, JSON).
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }
}

fn build_services(settings: &Settings, stores: Stores) -> Result<Services> {
    let catalog = match &settings.catalog_path {
        Some(path) => StaticCatalog::from_path(path).into_diagnostic()?,
        None => {
            warn!("No catalog configured; every confirmed payment will need manual resolution");
            StaticCatalog::default()
        }
    };
    let catalog = Arc::new(catalog);
    let gateway = Arc::new(DarajaClient::new(settings.gateway.clone()).into_diagnostic()?);

    let ports = Ports {
        payments: stores.payments,
        settlements: stores.settlements,
        transfers: stores.transfers,
        audit: stores.audit,
        rates: catalog.clone(),
        hierarchy: catalog.clone(),
        directory: catalog,
        collections: gateway.clone(),
        disbursements: gateway,
        clock: Arc::new(SystemClock),
    };
    Ok(Services::new(ports, settings.service_config().into_diagnostic()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = Settings::load(cli.config.as_deref()).into_diagnostic()?;
    let stores = open_stores(cli.db_path)?;
    let services = build_services(&settings, stores)?;

    match cli.command {
        Command::Serve { listen } => {
            let addr = listen.unwrap_or(settings.listen);
            let supervisor = jobs::start(&services, settings.job_schedule().into_diagnostic()?);
            let shutdown = supervisor.token();

            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown requested");
                }
                on_signal.cancel();
            });

            let served = http::serve(addr, AppState::new(services), shutdown).await;
            supervisor.shutdown().await;
            served.into_diagnostic()?;
        }
        Command::Settle { date } => {
            let outcome = services.settlement.settle_day(date).await.into_diagnostic()?;
            let batch = serde_json::to_string_pretty(outcome.batch()).into_diagnostic()?;
            println!("{batch}");
        }
        Command::Payouts => {
            let report = services.payouts.run_due().await.into_diagnostic()?;
            println!(
                "started={} blocked={} failed_to_send={} skipped={} unconfirmed={}",
                report.started,
                report.blocked,
                report.failed_to_send,
                report.skipped,
                report.unconfirmed
            );
        }
        Command::Export { batch, state } => {
            let filter = LineItemFilter {
                batch,
                state,
                recipient: None,
            };
            let items = services
                .settlements
                .line_items(&filter)
                .await
                .into_diagnostic()?;
            let stdout = io::stdout();
            let mut writer = LineItemWriter::new(stdout.lock());
            writer.write_line_items(&items).into_diagnostic()?;
        }
        Command::Requeue { line_item } => {
            let item = services
                .payouts
                .requeue(line_item)
                .await
                .into_diagnostic()?;
            println!("{} {}", item.id, item.state);
        }
    }

    Ok(())
}
