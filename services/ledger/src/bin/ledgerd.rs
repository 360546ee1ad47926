use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use ledger::{
    AggregationConsumer, ConsumerConfig, ExchangeRegistry, IdempotentWriter, IngestService,
    LedgerConfig, RecoveryEngine,
};
use persistence::store::TradeStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use types::errors::IngestError;
use types::exchange::NewExchange;
use types::ids::{ExchangeId, Symbol};
use types::trade::InboundTrade;

/// Trade ledger: ingestion, positions and consistency checks.
#[derive(Parser, Debug)]
#[command(name = "ledgerd", version, about, long_about = None)]
struct Cli {
    /// JSON config file; `LEDGER_*` environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register an exchange
    RegisterExchange {
        name: String,

        /// Reference to the API credential in the secret store
        #[arg(long)]
        credential_ref: Option<String>,

        /// Register as inactive
        #[arg(long)]
        inactive: bool,
    },
    /// Activate or deactivate an exchange
    SetActive {
        exchange_id: i64,

        #[arg(action = ArgAction::Set)]
        active: bool,
    },
    /// Register a user
    RegisterUser { username: String },
    /// Ingest newline-delimited JSON trades from a file, or `-` for stdin
    Ingest {
        #[arg(default_value = "-")]
        input: String,
    },
    /// Print positions as JSON lines
    Positions {
        #[arg(long)]
        symbol: Option<String>,
    },
    /// Print committed trades as JSON lines
    Trades {
        /// Latest trades for this symbol, newest first
        #[arg(long)]
        symbol: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Trades committed after this sequence, oldest first
        #[arg(long, default_value_t = 0)]
        after: u64,
    },
    /// Rebuild the position view from the first trade and snapshot it
    Rebuild,
    /// Compare the recovered view against a full replay
    Verify,
    /// Run the aggregation consumer until interrupted
    Run,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = LedgerConfig::load(cli.config.as_deref()).context("loading config")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let store = config.store.open().context("opening trade store")?;
    info!(backend = store.backend(), "Trade store opened");

    match cli.command {
        Command::RegisterExchange {
            name,
            credential_ref,
            inactive,
        } => {
            let mut request = NewExchange::new(name);
            request.credential_ref = credential_ref;
            request.active = !inactive;
            let exchange = store.register_exchange(&request)?;
            println!("{}", serde_json::to_string(&exchange)?);
        }
        Command::SetActive {
            exchange_id,
            active,
        } => {
            let exchange = store.set_exchange_active(ExchangeId::new(exchange_id), active)?;
            println!("{}", serde_json::to_string(&exchange)?);
        }
        Command::RegisterUser { username } => {
            let user = store.register_user(&username)?;
            println!("{}", serde_json::to_string(&user)?);
        }
        Command::Ingest { input } => ingest(store, &config, &input).await?,
        Command::Positions { symbol } => {
            let mut registry = ExchangeRegistry::load(store.as_ref())?;
            let mut engine = RecoveryEngine::new(config.snapshot_dir.clone(), config.snapshot_compress);
            let (view, _) = engine.recover(store.as_ref(), &mut registry, config.batch_size)?;

            let symbol = symbol.as_deref().and_then(Symbol::try_new);
            for position in view.positions() {
                if symbol.as_ref().map_or(true, |s| &position.symbol == s) {
                    println!("{}", serde_json::to_string(position)?);
                }
            }
            if let Some(symbol) = &symbol {
                match view.net_quantity(symbol) {
                    Some(net) => info!(symbol = %symbol, net_quantity = %net, "Net position"),
                    None => warn!(symbol = %symbol, "Net position overflows"),
                }
            }
            for (key, fault) in view.faults() {
                warn!(key = %key, sequence = fault.sequence, blocked = fault.blocked, reason = %fault.reason, "Halted stream");
            }
        }
        Command::Trades {
            symbol,
            limit,
            after,
        } => {
            let trades = match symbol.as_deref().and_then(Symbol::try_new) {
                Some(symbol) => store.recent_trades(&symbol, limit)?,
                None => store.trades_after(after, limit)?,
            };
            for trade in &trades {
                println!("{}", serde_json::to_string(trade)?);
            }
        }
        Command::Rebuild => {
            let mut registry = ExchangeRegistry::load(store.as_ref())?;
            let mut engine = RecoveryEngine::new(config.snapshot_dir.clone(), config.snapshot_compress);
            let view = engine.rebuild(store.as_ref(), &mut registry, config.batch_size)?;
            let path = engine.take_snapshot(&view, types::now_nanos(), config.snapshot_retain)?;
            info!(
                commit_marker = view.commit_marker(),
                positions = view.len(),
                faults = view.faults().len(),
                snapshot = ?path,
                "Rebuild complete"
            );
            println!("{}", view.state_hash());
        }
        Command::Verify => {
            let mut registry = ExchangeRegistry::load(store.as_ref())?;
            let mut engine = RecoveryEngine::new(config.snapshot_dir.clone(), config.snapshot_compress);
            let (view, _) = engine.recover(store.as_ref(), &mut registry, config.batch_size)?;
            let report = engine.verify(&view, store.as_ref(), &mut registry, config.batch_size)?;
            if !report.is_match() {
                bail!(
                    "position view diverges from full replay at commit marker {}: {}",
                    view.commit_marker(),
                    report.detail
                );
            }
            println!("{}", report.hash_a);
        }
        Command::Run => run(store, &config).await?,
    }

    Ok(())
}

async fn ingest(store: Arc<dyn TradeStore>, config: &LedgerConfig, input: &str) -> anyhow::Result<()> {
    let service = IngestService::new(IdempotentWriter::new(Arc::clone(&store)), config.retry.policy()).await?;

    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if input == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        let file = tokio::fs::File::open(input)
            .await
            .with_context(|| format!("opening {input}"))?;
        Box::new(BufReader::new(file))
    };

    let mut lines = reader.lines();
    let mut line_no = 0u64;
    let mut unparsed = 0u64;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let inbound: InboundTrade = match serde_json::from_str(&line) {
            Ok(inbound) => inbound,
            Err(e) => {
                unparsed += 1;
                warn!(line = line_no, error = %e, "Unparseable trade");
                continue;
            }
        };
        match service.ingest(&inbound).await {
            Ok(_) | Err(IngestError::Rejected(_)) => {}
            Err(IngestError::Storage(e)) => {
                service.log_stats();
                return Err(e).with_context(|| format!("storing line {line_no}"));
            }
        }
    }
    service.log_stats();

    let (mut consumer, _) =
        AggregationConsumer::start(store, service.commit_signal(), ConsumerConfig::from(config)).await?;
    consumer.catch_up().await?;
    consumer.snapshot_now().await;

    let stats = service.stats();
    println!(
        "{}",
        serde_json::json!({
            "received": stats.received,
            "committed": stats.committed,
            "duplicates": stats.duplicates,
            "rejected": stats.rejected,
            "unparsed": unparsed,
            "commit_marker": consumer.commit_marker(),
        })
    );
    Ok(())
}

async fn run(store: Arc<dyn TradeStore>, config: &LedgerConfig) -> anyhow::Result<()> {
    let writer = IdempotentWriter::new(Arc::clone(&store));
    let (consumer, metrics) =
        AggregationConsumer::start(store, writer.commit_signal(), ConsumerConfig::from(config)).await?;
    info!(
        snapshot_sequence = metrics.snapshot_sequence,
        replayed = metrics.replay_count,
        "Position view ready"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(consumer.run(stop_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    let _ = stop_tx.send(true);

    handle.await??;
    Ok(())
}
