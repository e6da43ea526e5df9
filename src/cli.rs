//! CLI definition and dispatch.

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

use crate::adapters::csv_adapter::CsvFeed;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::memory_store::MemoryStore;
use crate::domain::config_validation::{
    build_contract, build_ledger_config, build_run_config, build_strategy, validate_run_config,
    StrategyDefinition,
};
use crate::domain::error::PerpError;
use crate::domain::harness::{run_sessions, RunReport, Session, StopFlag};
use crate::domain::ledger::Ledger;
use crate::domain::signal::Category;
use crate::ports::config_port::ConfigPort;
use crate::ports::feed_port::MarketDataFeed;
use crate::ports::store_port::PersistenceStore;

#[derive(Parser, Debug)]
#[command(name = "perptrader", about = "Perpetual-futures strategy backtester")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay one or more CSV feeds through a strategy
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        strategy: PathBuf,
        /// CSV feeds; each one runs as its own session
        #[arg(required = true)]
        feeds: Vec<PathBuf>,
        /// SQLite file for orders and results, overriding [sqlite] path
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Parse and validate a strategy file
    Validate {
        #[arg(short, long)]
        strategy: PathBuf,
        /// Optional run config to validate alongside
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Show a CSV feed's time range and indicator columns
    Inspect { feed: PathBuf },
}

pub fn run(cli: Cli) -> ExitCode {
    match cli.command {
        Command::Backtest {
            config,
            strategy,
            feeds,
            db,
        } => run_backtest(&config, &strategy, &feeds, db.as_deref()),
        Command::Validate { strategy, config } => run_validate(&strategy, config.as_deref()),
        Command::Inspect { feed } => run_inspect(&feed),
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, ExitCode> {
    FileConfigAdapter::from_file(path).map_err(|e| {
        let err = PerpError::ConfigParse {
            file: path.display().to_string(),
            reason: e.to_string(),
        };
        eprintln!("error: {err}");
        ExitCode::from(&err)
    })
}

fn fail(err: &PerpError) -> ExitCode {
    eprintln!("error: {err}");
    err.into()
}

/// Session id for a feed: the strategy and symbol, plus the file stem when
/// several feeds share one run.
fn session_id(strategy: &str, symbol: &str, feed: &str, multi: bool) -> String {
    if !multi {
        return format!("{strategy}-{symbol}");
    }
    let stem = Path::new(feed)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| feed.to_string());
    format!("{strategy}-{symbol}-{stem}")
}

/// Builds one session per feed and replays them in parallel.
pub fn run_backtest_pipeline<F>(
    run_config: &dyn ConfigPort,
    definition: &StrategyDefinition,
    feeds: Vec<F>,
    store: &dyn PersistenceStore,
    stop: &StopFlag,
) -> Result<Vec<Result<RunReport, PerpError>>, PerpError>
where
    F: MarketDataFeed + Send,
{
    let run = build_run_config(run_config)?;
    let (symbol, spec) = build_contract(run_config)?;
    let ledger_config = build_ledger_config(run_config)?;
    let multi = feeds.len() > 1;

    let mut jobs = Vec::with_capacity(feeds.len());
    for feed in feeds {
        let ledger = Ledger::with_contract(symbol.clone(), spec.clone(), ledger_config)?;
        let id = session_id(&definition.name, &symbol, feed.source_name(), multi);
        let session = Session::new(ledger, definition.instantiate(&run), run.clone()).with_id(id);
        jobs.push((session, feed));
    }

    info!(sessions = jobs.len(), strategy = %definition.name, "starting backtest");
    Ok(run_sessions(jobs, store, stop))
}

pub fn print_report(report: &RunReport) {
    let r = &report.result;
    let sign = if r.total_pnl_usd >= 0.0 { "+" } else { "" };
    println!("\n=== {} ===", report.session);
    println!("Ticks:            {}", report.ticks);
    println!("Orders:           {}", report.orders);
    println!("Positions:        {} ({} won, {} lost)", r.positions, r.wins, r.losses);
    println!("Win Ratio:        {:.1}%", r.win_ratio * 100.0);
    println!("Total PnL:        {}${:.2} ({}{:.2}%)", sign, r.total_pnl_usd, sign, r.total_pnl_percent);
    println!("Fees:             ${:.2}", r.total_fees_usd);
    println!("Max Drawdown:     -{:.1}%", r.max_drawdown * 100.0);
    println!("Liquidations:     {}", r.liquidations);
    println!("Sharpe Ratio:     {:.2}", r.sharpe_ratio);
    println!("Sortino Ratio:    {:.2}", r.sortino_ratio);
    println!("Calmar Ratio:     {:.2}", r.calmar_ratio);
    println!("Avg Hold:         {:.0} min", r.avg_hold_minutes);
    println!("Buy and Hold:     {:.2}%", r.hodl_percent);
    if report.rejected > 0 {
        println!("Rejected Orders:  {}", report.rejected);
    }
    if report.store_failures > 0 {
        println!("Store Failures:   {}", report.store_failures);
    }
    if report.stopped {
        println!("(stopped early)");
    }
}

fn open_store(
    run_config: &dyn ConfigPort,
    db: Option<&Path>,
) -> Result<Box<dyn PersistenceStore>, PerpError> {
    #[cfg(feature = "sqlite")]
    {
        use crate::adapters::sqlite_adapter::SqliteStore;

        if let Some(path) = db {
            let pool_size = run_config.get_int("sqlite", "pool_size", 4).max(1) as u32;
            return Ok(Box::new(SqliteStore::open(path, pool_size)?));
        }
        if run_config.has_section("sqlite") {
            return Ok(Box::new(SqliteStore::from_config(run_config)?));
        }
    }

    #[cfg(not(feature = "sqlite"))]
    {
        if db.is_some() || run_config.has_section("sqlite") {
            tracing::warn!("sqlite feature disabled, results kept in memory only");
        }
    }

    Ok(Box::new(MemoryStore::new()))
}

fn run_backtest(
    config_path: &Path,
    strategy_path: &Path,
    feed_paths: &[PathBuf],
    db: Option<&Path>,
) -> ExitCode {
    eprintln!("Loading config from {}", config_path.display());
    let run_config = match load_config(config_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    if let Err(e) = validate_run_config(&run_config) {
        return fail(&e);
    }

    eprintln!("Loading strategy from {}", strategy_path.display());
    let strategy_config = match load_config(strategy_path) {
        Ok(a) => a,
        Err(code) => return code,
    };
    let definition = match build_strategy(&strategy_config) {
        Ok(d) => d,
        Err(e) => return fail(&e),
    };

    let mut feeds = Vec::with_capacity(feed_paths.len());
    for path in feed_paths {
        match CsvFeed::from_path(path) {
            Ok(feed) => {
                eprintln!("  {}: {} snapshots", path.display(), feed.len());
                feeds.push(feed);
            }
            Err(e) => return fail(&e),
        }
    }

    let store = match open_store(&run_config, db) {
        Ok(s) => s,
        Err(e) => return fail(&e),
    };

    eprintln!(
        "Running {} ({}) over {} feed(s)",
        definition.name,
        definition.kind.as_str(),
        feeds.len()
    );
    let stop = StopFlag::new();
    let results =
        match run_backtest_pipeline(&run_config, &definition, feeds, store.as_ref(), &stop) {
            Ok(r) => r,
            Err(e) => return fail(&e),
        };

    let mut exit = ExitCode::SUCCESS;
    for result in results {
        match result {
            Ok(report) => print_report(&report),
            Err(e) => exit = fail(&e),
        }
    }
    exit
}

fn run_validate(strategy_path: &Path, config_path: Option<&Path>) -> ExitCode {
    if let Some(path) = config_path {
        eprintln!("Validating run config: {}", path.display());
        let run_config = match load_config(path) {
            Ok(a) => a,
            Err(code) => return code,
        };
        if let Err(e) = validate_run_config(&run_config) {
            return fail(&e);
        }
    }

    eprintln!("Validating strategy: {}", strategy_path.display());
    let adapter = match load_config(strategy_path) {
        Ok(a) => a,
        Err(code) => return code,
    };

    let definition = match build_strategy(&adapter) {
        Ok(d) => d,
        Err(PerpError::RuleParse(e)) => {
            let config = &adapter;
            let offending = Category::ALL
                .iter()
                .flat_map(|c| {
                    let section = c.section();
                    config
                        .keys(section)
                        .into_iter()
                        .filter_map(move |k| config.get_string(section, &k))
                })
                .find(|text| crate::domain::rule_parser::parse_step(text).is_err());
            match offending {
                Some(text) => eprintln!("error: {}", e.display_with_context(&text)),
                None => eprintln!("error: {e}"),
            }
            return (&PerpError::RuleParse(e)).into();
        }
        Err(e) => return fail(&e),
    };

    eprintln!("\nStrategy: {} ({})", definition.name, definition.kind.as_str());
    for category in Category::ALL {
        let steps = definition.rules.steps(category);
        if steps.is_empty() {
            continue;
        }
        eprintln!("\n[{}]", category);
        for (i, step) in steps.iter().enumerate() {
            let text: Vec<String> = step.iter().map(|r| r.to_string()).collect();
            eprintln!("  step{}: {}", i + 1, text.join("; "));
        }
    }

    eprintln!("\nStrategy configuration is valid.");
    ExitCode::SUCCESS
}

fn run_inspect(path: &Path) -> ExitCode {
    let feed = match CsvFeed::from_path(path) {
        Ok(f) => f,
        Err(e) => return fail(&e),
    };
    let Some((first, last)) = feed.range() else {
        return fail(&PerpError::NoData {
            source_name: feed.source_name().to_string(),
        });
    };

    println!("{}", feed.source_name());
    println!("  snapshots: {}", feed.len());
    println!("  from:      {}", first);
    println!("  to:        {}", last);
    let columns = feed.indicator_columns();
    if columns.is_empty() {
        println!("  indicators: none");
    } else {
        println!("  indicators:");
        for column in columns {
            println!("    {}", column);
        }
    }
    ExitCode::SUCCESS
}
