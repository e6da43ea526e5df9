//! CLI integration tests for the backtest command orchestration.
//!
//! Tests cover:
//! - Pipeline over several feeds with session ids per feed
//! - Config errors surfacing before any session runs
//! - SQLite persistence of a full run
//! - Command dispatch with real INI and CSV files on disk

mod common;

use approx::assert_relative_eq;
use common::*;
use perptrader::adapters::csv_adapter::CsvFeed;
use perptrader::adapters::memory_store::MemoryStore;
use perptrader::cli::{self, Cli, Command};
use perptrader::domain::config_validation::build_strategy;
use perptrader::domain::error::PerpError;
use perptrader::domain::harness::StopFlag;
use std::process::ExitCode;

mod pipeline {
    use super::*;

    #[test]
    fn single_feed_uses_strategy_and_symbol() {
        let definition = build_strategy(&config(RSI_STRATEGY_INI)).unwrap();
        let store = MemoryStore::new();
        let results = cli::run_backtest_pipeline(
            &config(RUN_INI),
            &definition,
            vec![rsi_round_trip()],
            &store,
            &StopFlag::new(),
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        let report = results[0].as_ref().unwrap();
        assert_eq!(report.session, "rsi-SOL-USDT");
        assert_relative_eq!(report.result.total_pnl_usd, 39.78, epsilon = 1e-9);
    }

    #[test]
    fn multiple_feeds_get_distinct_sessions() {
        let definition = build_strategy(&config(RSI_STRATEGY_INI)).unwrap();
        let mut second = rsi_round_trip();
        second.name = "/data/sol-march.csv".to_string();
        let store = MemoryStore::new();
        let results = cli::run_backtest_pipeline(
            &config(RUN_INI),
            &definition,
            vec![rsi_round_trip(), second],
            &store,
            &StopFlag::new(),
        )
        .unwrap();

        let sessions: Vec<_> = results
            .iter()
            .map(|r| r.as_ref().unwrap().session.clone())
            .collect();
        assert_eq!(sessions, vec!["rsi-SOL-USDT-sol", "rsi-SOL-USDT-sol-march"]);
        assert_eq!(store.orders_for("rsi-SOL-USDT-sol").len(), 2);
        assert_eq!(store.orders_for("rsi-SOL-USDT-sol-march").len(), 2);
    }

    #[test]
    fn invalid_run_config_fails_before_running() {
        let definition = build_strategy(&config(RSI_STRATEGY_INI)).unwrap();
        let store = MemoryStore::new();
        let err = cli::run_backtest_pipeline(
            &config("[run]\nsteps = 3\n"),
            &definition,
            vec![rsi_round_trip()],
            &store,
            &StopFlag::new(),
        )
        .unwrap_err();
        assert!(matches!(err, PerpError::ConfigMissing { key, .. } if key == "symbol"));
        assert!(store.orders().is_empty());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn run_persists_to_sqlite() {
        use perptrader::adapters::sqlite_adapter::SqliteStore;

        let definition = build_strategy(&config(RSI_STRATEGY_INI)).unwrap();
        let store = SqliteStore::in_memory().unwrap();
        let results = cli::run_backtest_pipeline(
            &config(RUN_INI),
            &definition,
            vec![rsi_round_trip()],
            &store,
            &StopFlag::new(),
        )
        .unwrap();
        assert!(results[0].is_ok());

        assert_eq!(store.count_orders("rsi-SOL-USDT").unwrap(), 2);
        assert_eq!(store.count_closed_positions("rsi-SOL-USDT").unwrap(), 1);
        let rows = store.load_results().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].strategy, "rsi");
        assert_eq!(rows[0].positions, 1);
        assert_relative_eq!(rows[0].total_pnl_usd, 39.78, epsilon = 1e-9);
    }
}

mod dispatch {
    use super::*;

    fn assert_exit(code: ExitCode, expected: u8) {
        assert_eq!(format!("{code:?}"), format!("{:?}", ExitCode::from(expected)));
    }

    fn backtest(config: &std::path::Path, strategy: &std::path::Path, feed: &std::path::Path) -> ExitCode {
        cli::run(Cli {
            command: Command::Backtest {
                config: config.to_path_buf(),
                strategy: strategy.to_path_buf(),
                feeds: vec![feed.to_path_buf()],
                db: None,
            },
        })
    }

    #[test]
    fn backtest_with_files_succeeds() {
        let run = write_temp(RUN_INI, ".ini");
        let strategy = write_temp(RSI_STRATEGY_INI, ".ini");
        let feed = write_temp(RSI_ROUND_TRIP_CSV, ".csv");
        assert_exit(backtest(run.path(), strategy.path(), feed.path()), 0);
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn backtest_writes_db_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("runs.db");
        let run = write_temp(RUN_INI, ".ini");
        let strategy = write_temp(RSI_STRATEGY_INI, ".ini");
        let feed = write_temp(RSI_ROUND_TRIP_CSV, ".csv");
        let code = cli::run(Cli {
            command: Command::Backtest {
                config: run.path().to_path_buf(),
                strategy: strategy.path().to_path_buf(),
                feeds: vec![feed.path().to_path_buf()],
                db: Some(db.clone()),
            },
        });
        assert_exit(code, 0);
        assert!(db.exists());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn db_path_with_hash_is_used_verbatim() {
        use perptrader::adapters::sqlite_adapter::SqliteStore;

        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("run#2.db");
        let run = write_temp(RUN_INI, ".ini");
        let strategy = write_temp(RSI_STRATEGY_INI, ".ini");
        let feed = write_temp(RSI_ROUND_TRIP_CSV, ".csv");
        let code = cli::run(Cli {
            command: Command::Backtest {
                config: run.path().to_path_buf(),
                strategy: strategy.path().to_path_buf(),
                feeds: vec![feed.path().to_path_buf()],
                db: Some(db.clone()),
            },
        });
        assert_exit(code, 0);
        assert!(db.exists());
        assert!(!dir.path().join("run").exists());

        let store = SqliteStore::open(&db, 1).unwrap();
        assert_eq!(store.load_results().unwrap().len(), 1);
    }

    #[test]
    fn missing_config_file_is_config_error() {
        let strategy = write_temp(RSI_STRATEGY_INI, ".ini");
        let feed = write_temp(RSI_ROUND_TRIP_CSV, ".csv");
        let code = backtest(
            std::path::Path::new("/nonexistent/run.ini"),
            strategy.path(),
            feed.path(),
        );
        assert_exit(code, 2);
    }

    #[test]
    fn bad_rule_is_rule_error() {
        let run = write_temp(RUN_INI, ".ini");
        let strategy = write_temp(
            "[strategy]\nname = broken\n[long_entry]\nstep1 = ABOVE(price,\n",
            ".ini",
        );
        let feed = write_temp(RSI_ROUND_TRIP_CSV, ".csv");
        assert_exit(backtest(run.path(), strategy.path(), feed.path()), 4);
    }

    #[test]
    fn bad_feed_is_feed_error() {
        let run = write_temp(RUN_INI, ".ini");
        let strategy = write_temp(RSI_STRATEGY_INI, ".ini");
        let feed = write_temp("time,close\n", ".csv");
        assert_exit(backtest(run.path(), strategy.path(), feed.path()), 5);
    }

    #[test]
    fn validate_reports_success_and_errors() {
        let good = write_temp(RSI_STRATEGY_INI, ".ini");
        let code = cli::run(Cli {
            command: Command::Validate {
                strategy: good.path().to_path_buf(),
                config: None,
            },
        });
        assert_exit(code, 0);

        let bad = write_temp("[strategy]\nname = x\nkind = grid\n", ".ini");
        let code = cli::run(Cli {
            command: Command::Validate {
                strategy: bad.path().to_path_buf(),
                config: None,
            },
        });
        assert_exit(code, 2);
    }

    #[test]
    fn inspect_reads_feed() {
        let feed = write_temp(RSI_ROUND_TRIP_CSV, ".csv");
        let parsed = CsvFeed::from_path(feed.path()).unwrap();
        assert_eq!(parsed.len(), 5);
        let code = cli::run(Cli {
            command: Command::Inspect {
                feed: feed.path().to_path_buf(),
            },
        });
        assert_exit(code, 0);

        let empty = write_temp("timestamp,price\n", ".csv");
        let code = cli::run(Cli {
            command: Command::Inspect {
                feed: empty.path().to_path_buf(),
            },
        });
        assert_exit(code, 5);
    }
}
