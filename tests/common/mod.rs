#![allow(dead_code)]

use chrono::{NaiveDate, NaiveDateTime};
use perptrader::adapters::file_config_adapter::FileConfigAdapter;
use perptrader::domain::contract::ContractSpec;
use perptrader::domain::ledger::{Ledger, LedgerConfig};
use perptrader::domain::snapshot::MarketSnapshot;
use perptrader::ports::feed_port::MarketDataFeed;
use std::collections::BTreeMap;
use std::io::Write;

pub const SYMBOL: &str = "SOL-USDT";

/// Run config: 300 USD in 3 slices at 2x, base-asset sized contract.
pub const RUN_INI: &str = r#"
[run]
start_capital = 300
steps = 3
leverage = 2
stop_loss_percent = 80
lever_reduce_percent = 60

[contract]
symbol = SOL-USDT
min_size = 0.01
size_step = 0.01
max_leverage = 50
fee_rate = 0.0005
"#;

pub const RSI_STRATEGY_INI: &str = r#"
[strategy]
name = rsi
kind = rules

[long_entry]
step1 = BELOW(IND(5m, rsi), 30)

[long_exit]
step1 = ABOVE(IND(5m, rsi), 70)
"#;

pub const LADDER_STRATEGY_INI: &str = r#"
[strategy]
name = ladder
kind = ladder
"#;

pub fn at(min: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        + chrono::Duration::minutes(i64::from(min))
}

pub fn config(content: &str) -> FileConfigAdapter {
    FileConfigAdapter::from_string(content).unwrap()
}

pub fn write_temp(content: &str, suffix: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

pub fn sol_spec() -> ContractSpec {
    ContractSpec::linear(0.01, 0.01, 50.0, 0.0005)
}

pub fn sol_ledger() -> Ledger {
    Ledger::with_contract(SYMBOL, sol_spec(), LedgerConfig::default()).unwrap()
}

/// In-memory feed of `(minute, price, rsi)` rows.
pub struct MockFeed {
    pub name: String,
    pub snapshots: BTreeMap<NaiveDateTime, MarketSnapshot>,
}

impl MockFeed {
    pub fn new(name: &str, rows: &[(u32, f64, f64)]) -> Self {
        let snapshots = rows
            .iter()
            .map(|&(min, price, rsi)| {
                let snap = MarketSnapshot::new(at(min), price).with_indicator("5m", "rsi", rsi);
                (at(min), snap)
            })
            .collect();
        MockFeed {
            name: name.to_string(),
            snapshots,
        }
    }

    pub fn prices(name: &str, prices: &[f64]) -> Self {
        let rows: Vec<_> = prices
            .iter()
            .enumerate()
            .map(|(i, &p)| (i as u32 * 5, p, 50.0))
            .collect();
        Self::new(name, &rows)
    }
}

impl MarketDataFeed for MockFeed {
    fn source_name(&self) -> &str {
        &self.name
    }

    fn timestamps(&self) -> Vec<NaiveDateTime> {
        self.snapshots.keys().copied().collect()
    }

    fn snapshot(&self, timestamp: NaiveDateTime) -> Option<MarketSnapshot> {
        self.snapshots.get(&timestamp).cloned()
    }
}

/// RSI dips below 30 at minute 5 and rises above 70 at minute 15.
pub fn rsi_round_trip() -> MockFeed {
    MockFeed::new(
        "sol.csv",
        &[
            (0, 10.0, 50.0),
            (5, 10.0, 25.0),
            (10, 11.0, 60.0),
            (15, 12.0, 75.0),
            (20, 12.0, 50.0),
        ],
    )
}

pub const RSI_ROUND_TRIP_CSV: &str = "timestamp,price,5m.rsi\n\
2024-03-01 00:00:00,10.0,50\n\
2024-03-01 00:05:00,10.0,25\n\
2024-03-01 00:10:00,11.0,60\n\
2024-03-01 00:15:00,12.0,75\n\
2024-03-01 00:20:00,12.0,50\n";
