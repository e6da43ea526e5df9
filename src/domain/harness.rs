//! Replay harness: drives one strategy against one ledger over a feed.
//!
//! Each tick marks the ledger, force-closes a liquidatable position, or asks
//! the strategy for one [`OrderIntent`] and executes it. Recoverable ledger
//! errors skip that tick's order; configuration errors end the run. Store
//! failures are logged and counted, never fatal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::domain::backtest::RunConfig;
use crate::domain::error::{LedgerError, PerpError};
use crate::domain::ledger::{CloseOutcome, Ledger};
use crate::domain::metrics::RunResult;
use crate::domain::order::Order;
use crate::domain::snapshot::MarketSnapshot;
use crate::domain::strategy::{LedgerView, Notional, OrderIntent, Strategy};
use crate::ports::feed_port::MarketDataFeed;
use crate::ports::store_port::PersistenceStore;

/// Cooperative cancellation shared between a controller and running sessions.
/// Checked before each tick.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub session: String,
    pub result: RunResult,
    pub ticks: usize,
    pub orders: usize,
    /// Order attempts dropped on a recoverable ledger error.
    pub rejected: usize,
    pub store_failures: usize,
    pub stopped: bool,
}

pub struct Session<S: Strategy> {
    id: String,
    ledger: Ledger,
    strategy: S,
    config: RunConfig,
    previous: Option<MarketSnapshot>,
    first_price: Option<f64>,
    ticks: usize,
    orders: usize,
    rejected: usize,
    store_failures: usize,
}

impl<S: Strategy> Session<S> {
    pub fn new(ledger: Ledger, strategy: S, config: RunConfig) -> Self {
        let id = format!("{}-{}", strategy.name(), ledger.symbol());
        Session {
            id,
            ledger,
            strategy,
            config,
            previous: None,
            first_price: None,
            ticks: 0,
            orders: 0,
            rejected: 0,
            store_failures: 0,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Replays every feed timestamp in ascending order, then finishes the run.
    pub fn run(
        mut self,
        feed: &dyn MarketDataFeed,
        store: &dyn PersistenceStore,
        stop: &StopFlag,
    ) -> Result<RunReport, PerpError> {
        let mut timestamps = feed.timestamps();
        timestamps.sort();
        timestamps.dedup();
        if timestamps.is_empty() {
            return Err(PerpError::NoData {
                source_name: feed.source_name().to_string(),
            });
        }

        info!(session = %self.id, ticks = timestamps.len(), "replay started");
        let mut stopped = false;
        for timestamp in timestamps {
            if stop.is_stopped() {
                info!(session = %self.id, %timestamp, "stop requested");
                stopped = true;
                break;
            }
            let Some(snapshot) = feed.snapshot(timestamp) else {
                debug!(session = %self.id, %timestamp, "no snapshot");
                continue;
            };
            self.tick(snapshot, store)?;
        }

        let mut report = self.finish(store)?;
        report.stopped = stopped;
        Ok(report)
    }

    /// Processes one snapshot.
    pub fn tick(
        &mut self,
        snapshot: MarketSnapshot,
        store: &dyn PersistenceStore,
    ) -> Result<(), PerpError> {
        self.ticks += 1;
        self.ledger.mark(snapshot.price, snapshot.timestamp);
        if self.first_price.is_none() && self.ledger.price().is_some() {
            self.first_price = self.ledger.price();
        }

        if self.ledger.is_liquidatable() {
            let outcome = self.ledger.liquidate()?;
            self.record(outcome, store);
            self.previous = Some(snapshot);
            return Ok(());
        }

        let view = LedgerView::new(&self.ledger, &self.config);
        let intent = self
            .strategy
            .decide(&snapshot, self.previous.as_ref(), &view);

        if let Some(intent) = intent {
            if let Err(e) = self.execute(intent, store) {
                if e.is_fatal() {
                    error!(session = %self.id, error = %e, "fatal ledger error");
                    return Err(e.into());
                }
                warn!(
                    session = %self.id,
                    time = %snapshot.timestamp,
                    error = %e,
                    "order attempt skipped"
                );
                self.rejected += 1;
            }
        }

        self.previous = Some(snapshot);
        Ok(())
    }

    /// Closes any open position when configured, then computes and stores
    /// the run result.
    pub fn finish(mut self, store: &dyn PersistenceStore) -> Result<RunReport, PerpError> {
        if self.config.close_at_end && self.ledger.has_position() {
            if let Err(e) = self.execute(
                OrderIntent::CloseAll {
                    client_order_id: None,
                },
                store,
            ) {
                if e.is_fatal() {
                    return Err(e.into());
                }
                warn!(session = %self.id, error = %e, "close at end failed");
                self.rejected += 1;
            }
        }

        let result = RunResult::compute(
            self.ledger.symbol(),
            self.strategy.name(),
            self.config.start_capital,
            self.ledger.closed_positions(),
            self.first_price,
            self.ledger.price(),
        );
        if let Err(e) = store.write_result(&self.id, &result) {
            error!(session = %self.id, error = %e, "failed to store run result");
            self.store_failures += 1;
        }

        info!(
            session = %self.id,
            positions = result.positions,
            pnl_usd = result.total_pnl_usd,
            liquidations = result.liquidations,
            store_failures = self.store_failures,
            "replay finished"
        );

        Ok(RunReport {
            session: self.id,
            result,
            ticks: self.ticks,
            orders: self.orders,
            rejected: self.rejected,
            store_failures: self.store_failures,
            stopped: false,
        })
    }

    fn execute(
        &mut self,
        intent: OrderIntent,
        store: &dyn PersistenceStore,
    ) -> Result<(), LedgerError> {
        let start = self.config.start_capital;
        match intent {
            OrderIntent::Open {
                direction,
                notional,
                leverage,
                client_order_id,
            } => {
                if let Some(leverage) = leverage {
                    let available = self.ledger.available_capital(start);
                    self.ledger.set_leverage(leverage, available)?;
                }
                let available = self.ledger.available_capital(start);
                let amount = match notional {
                    Notional::EntrySlice => self.config.entry_slice(available),
                    Notional::Usd(usd) => usd,
                };
                if amount > available {
                    return Err(LedgerError::InsufficientCapital {
                        required: amount,
                        available,
                    });
                }
                match self
                    .ledger
                    .open_order(direction, amount, client_order_id.as_deref())?
                {
                    Some(order) => self.store_order(&order, store),
                    None => debug!(session = %self.id, amount, "open not executed"),
                }
            }
            OrderIntent::Close {
                size,
                client_order_id,
            } => {
                let outcome = self.ledger.close_order(size, client_order_id.as_deref())?;
                self.record(outcome, store);
            }
            OrderIntent::CloseAll { client_order_id } => {
                let size = self
                    .ledger
                    .position()
                    .map(|p| p.size)
                    .ok_or(LedgerError::NoPosition)?;
                let outcome = self.ledger.close_order(size, client_order_id.as_deref())?;
                self.record(outcome, store);
            }
            OrderIntent::SetLeverage { leverage } => {
                let available = self.ledger.available_capital(start);
                self.ledger.set_leverage(leverage, available)?;
            }
        }
        Ok(())
    }

    fn store_order(&mut self, order: &Order, store: &dyn PersistenceStore) {
        self.orders += 1;
        if let Err(e) = store.write_order(&self.id, order) {
            error!(session = %self.id, id = %order.client_order_id, error = %e, "failed to store order");
            self.store_failures += 1;
        }
    }

    fn record(&mut self, outcome: CloseOutcome, store: &dyn PersistenceStore) {
        self.store_order(&outcome.order, store);
        if let Some(closed) = outcome.closed {
            if let Err(e) = store.write_closed_position(&self.id, &closed) {
                error!(session = %self.id, error = %e, "failed to store closed position");
                self.store_failures += 1;
            }
            self.strategy.on_position_closed(&closed);
        }
    }
}

/// Runs independent sessions concurrently, one rayon task each. Results come
/// back in input order.
pub fn run_sessions<S, F>(
    jobs: Vec<(Session<S>, F)>,
    store: &dyn PersistenceStore,
    stop: &StopFlag,
) -> Vec<Result<RunReport, PerpError>>
where
    S: Strategy + Send,
    F: MarketDataFeed + Send,
{
    jobs.into_par_iter()
        .map(|(session, feed)| session.run(&feed, store, stop))
        .collect()
}
