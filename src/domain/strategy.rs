//! Strategy seam and the rule-driven strategy.
//!
//! A strategy looks at the current snapshot and a read-only view of its
//! ledger and answers with at most one [`OrderIntent`] per tick. The harness
//! owns execution; strategies never touch the ledger directly.

use tracing::debug;

use crate::domain::backtest::RunConfig;
use crate::domain::ledger::Ledger;
use crate::domain::order::Direction;
use crate::domain::position::{ClosedPosition, Position};
use crate::domain::rule_eval::{EvalContext, PositionMetrics};
use crate::domain::signal::{self, Category, RuleSet, SignalProgress};
use crate::domain::snapshot::MarketSnapshot;

/// How much margin an entry commits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Notional {
    /// `available_capital / steps`, computed by the harness.
    EntrySlice,
    Usd(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderIntent {
    /// `leverage` is applied before the open when set.
    Open {
        direction: Direction,
        notional: Notional,
        leverage: Option<f64>,
        client_order_id: Option<String>,
    },
    Close {
        size: f64,
        client_order_id: Option<String>,
    },
    CloseAll {
        client_order_id: Option<String>,
    },
    SetLeverage {
        leverage: f64,
    },
}

/// Read-only ledger access for a strategy's decision.
#[derive(Debug, Clone, Copy)]
pub struct LedgerView<'a> {
    pub ledger: &'a Ledger,
    pub available_capital: f64,
    pub entry_slice_usd: f64,
}

impl<'a> LedgerView<'a> {
    pub fn new(ledger: &'a Ledger, config: &RunConfig) -> Self {
        let available_capital = ledger.available_capital(config.start_capital);
        LedgerView {
            ledger,
            available_capital,
            entry_slice_usd: config.entry_slice(available_capital),
        }
    }

    pub fn position(&self) -> Option<&'a Position> {
        self.ledger.position()
    }
}

pub trait Strategy {
    fn name(&self) -> &str;

    fn decide(
        &mut self,
        snapshot: &MarketSnapshot,
        previous: Option<&MarketSnapshot>,
        view: &LedgerView<'_>,
    ) -> Option<OrderIntent>;

    /// Called once for every position archived, including liquidations.
    fn on_position_closed(&mut self, _closed: &ClosedPosition) {}
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn decide(
        &mut self,
        snapshot: &MarketSnapshot,
        previous: Option<&MarketSnapshot>,
        view: &LedgerView<'_>,
    ) -> Option<OrderIntent> {
        (**self).decide(snapshot, previous, view)
    }

    fn on_position_closed(&mut self, closed: &ClosedPosition) {
        (**self).on_position_closed(closed)
    }
}

/// Trades the four-category signal machine over a parsed [`RuleSet`].
///
/// With a position open only the matching exit category is evaluated; when
/// flat, only entries for directions that have rules. Stop loss and leverage
/// reduction are checked before the exit signal.
#[derive(Debug, Clone)]
pub struct RuleStrategy {
    name: String,
    rules: RuleSet,
    progress: SignalProgress,
    config: RunConfig,
}

impl RuleStrategy {
    pub fn new(name: impl Into<String>, rules: RuleSet, config: RunConfig) -> Self {
        RuleStrategy {
            name: name.into(),
            rules,
            progress: SignalProgress::default(),
            config,
        }
    }

    pub fn progress(&self) -> SignalProgress {
        self.progress
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    fn gated_entries(&self) -> Vec<Category> {
        [Direction::Long, Direction::Short]
            .into_iter()
            .filter(|d| self.rules.trades(*d))
            .map(Category::entry)
            .collect()
    }
}

impl Strategy for RuleStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(
        &mut self,
        snapshot: &MarketSnapshot,
        previous: Option<&MarketSnapshot>,
        view: &LedgerView<'_>,
    ) -> Option<OrderIntent> {
        let position = view.position();
        let metrics = position.map(|p| PositionMetrics::from_position(p, snapshot.timestamp));
        let ctx = EvalContext::new(snapshot)
            .with_previous(previous)
            .with_position(metrics)
            .with_multiplier(self.config.multiplier);

        let Some(position) = position else {
            let gated = self.gated_entries();
            let (next, fired) = signal::evaluate(&self.rules, &self.progress, &ctx, &gated);
            self.progress = next;
            return fired.map(|category| OrderIntent::Open {
                direction: category.direction(),
                notional: Notional::EntrySlice,
                leverage: Some(self.config.leverage),
                client_order_id: None,
            });
        };

        if self.config.stop_loss_hit(position.unrealized_pnl_percent) {
            debug!(
                strategy = %self.name,
                pnl_percent = position.unrealized_pnl_percent,
                "stop loss"
            );
            self.progress.reset();
            return Some(OrderIntent::CloseAll {
                client_order_id: None,
            });
        }

        let gated = [Category::exit(position.direction)];
        let (next, fired) = signal::evaluate(&self.rules, &self.progress, &ctx, &gated);
        self.progress = next;
        if fired.is_some() {
            return Some(OrderIntent::CloseAll {
                client_order_id: None,
            });
        }

        if self.config.lever_reduce_hit(position.unrealized_pnl_percent) && position.leverage > 1.0
        {
            return Some(OrderIntent::SetLeverage {
                leverage: (position.leverage - 1.0).max(1.0),
            });
        }

        None
    }

    fn on_position_closed(&mut self, _closed: &ClosedPosition) {
        self.progress.reset();
    }
}
