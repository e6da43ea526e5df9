//! Long-only scale-in strategy with a leverage ladder.
//!
//! Enters with one entry slice at low leverage and then manages the position
//! on every tick: buys dips below the average, adds on pullbacks from the
//! peak, takes partial profit on the size added since entry, dollar-cost
//! averages into strength, and ratchets leverage up as price runs away from
//! the average. Released margin from a leverage step is partly redeployed on
//! the following tick.

use chrono::NaiveDateTime;
use tracing::debug;

use crate::domain::backtest::RunConfig;
use crate::domain::order::Direction;
use crate::domain::position::{ClosedPosition, Position};
use crate::domain::snapshot::MarketSnapshot;
use crate::domain::strategy::{LedgerView, Notional, OrderIntent, Strategy};

const DCA_TAG: &str = "buydca";

/// Trigger levels; ratios are applied to prices, percents to unrealized PnL.
#[derive(Debug, Clone, PartialEq)]
pub struct LadderConfig {
    pub multiplier: f64,
    pub initial_leverage: f64,
    pub stop_loss_percent: f64,
    pub lever_reduce_percent: f64,
    pub min_reduce_leverage: f64,
    pub buy_low_ratio: f64,
    pub buy_high_pullback: f64,
    pub buy_high_floor: f64,
    pub buy_high_fraction: f64,
    pub take_profit_percent: f64,
    pub take_profit_ratio: f64,
    pub take_profit_divisor: f64,
    pub dca_ratio: f64,
    pub dca_spacing_minutes: i64,
    pub dca_margin_fraction: f64,
    pub ladder_ratio: f64,
    pub ladder_step: f64,
    pub ladder_max_leverage: f64,
    pub ladder_spacing: f64,
    pub top_up_divisor: f64,
    pub deleverage_leverage: f64,
    pub breakeven_ratio: f64,
    pub scale_back_peak_ratio: f64,
}

impl Default for LadderConfig {
    fn default() -> Self {
        LadderConfig {
            multiplier: 0.95,
            initial_leverage: 2.0,
            stop_loss_percent: 80.0,
            lever_reduce_percent: 60.0,
            min_reduce_leverage: 2.0,
            buy_low_ratio: 0.975,
            buy_high_pullback: 0.95,
            buy_high_floor: 1.05,
            buy_high_fraction: 0.2,
            take_profit_percent: 50.0,
            take_profit_ratio: 1.07,
            take_profit_divisor: 6.0,
            dca_ratio: 1.2,
            dca_spacing_minutes: 30,
            dca_margin_fraction: 0.3,
            ladder_ratio: 1.1,
            ladder_step: 3.0,
            ladder_max_leverage: 37.0,
            ladder_spacing: 1.025,
            top_up_divisor: 12.0,
            deleverage_leverage: 10.0,
            breakeven_ratio: 1.005,
            scale_back_peak_ratio: 1.15,
        }
    }
}

/// Run-level settings the strategy file sets for itself. `None` means the
/// run's value applies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOverrides {
    pub multiplier: Option<f64>,
    pub initial_leverage: Option<f64>,
    pub stop_loss_percent: Option<f64>,
    pub lever_reduce_percent: Option<f64>,
}

impl LadderConfig {
    /// Copy of this config carrying the run's multiplier, leverage and loss
    /// thresholds, except where `pinned` sets them.
    pub fn for_run(&self, run: &RunConfig, pinned: &RunOverrides) -> LadderConfig {
        LadderConfig {
            multiplier: pinned.multiplier.unwrap_or(run.multiplier),
            initial_leverage: pinned.initial_leverage.unwrap_or(run.leverage),
            stop_loss_percent: pinned.stop_loss_percent.unwrap_or(run.stop_loss_percent),
            lever_reduce_percent: pinned
                .lever_reduce_percent
                .unwrap_or(run.lever_reduce_percent),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct LadderStrategy {
    name: String,
    config: LadderConfig,
    seq: u64,
    peak: Option<f64>,
    last_lever_increase: Option<f64>,
    /// Margin held before the last leverage step, awaiting redeployment.
    pending_top_up: Option<f64>,
}

impl LadderStrategy {
    pub fn new(name: impl Into<String>, config: LadderConfig) -> Self {
        LadderStrategy {
            name: name.into(),
            config,
            seq: 0,
            peak: None,
            last_lever_increase: None,
            pending_top_up: None,
        }
    }

    pub fn config(&self) -> &LadderConfig {
        &self.config
    }

    /// Highest price since entry, reset whenever price trades below the
    /// average entry.
    pub fn peak(&self) -> Option<f64> {
        self.peak
    }

    pub fn last_lever_increase(&self) -> Option<f64> {
        self.last_lever_increase
    }

    fn next_id(&mut self, tag: &str) -> Option<String> {
        self.seq += 1;
        Some(format!("{tag}-{}", self.seq))
    }

    fn open(&mut self, notional: Notional, tag: &str) -> OrderIntent {
        OrderIntent::Open {
            direction: Direction::Long,
            notional,
            leverage: None,
            client_order_id: self.next_id(tag),
        }
    }

    fn close(&mut self, size: f64, tag: &str) -> OrderIntent {
        OrderIntent::Close {
            size,
            client_order_id: self.next_id(tag),
        }
    }

    fn close_all(&mut self, tag: &str) -> OrderIntent {
        OrderIntent::CloseAll {
            client_order_id: self.next_id(tag),
        }
    }

    fn reset_session(&mut self) {
        self.peak = None;
        self.last_lever_increase = None;
        self.pending_top_up = None;
    }

    fn enter(&mut self, view: &LedgerView<'_>) -> Option<OrderIntent> {
        if view.entry_slice_usd > view.available_capital {
            debug!(
                strategy = %self.name,
                slice = view.entry_slice_usd,
                available = view.available_capital,
                "entry slice exceeds available capital"
            );
            return None;
        }
        Some(OrderIntent::Open {
            direction: Direction::Long,
            notional: Notional::EntrySlice,
            leverage: Some(self.config.initial_leverage),
            client_order_id: self.next_id("first"),
        })
    }

    fn manage(
        &mut self,
        price: f64,
        now: NaiveDateTime,
        position: &Position,
        view: &LedgerView<'_>,
    ) -> Option<OrderIntent> {
        let c = self.config.clone();
        let avg = position.avg_entry_price;
        let leverage = position.leverage;
        let pnl = position.unrealized_pnl_percent;
        let slice = view.entry_slice_usd;
        let portfolio = view.available_capital;
        let min_size = view.ledger.contract().map_or(0.0, |spec| spec.min_size);
        let initial_size = position.first_order().map_or(0.0, |o| o.size);
        let last_price = position.last_order().map_or(avg, |o| o.avg_price);

        if let Some(margin_before) = self.pending_top_up.take() {
            let gained = margin_before - position.margin;
            if gained > 0.0 {
                return Some(self.open(Notional::Usd(gained / c.top_up_divisor), "lev"));
            }
        }

        if c.stop_loss_percent > 0.0 && pnl < -c.stop_loss_percent {
            return Some(self.close_all("loss"));
        }

        if c.lever_reduce_percent > 0.0
            && pnl < -c.lever_reduce_percent
            && leverage > c.min_reduce_leverage
        {
            return Some(OrderIntent::SetLeverage {
                leverage: leverage - 1.0,
            });
        }

        let peak = if price < avg {
            price
        } else {
            self.peak.map_or(price, |p| p.max(price))
        };
        self.peak = Some(peak);

        let buying_power = view
            .ledger
            .convert_usd_to_size(price, slice * leverage)
            .unwrap_or(0.0);
        if buying_power > min_size {
            let dip = c.buy_low_ratio * c.multiplier;
            if price < avg * dip && price < last_price * dip {
                if slice < portfolio {
                    return Some(self.open(Notional::EntrySlice, "buylow"));
                }
                debug!(strategy = %self.name, slice, portfolio, "buy low exceeds portfolio");
            }

            if price < peak * c.buy_high_pullback * c.multiplier && price > avg * c.buy_high_floor {
                if slice < portfolio {
                    let amount = position.margin * c.buy_high_fraction;
                    return Some(self.open(Notional::Usd(amount), "buyhigh"));
                }
                debug!(strategy = %self.name, slice, portfolio, "buy high exceeds portfolio");
            }
        }

        if pnl > c.take_profit_percent && price > last_price * c.take_profit_ratio * c.multiplier {
            let excess = (position.size - initial_size) / c.take_profit_divisor;
            let reduce_by = view
                .ledger
                .contract()
                .map_or(excess.floor(), |spec| spec.round_down_to_step(excess));
            if reduce_by > min_size {
                return Some(self.close(reduce_by, "tp"));
            }
        }

        let last_dca = position
            .open_orders()
            .filter(|o| o.client_order_id.starts_with(DCA_TAG))
            .last()
            .map(|o| o.timestamp);
        let dca_due = last_dca.is_none_or(|t| (now - t).num_minutes() > c.dca_spacing_minutes);
        if price > avg * c.dca_ratio && dca_due {
            let mut amount = slice;
            if slice > 0.0 && 1.0 - position.margin / slice > 0.1 {
                amount = position.margin * c.dca_margin_fraction;
            }
            if amount < portfolio {
                return Some(self.open(Notional::Usd(amount), DCA_TAG));
            }
        }

        if price > avg * c.ladder_ratio * c.multiplier
            && leverage < c.ladder_max_leverage
            && self
                .last_lever_increase
                .is_none_or(|last| price > last * c.ladder_spacing)
        {
            self.last_lever_increase = Some(price);
            self.pending_top_up = Some(position.margin);
            return Some(OrderIntent::SetLeverage {
                leverage: leverage + c.ladder_step,
            });
        }

        if leverage >= c.deleverage_leverage && price < avg * c.breakeven_ratio {
            return Some(self.close_all("reduce"));
        }

        if position.size > initial_size
            && price < avg * c.breakeven_ratio
            && peak > avg * c.scale_back_peak_ratio
        {
            let excess = position.size - initial_size;
            if excess > 0.0 {
                return Some(self.close(excess, "reduce"));
            }
        }

        None
    }
}

impl Strategy for LadderStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn decide(
        &mut self,
        snapshot: &MarketSnapshot,
        _previous: Option<&MarketSnapshot>,
        view: &LedgerView<'_>,
    ) -> Option<OrderIntent> {
        match view.position() {
            None => {
                self.reset_session();
                self.enter(view)
            }
            Some(position) => self.manage(snapshot.price, snapshot.timestamp, position, view),
        }
    }

    fn on_position_closed(&mut self, _closed: &ClosedPosition) {
        self.reset_session();
    }
}
