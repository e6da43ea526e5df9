//! Leveraged position ledger.
//!
//! Owns at most one open [`Position`] for a strategy on one instrument and the
//! archive of its [`ClosedPosition`]s. Every public operation validates first
//! and only then mutates, so a returned error leaves the ledger untouched.
//!
//! Operations are split into a `prepare_*`/`plan_*` half that validates and
//! prices the transition, and a `commit_*`/`apply_*` half that records it. The
//! backtest path commits the prepared figures directly; the live path swaps in
//! exchange-confirmed figures before committing.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::domain::contract::ContractSpec;
use crate::domain::error::LedgerError;
use crate::domain::order::{Direction, Order, OrderSide};
use crate::domain::position::{ClosedPosition, Position};

const SIZE_EPSILON: f64 = 1e-9;
const LEVERAGE_EPSILON: f64 = 1e-12;

/// Safety buffers applied to margin moves on leverage changes.
///
/// These are a heuristic buffer against price drift between the decision and
/// the exchange applying it, not an accounting identity. `exact()` disables
/// them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LedgerConfig {
    /// Fraction of the theoretically freed margin actually released on a
    /// leverage increase.
    pub margin_release_factor: f64,
    /// Multiplier on the margin required after a leverage decrease.
    pub margin_topup_factor: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            margin_release_factor: 0.98,
            margin_topup_factor: 1.014,
        }
    }
}

impl LedgerConfig {
    pub fn exact() -> Self {
        LedgerConfig {
            margin_release_factor: 1.0,
            margin_topup_factor: 1.0,
        }
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if !(self.margin_release_factor > 0.0 && self.margin_release_factor <= 1.0) {
            return Err(LedgerError::Configuration {
                reason: format!(
                    "margin_release_factor must be in (0, 1], got {}",
                    self.margin_release_factor
                ),
            });
        }
        if !(self.margin_topup_factor.is_finite() && self.margin_topup_factor >= 1.0) {
            return Err(LedgerError::Configuration {
                reason: format!(
                    "margin_topup_factor must be at least 1, got {}",
                    self.margin_topup_factor
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LeverageChange {
    Unchanged,
    /// `margin_delta` is positive when margin was added to the position and
    /// negative when it was released.
    Applied {
        previous: Option<f64>,
        current: f64,
        margin_delta: f64,
    },
}

impl LeverageChange {
    pub fn is_applied(&self) -> bool {
        matches!(self, LeverageChange::Applied { .. })
    }

    pub fn margin_delta(&self) -> f64 {
        match self {
            LeverageChange::Unchanged => 0.0,
            LeverageChange::Applied { margin_delta, .. } => *margin_delta,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseOutcome {
    pub order: Order,
    /// Set when this fill brought the position size to zero.
    pub closed: Option<ClosedPosition>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingOpen {
    pub direction: Direction,
    pub size: f64,
    pub price: f64,
    pub fee: f64,
    pub leverage: f64,
    pub amount_usd: f64,
    pub unit_factor: f64,
    pub client_order_id: String,
    pub time: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PendingClose {
    pub direction: Direction,
    pub size: f64,
    pub price: f64,
    pub fee: f64,
    pub unit_factor: f64,
    pub client_order_id: String,
    pub time: NaiveDateTime,
    pub liquidation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LeveragePlan {
    pub previous: Option<f64>,
    pub target: f64,
    /// Margin the open position should carry afterwards; `None` when flat.
    pub new_margin: Option<f64>,
    pub current_margin: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    symbol: String,
    contract: Option<ContractSpec>,
    config: LedgerConfig,
    leverage: Option<f64>,
    mark: Option<(f64, NaiveDateTime)>,
    position: Option<Position>,
    closed: Vec<ClosedPosition>,
    profit_usd: f64,
    order_seq: u64,
    used_ids: HashSet<String>,
}

impl Ledger {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_config(symbol, LedgerConfig::default())
    }

    pub fn with_config(symbol: impl Into<String>, config: LedgerConfig) -> Self {
        Ledger {
            symbol: symbol.into(),
            contract: None,
            config,
            leverage: None,
            mark: None,
            position: None,
            closed: Vec::new(),
            profit_usd: 0.0,
            order_seq: 0,
            used_ids: HashSet::new(),
        }
    }

    /// Ledger with its contract spec already installed.
    pub fn with_contract(
        symbol: impl Into<String>,
        spec: ContractSpec,
        config: LedgerConfig,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let mut ledger = Self::with_config(symbol, config);
        ledger.set_contract_spec(spec)?;
        Ok(ledger)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn contract(&self) -> Option<&ContractSpec> {
        self.contract.as_ref()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn leverage(&self) -> Option<f64> {
        self.leverage
    }

    pub fn price(&self) -> Option<f64> {
        self.mark.map(|(price, _)| price)
    }

    pub fn time(&self) -> Option<NaiveDateTime> {
        self.mark.map(|(_, time)| time)
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn has_position(&self) -> bool {
        self.position.is_some()
    }

    pub fn closed_positions(&self) -> &[ClosedPosition] {
        &self.closed
    }

    pub fn last_closed(&self) -> Option<&ClosedPosition> {
        self.closed.last()
    }

    /// Every fee and every close's gross PnL booked so far.
    pub fn profit_usd(&self) -> f64 {
        self.profit_usd
    }

    pub fn margin_in_use(&self) -> f64 {
        self.position.as_ref().map_or(0.0, |p| p.margin)
    }

    pub fn available_capital(&self, start_capital: f64) -> f64 {
        start_capital + self.profit_usd - self.margin_in_use()
    }

    pub fn set_contract_spec(&mut self, spec: ContractSpec) -> Result<(), LedgerError> {
        spec.validate()?;
        match &self.contract {
            Some(existing) if *existing == spec => Ok(()),
            Some(_) => Err(LedgerError::Configuration {
                reason: format!("conflicting contract spec for {}", self.symbol),
            }),
            None => {
                self.contract = Some(spec);
                Ok(())
            }
        }
    }

    /// Records the latest price and refreshes the open position's
    /// mark-to-market figures and extrema.
    pub fn mark(&mut self, price: f64, time: NaiveDateTime) {
        if !price.is_finite() || price <= 0.0 {
            warn!(symbol = %self.symbol, price, %time, "ignoring invalid mark price");
            return;
        }
        self.mark = Some((price, time));
        if let Some(position) = self.position.as_mut() {
            position.track_extrema(price);
        }
        self.refresh_unrealized();
    }

    pub fn is_liquidatable(&self) -> bool {
        self.position
            .as_ref()
            .is_some_and(|p| p.margin > 0.0 && p.unrealized_pnl_usd <= -p.margin)
    }

    pub fn set_leverage(
        &mut self,
        leverage: f64,
        available_capital: f64,
    ) -> Result<LeverageChange, LedgerError> {
        match self.plan_leverage(leverage, available_capital)? {
            Some(plan) => Ok(self.apply_leverage(&plan, None)),
            None => Ok(LeverageChange::Unchanged),
        }
    }

    pub(crate) fn plan_leverage(
        &self,
        leverage: f64,
        available_capital: f64,
    ) -> Result<Option<LeveragePlan>, LedgerError> {
        let contract = self.contract.as_ref().ok_or(LedgerError::ContractSpecMissing)?;
        if !leverage.is_finite() || leverage < 1.0 {
            debug!(symbol = %self.symbol, leverage, "leverage below 1 ignored");
            return Ok(None);
        }
        let target = contract.clamp_leverage(leverage);
        if self
            .leverage
            .is_some_and(|current| (current - target).abs() < LEVERAGE_EPSILON)
        {
            return Ok(None);
        }

        let Some(position) = self.position.as_ref() else {
            return Ok(Some(LeveragePlan {
                previous: self.leverage,
                target,
                new_margin: None,
                current_margin: None,
            }));
        };

        let margin = position.margin;
        let ratio = target / position.leverage;
        let new_margin = if ratio > 1.0 {
            let released = (margin - margin / ratio) * self.config.margin_release_factor;
            margin - released
        } else {
            let required = margin / ratio * self.config.margin_topup_factor;
            let increase = required - margin;
            if increase > available_capital {
                debug!(
                    symbol = %self.symbol,
                    increase,
                    available_capital,
                    "not enough capital to lower leverage"
                );
                return Err(LedgerError::InsufficientCapital {
                    required: increase,
                    available: available_capital,
                });
            }
            margin + increase
        };

        Ok(Some(LeveragePlan {
            previous: self.leverage,
            target,
            new_margin: Some(new_margin),
            current_margin: Some(margin),
        }))
    }

    /// Records a planned leverage change. `confirmed_margin` replaces the
    /// planned margin with the figure the exchange reported.
    pub(crate) fn apply_leverage(
        &mut self,
        plan: &LeveragePlan,
        confirmed_margin: Option<f64>,
    ) -> LeverageChange {
        let mut margin_delta = 0.0;
        if let (Some(position), Some(planned)) = (self.position.as_mut(), plan.new_margin) {
            let margin = confirmed_margin.unwrap_or(planned);
            margin_delta = margin - position.margin;
            position.margin = margin;
            position.leverage = plan.target;
        }
        self.leverage = Some(plan.target);
        self.refresh_unrealized();
        info!(
            symbol = %self.symbol,
            previous = ?plan.previous,
            current = plan.target,
            margin_delta,
            "leverage changed"
        );
        LeverageChange::Applied {
            previous: plan.previous,
            current: plan.target,
            margin_delta,
        }
    }

    /// Opens or adds to a position worth `amount_usd` of margin at the current
    /// leverage. `Ok(None)` when the resulting size is below the instrument
    /// minimum.
    pub fn open_order(
        &mut self,
        direction: Direction,
        amount_usd: f64,
        client_order_id: Option<&str>,
    ) -> Result<Option<Order>, LedgerError> {
        Ok(self
            .prepare_open(direction, amount_usd, client_order_id)?
            .map(|pending| self.commit_open(pending)))
    }

    pub(crate) fn prepare_open(
        &self,
        direction: Direction,
        amount_usd: f64,
        client_order_id: Option<&str>,
    ) -> Result<Option<PendingOpen>, LedgerError> {
        let contract = self.contract.as_ref().ok_or(LedgerError::ContractSpecMissing)?;
        if let Some(position) = &self.position {
            if position.direction != direction {
                return Err(LedgerError::DirectionConflict {
                    open: position.direction.to_string(),
                    requested: direction.to_string(),
                });
            }
        }
        let leverage = self.leverage.ok_or(LedgerError::LeverageNotSet)?;
        let (price, time) = self.mark.ok_or(LedgerError::NoMarkPrice)?;
        if !amount_usd.is_finite() {
            return Err(LedgerError::InvalidSize { size: amount_usd });
        }
        let client_order_id = self.resolve_order_id(client_order_id, "open")?;

        let Some(size) = contract.tradeable_size(amount_usd * leverage, price) else {
            debug!(
                symbol = %self.symbol,
                amount_usd,
                price,
                "open size below instrument minimum"
            );
            return Ok(None);
        };

        Ok(Some(PendingOpen {
            direction,
            size,
            price,
            fee: contract.fee(contract.notional(size, price)),
            leverage,
            amount_usd,
            unit_factor: contract.contract_value * contract.contract_multiplier,
            client_order_id,
            time,
        }))
    }

    pub(crate) fn commit_open(&mut self, pending: PendingOpen) -> Order {
        let notional = pending.size * pending.price * pending.unit_factor;
        let order = Order {
            client_order_id: pending.client_order_id,
            side: OrderSide::Open,
            direction: pending.direction,
            size: pending.size,
            avg_price: pending.price,
            fee: pending.fee,
            margin: notional / pending.leverage,
            leverage: pending.leverage,
            timestamp: pending.time,
            position_avg_entry_price: 0.0,
            brutto_pnl_usd: None,
        };

        let symbol = &self.symbol;
        let position = self.position.get_or_insert_with(|| Position {
            symbol: symbol.clone(),
            direction: pending.direction,
            size: 0.0,
            avg_entry_price: pending.price,
            leverage: pending.leverage,
            margin: 0.0,
            cumulative_fee: 0.0,
            unrealized_pnl_usd: 0.0,
            unrealized_pnl_percent: 0.0,
            orders: Vec::new(),
            highest_price: pending.price,
            lowest_price: pending.price,
            opened_at: pending.time,
            amount_usd: 0.0,
        });

        let avg = position.weighted_open_price_with(pending.price, pending.size);
        let recorded = Order {
            position_avg_entry_price: avg,
            ..order
        };
        position.orders.push(recorded.clone());
        position.size += pending.size;
        position.avg_entry_price = avg;
        position.leverage = pending.leverage;
        position.margin = avg * pending.unit_factor * position.size / pending.leverage;
        position.cumulative_fee += pending.fee;
        position.amount_usd += pending.amount_usd;
        position.track_extrema(pending.price);

        self.profit_usd += pending.fee;
        self.order_seq += 1;
        self.used_ids.insert(recorded.client_order_id.clone());
        self.refresh_unrealized();

        info!(
            symbol = %self.symbol,
            id = %recorded.client_order_id,
            direction = %recorded.direction,
            size = recorded.size,
            price = recorded.avg_price,
            fee = recorded.fee,
            "opened"
        );
        recorded
    }

    /// Closes `size` of the open position at the current mark.
    pub fn close_order(
        &mut self,
        size: f64,
        client_order_id: Option<&str>,
    ) -> Result<CloseOutcome, LedgerError> {
        let pending = self.prepare_close(size, client_order_id, false)?;
        self.commit_close(pending)
    }

    /// Force-closes the whole position at the last mark.
    pub fn liquidate(&mut self) -> Result<CloseOutcome, LedgerError> {
        let size = self
            .position
            .as_ref()
            .map(|p| p.size)
            .ok_or(LedgerError::NoPosition)?;
        let pending = self.prepare_close(size, None, true)?;
        warn!(symbol = %self.symbol, size, price = pending.price, "liquidating position");
        self.commit_close(pending)
    }

    pub(crate) fn prepare_close(
        &self,
        size: f64,
        client_order_id: Option<&str>,
        liquidation: bool,
    ) -> Result<PendingClose, LedgerError> {
        let position = self.position.as_ref().ok_or(LedgerError::NoPosition)?;
        let contract = self.contract.as_ref().ok_or(LedgerError::ContractSpecMissing)?;
        let (price, time) = self.mark.ok_or(LedgerError::NoMarkPrice)?;
        if !size.is_finite() || size <= 0.0 {
            return Err(LedgerError::InvalidSize { size });
        }
        if size > position.size + SIZE_EPSILON {
            return Err(LedgerError::OversizeClose {
                requested: size,
                open: position.size,
            });
        }
        let prefix = if liquidation { "liq" } else { "close" };
        let client_order_id = self.resolve_order_id(client_order_id, prefix)?;
        let size = size.min(position.size);
        Ok(PendingClose {
            direction: position.direction,
            size,
            price,
            fee: contract.fee(contract.notional(size, price)),
            unit_factor: contract.contract_value * contract.contract_multiplier,
            client_order_id,
            time,
            liquidation,
        })
    }

    pub(crate) fn commit_close(&mut self, pending: PendingClose) -> Result<CloseOutcome, LedgerError> {
        let position = self.position.as_mut().ok_or(LedgerError::NoPosition)?;
        let avg = position.avg_entry_price;
        let leverage = position.leverage;
        let price_move = match position.direction {
            Direction::Long => pending.price - avg,
            Direction::Short => avg - pending.price,
        };
        let brutto = price_move * pending.size * pending.unit_factor;

        let order = Order {
            client_order_id: pending.client_order_id,
            side: OrderSide::Close,
            direction: position.direction,
            size: pending.size,
            avg_price: pending.price,
            fee: pending.fee,
            margin: pending.size * avg * pending.unit_factor / leverage,
            leverage,
            timestamp: pending.time,
            position_avg_entry_price: avg,
            brutto_pnl_usd: Some(brutto),
        };

        position.orders.push(order.clone());
        position.size -= pending.size;
        if position.size < SIZE_EPSILON {
            position.size = 0.0;
        }
        position.cumulative_fee += pending.fee;
        position.margin = avg * pending.unit_factor * position.size / leverage;
        let flat = position.size == 0.0;

        self.profit_usd += brutto + pending.fee;
        self.order_seq += 1;
        self.used_ids.insert(order.client_order_id.clone());

        info!(
            symbol = %self.symbol,
            id = %order.client_order_id,
            size = order.size,
            price = order.avg_price,
            brutto,
            fee = order.fee,
            "closed"
        );

        let closed = match self.position.take() {
            Some(position) if flat => {
                let closed =
                    ClosedPosition::from_position(position, pending.time, pending.liquidation);
                info!(
                    symbol = %self.symbol,
                    realized_pnl_usd = closed.realized_pnl_usd,
                    realized_pnl_percent = closed.realized_pnl_percent,
                    liquidated = closed.is_liquidated,
                    "position closed"
                );
                self.closed.push(closed.clone());
                Some(closed)
            }
            still_open => {
                self.position = still_open;
                self.refresh_unrealized();
                None
            }
        };

        Ok(CloseOutcome { order, closed })
    }

    pub fn convert_usd_to_size(&self, price: f64, amount_usd: f64) -> Result<f64, LedgerError> {
        let contract = self.contract.as_ref().ok_or(LedgerError::ContractSpecMissing)?;
        Ok(contract.size_for_usd(amount_usd, price))
    }

    pub fn contract_usd_value(&self, price: f64) -> Result<f64, LedgerError> {
        let contract = self.contract.as_ref().ok_or(LedgerError::ContractSpecMissing)?;
        Ok(contract.unit_value(price))
    }

    /// Price at which closing `size` of the open position books a gross `pnl`.
    pub fn price_for_pnl(&self, pnl: f64, size: f64) -> Result<f64, LedgerError> {
        let contract = self.contract.as_ref().ok_or(LedgerError::ContractSpecMissing)?;
        let position = self.position.as_ref().ok_or(LedgerError::NoPosition)?;
        Ok(contract.price_for_pnl(position.direction, position.avg_entry_price, pnl, size))
    }

    fn resolve_order_id(&self, requested: Option<&str>, prefix: &str) -> Result<String, LedgerError> {
        match requested {
            Some(id) if self.used_ids.contains(id) => {
                Err(LedgerError::DuplicateOrderId { id: id.to_string() })
            }
            Some(id) => Ok(id.to_string()),
            None => {
                let mut seq = self.order_seq + 1;
                loop {
                    let id = format!("{prefix}-{seq}");
                    if !self.used_ids.contains(&id) {
                        return Ok(id);
                    }
                    seq += 1;
                }
            }
        }
    }

    fn refresh_unrealized(&mut self) {
        let (Some(contract), Some(position), Some((price, _))) =
            (self.contract.as_ref(), self.position.as_mut(), self.mark)
        else {
            return;
        };
        let brutto = contract.gross_pnl(
            position.direction,
            position.avg_entry_price,
            price,
            position.size,
        );
        position.unrealized_pnl_usd = brutto + position.cumulative_fee;
        position.unrealized_pnl_percent = if position.margin > 0.0 {
            position.unrealized_pnl_usd / position.margin * 100.0
        } else {
            0.0
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn at(min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, min, 0)
            .unwrap()
    }

    fn xrp_swap() -> ContractSpec {
        ContractSpec {
            min_size: 1.0,
            size_step: 1.0,
            contract_value: 100.0,
            contract_multiplier: 1.0,
            max_leverage: 75.0,
            fee_rate: 0.0005,
        }
    }

    fn xrp_ledger() -> Ledger {
        let mut ledger =
            Ledger::with_contract("XRP-USDT-SWAP", xrp_swap(), LedgerConfig::default()).unwrap();
        ledger.mark(0.50172, at(0));
        ledger.set_leverage(5.0, 1000.0).unwrap();
        ledger
    }

    fn assert_margin_identity(ledger: &Ledger) {
        let pos = ledger.position().unwrap();
        let expected = pos.avg_entry_price * pos.size * 100.0 / pos.leverage;
        assert_relative_eq!(pos.margin, expected, epsilon = 1e-9);
    }

    #[test]
    fn scenario_a_first_open() {
        let mut ledger = xrp_ledger();
        let order = ledger
            .open_order(Direction::Long, 45.0, Some("first"))
            .unwrap()
            .unwrap();
        assert_relative_eq!(order.size, 4.0);
        assert_relative_eq!(order.fee, -0.100344, epsilon = 1e-9);
        assert_relative_eq!(order.margin, 40.1376, epsilon = 1e-9);
        let pos = ledger.position().unwrap();
        assert_relative_eq!(pos.margin, 40.1376, epsilon = 1e-9);
        assert_relative_eq!(pos.avg_entry_price, 0.50172, epsilon = 1e-12);
        assert_relative_eq!(pos.amount_usd, 45.0);
        assert_margin_identity(&ledger);
    }

    #[test]
    fn scenario_b_add_to_position() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        ledger.mark(0.50175, at(1));
        let order = ledger
            .open_order(Direction::Long, 65.0, None)
            .unwrap()
            .unwrap();
        assert_relative_eq!(order.size, 6.0);
        assert_relative_eq!(order.fee, -0.150525, epsilon = 1e-9);
        assert_relative_eq!(order.position_avg_entry_price, 0.501738, epsilon = 1e-9);
        let pos = ledger.position().unwrap();
        assert_relative_eq!(pos.size, 10.0);
        assert_relative_eq!(pos.cumulative_fee, -0.250869, epsilon = 1e-9);
        assert_relative_eq!(pos.margin, 100.3476, epsilon = 1e-9);
        assert_margin_identity(&ledger);
    }

    #[test]
    fn scenario_c_and_d_partial_then_full_close() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        ledger.mark(0.50175, at(1));
        ledger.open_order(Direction::Long, 65.0, None).unwrap();

        ledger.mark(0.50174, at(2));
        let outcome = ledger.close_order(6.0, Some("tp")).unwrap();
        assert!(outcome.closed.is_none());
        assert_relative_eq!(outcome.order.brutto_pnl_usd.unwrap(), 0.0012, epsilon = 1e-9);
        assert_relative_eq!(outcome.order.fee, -0.150522, epsilon = 1e-9);
        let pos = ledger.position().unwrap();
        assert_relative_eq!(pos.size, 4.0);
        assert_relative_eq!(pos.margin, 40.13904, epsilon = 1e-9);
        assert_relative_eq!(pos.cumulative_fee, -0.401391, epsilon = 1e-9);
        assert_margin_identity(&ledger);

        ledger.mark(0.50148, at(3));
        let outcome = ledger.close_order(4.0, None).unwrap();
        assert_relative_eq!(outcome.order.brutto_pnl_usd.unwrap(), -0.1032, epsilon = 1e-9);
        assert_relative_eq!(outcome.order.fee, -0.100296, epsilon = 1e-9);
        let closed = outcome.closed.unwrap();
        assert_relative_eq!(closed.realized_pnl_usd, -0.603687, epsilon = 1e-9);
        assert_relative_eq!(closed.cumulative_fee, -0.501687, epsilon = 1e-9);
        assert_relative_eq!(
            closed.realized_pnl_percent,
            -0.603687 / 100.3476 * 100.0,
            epsilon = 1e-9
        );
        assert_eq!(closed.closed_at, at(3));
        assert!(!closed.is_liquidated);
        assert!(ledger.position().is_none());
        assert_eq!(ledger.closed_positions().len(), 1);
        assert_relative_eq!(ledger.profit_usd(), -0.603687, epsilon = 1e-9);
        assert_relative_eq!(ledger.available_capital(1000.0), 999.396313, epsilon = 1e-9);
    }

    #[test]
    fn round_trip_at_same_price_realizes_fees() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Short, 45.0, None).unwrap();
        let outcome = ledger.close_order(4.0, None).unwrap();
        let closed = outcome.closed.unwrap();
        assert_relative_eq!(closed.realized_pnl_usd, closed.cumulative_fee, epsilon = 1e-12);
        assert!(closed.realized_pnl_usd < 0.0);
    }

    #[test]
    fn below_minimum_is_not_executed() {
        let mut ledger = xrp_ledger();
        assert_eq!(ledger.open_order(Direction::Long, 5.0, None).unwrap(), None);
        assert!(ledger.position().is_none());
        assert_relative_eq!(ledger.profit_usd(), 0.0);
    }

    #[test]
    fn open_preconditions() {
        let mut ledger = Ledger::new("XRP-USDT-SWAP");
        assert_eq!(
            ledger.open_order(Direction::Long, 45.0, None),
            Err(LedgerError::ContractSpecMissing)
        );
        ledger.set_contract_spec(xrp_swap()).unwrap();
        assert_eq!(
            ledger.open_order(Direction::Long, 45.0, None),
            Err(LedgerError::LeverageNotSet)
        );
        ledger.set_leverage(5.0, 0.0).unwrap();
        assert_eq!(
            ledger.open_order(Direction::Long, 45.0, None),
            Err(LedgerError::NoMarkPrice)
        );
    }

    #[test]
    fn direction_conflict_leaves_state_unchanged() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        let before = ledger.position().cloned();
        let err = ledger.open_order(Direction::Short, 45.0, None).unwrap_err();
        assert!(matches!(err, LedgerError::DirectionConflict { .. }));
        assert_eq!(ledger.position().cloned(), before);
    }

    #[test]
    fn duplicate_client_order_id_rejected() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, Some("a")).unwrap();
        assert_eq!(
            ledger.open_order(Direction::Long, 45.0, Some("a")),
            Err(LedgerError::DuplicateOrderId { id: "a".into() })
        );
        assert_eq!(
            ledger.close_order(1.0, Some("a")).unwrap_err(),
            LedgerError::DuplicateOrderId { id: "a".into() }
        );
    }

    #[test]
    fn generated_ids_skip_used_ones() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, Some("open-2")).unwrap();
        let order = ledger.open_order(Direction::Long, 45.0, None).unwrap().unwrap();
        assert_eq!(order.client_order_id, "open-3");
    }

    #[test]
    fn close_errors() {
        let mut ledger = xrp_ledger();
        assert_eq!(ledger.close_order(1.0, None).unwrap_err(), LedgerError::NoPosition);
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        assert_eq!(
            ledger.close_order(5.0, None).unwrap_err(),
            LedgerError::OversizeClose {
                requested: 5.0,
                open: 4.0
            }
        );
        assert!(matches!(
            ledger.close_order(0.0, None),
            Err(LedgerError::InvalidSize { .. })
        ));
        assert!(matches!(
            ledger.close_order(f64::NAN, None),
            Err(LedgerError::InvalidSize { .. })
        ));
        assert_relative_eq!(ledger.position().unwrap().size, 4.0);
    }

    #[test]
    fn contract_spec_conflict_is_configuration_error() {
        let mut ledger = xrp_ledger();
        assert!(ledger.set_contract_spec(xrp_swap()).is_ok());
        let other = ContractSpec {
            contract_value: 10.0,
            ..xrp_swap()
        };
        let err = ledger.set_contract_spec(other).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn mark_ignores_invalid_prices() {
        let mut ledger = xrp_ledger();
        ledger.mark(-1.0, at(5));
        ledger.mark(f64::NAN, at(5));
        assert_eq!(ledger.price(), Some(0.50172));
        assert_eq!(ledger.time(), Some(at(0)));
    }

    #[test]
    fn mark_updates_unrealized_and_extrema() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        ledger.mark(0.55, at(1));
        ledger.mark(0.45, at(2));
        ledger.mark(0.52, at(3));
        let pos = ledger.position().unwrap();
        assert_relative_eq!(pos.highest_price, 0.55);
        assert_relative_eq!(pos.lowest_price, 0.45);
        let brutto = (0.52 - 0.50172) * 400.0;
        assert_relative_eq!(pos.unrealized_pnl_usd, brutto - 0.100344, epsilon = 1e-9);
        assert_relative_eq!(
            pos.unrealized_pnl_percent,
            (brutto - 0.100344) / 40.1376 * 100.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn set_leverage_same_value_is_idempotent() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        let before = ledger.position().cloned();
        assert_eq!(ledger.set_leverage(5.0, 1000.0).unwrap(), LeverageChange::Unchanged);
        assert_eq!(ledger.position().cloned(), before);
    }

    #[test]
    fn set_leverage_below_one_is_ignored() {
        let mut ledger = xrp_ledger();
        assert_eq!(ledger.set_leverage(0.5, 1000.0).unwrap(), LeverageChange::Unchanged);
        assert_eq!(ledger.leverage(), Some(5.0));
    }

    #[test]
    fn set_leverage_clamps_to_instrument_max() {
        let mut ledger = xrp_ledger();
        ledger.set_leverage(200.0, 1000.0).unwrap();
        assert_eq!(ledger.leverage(), Some(75.0));
    }

    #[test]
    fn leverage_increase_releases_buffered_margin() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        let change = ledger.set_leverage(10.0, 1000.0).unwrap();
        // margin 40.1376 halves; 98% of the freed 20.0688 is released
        let released = 20.0688 * 0.98;
        assert_relative_eq!(change.margin_delta(), -released, epsilon = 1e-9);
        let pos = ledger.position().unwrap();
        assert_relative_eq!(pos.margin, 40.1376 - released, epsilon = 1e-9);
        assert_relative_eq!(pos.leverage, 10.0);
        assert_relative_eq!(
            ledger.available_capital(1000.0),
            1000.0 - 0.100344 - (40.1376 - released),
            epsilon = 1e-9
        );
    }

    #[test]
    fn leverage_decrease_requires_capital() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        let before = ledger.position().cloned();
        // 5x -> 2.5x doubles the margin: 40.1376 * 2 * 1.014 - 40.1376
        let err = ledger.set_leverage(2.5, 10.0).unwrap_err();
        match err {
            LedgerError::InsufficientCapital { required, available } => {
                assert_relative_eq!(required, 40.1376 * 2.0 * 1.014 - 40.1376, epsilon = 1e-9);
                assert_relative_eq!(available, 10.0);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(ledger.position().cloned(), before);
        assert_eq!(ledger.leverage(), Some(5.0));

        let change = ledger.set_leverage(2.5, 100.0).unwrap();
        assert!(change.is_applied());
        assert_relative_eq!(
            ledger.position().unwrap().margin,
            40.1376 * 2.0 * 1.014,
            epsilon = 1e-9
        );
    }

    #[test]
    fn exact_config_keeps_margin_identity_across_leverage_changes() {
        let mut ledger =
            Ledger::with_contract("XRP-USDT-SWAP", xrp_swap(), LedgerConfig::exact()).unwrap();
        ledger.mark(0.5, at(0));
        ledger.set_leverage(5.0, 0.0).unwrap();
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        ledger.set_leverage(9.0, 0.0).unwrap();
        assert_margin_identity(&ledger);
        ledger.set_leverage(3.0, 1000.0).unwrap();
        assert_margin_identity(&ledger);
    }

    #[test]
    fn liquidation_detected_and_flagged() {
        let mut ledger = xrp_ledger();
        ledger.set_leverage(50.0, 1000.0).unwrap();
        ledger.open_order(Direction::Long, 10.0, None).unwrap();
        assert!(!ledger.is_liquidatable());
        ledger.mark(0.48, at(1));
        assert!(ledger.is_liquidatable());
        let outcome = ledger.liquidate().unwrap();
        let closed = outcome.closed.unwrap();
        assert!(closed.is_liquidated);
        assert!(outcome.order.client_order_id.starts_with("liq-"));
        assert!(!ledger.is_liquidatable());
    }

    #[test]
    fn liquidate_without_position() {
        let mut ledger = xrp_ledger();
        assert_eq!(ledger.liquidate().unwrap_err(), LedgerError::NoPosition);
    }

    #[test]
    fn contract_passthroughs() {
        let mut ledger = xrp_ledger();
        assert_relative_eq!(ledger.contract_usd_value(0.5).unwrap(), 50.0);
        assert_relative_eq!(ledger.convert_usd_to_size(0.5, 225.0).unwrap(), 4.5);
        assert_eq!(ledger.price_for_pnl(1.0, 1.0), Err(LedgerError::NoPosition));
        ledger.open_order(Direction::Long, 45.0, None).unwrap();
        assert_relative_eq!(
            ledger.price_for_pnl(4.0, 4.0).unwrap(),
            0.50172 + 0.01,
            epsilon = 1e-12
        );
    }

    #[test]
    fn short_position_pnl_sign() {
        let mut ledger = xrp_ledger();
        ledger.open_order(Direction::Short, 45.0, None).unwrap();
        ledger.mark(0.49, at(1));
        let outcome = ledger.close_order(4.0, None).unwrap();
        assert!(outcome.order.brutto_pnl_usd.unwrap() > 0.0);
    }

    #[test]
    fn ledger_config_validation() {
        assert!(LedgerConfig::default().validate().is_ok());
        assert!(
            LedgerConfig {
                margin_release_factor: 1.5,
                ..LedgerConfig::default()
            }
            .validate()
            .is_err()
        );
        assert!(
            LedgerConfig {
                margin_topup_factor: 0.9,
                ..LedgerConfig::default()
            }
            .validate()
            .is_err()
        );
    }
}
