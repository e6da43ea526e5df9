//! Exchange-backed ledger.
//!
//! Wraps a [`Ledger`] so every transition is priced locally, executed on the
//! exchange, and only then recorded with the exchange's own figures. A failed
//! or unconfirmed exchange call leaves the local ledger untouched. Nothing is
//! retried here.

use std::thread;
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use crate::domain::error::LedgerError;
use crate::domain::ledger::{CloseOutcome, Ledger, LeverageChange};
use crate::domain::order::{Direction, Order};
use crate::ports::exchange_port::{ExchangeGateway, Fill};

const MARGIN_EPSILON: f64 = 1e-9;

/// How long and how closely to wait for the exchange to report a margin
/// change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconcilePolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Accepted relative difference between expected and reported margin.
    pub margin_tolerance: f64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        ReconcilePolicy {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
            margin_tolerance: 0.01,
        }
    }
}

impl ReconcilePolicy {
    fn accepts(&self, expected: f64, reported: f64) -> bool {
        let scale = expected.abs().max(1.0);
        (reported - expected).abs() <= self.margin_tolerance * scale
    }
}

pub struct LiveLedger<G: ExchangeGateway> {
    ledger: Ledger,
    gateway: G,
    policy: ReconcilePolicy,
}

impl<G: ExchangeGateway> LiveLedger<G> {
    pub fn new(ledger: Ledger, gateway: G, policy: ReconcilePolicy) -> Self {
        LiveLedger {
            ledger,
            gateway,
            policy,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn into_parts(self) -> (Ledger, G) {
        (self.ledger, self.gateway)
    }

    pub fn mark(&mut self, price: f64, time: NaiveDateTime) {
        self.ledger.mark(price, time);
    }

    /// Places the open on the exchange and records the confirmed fill.
    pub fn open_order(
        &mut self,
        direction: Direction,
        amount_usd: f64,
        client_order_id: Option<&str>,
    ) -> Result<Option<Order>, LedgerError> {
        let Some(mut pending) = self
            .ledger
            .prepare_open(direction, amount_usd, client_order_id)?
        else {
            return Ok(None);
        };
        let fill = self
            .gateway
            .place_order(direction, pending.size, &pending.client_order_id)?;
        check_fill(&fill)?;
        debug!(
            id = %pending.client_order_id,
            planned_size = pending.size,
            planned_price = pending.price,
            fill_size = fill.size,
            fill_price = fill.price,
            "open filled"
        );
        pending.size = fill.size;
        pending.price = fill.price;
        pending.fee = fill.fee;
        Ok(Some(self.ledger.commit_open(pending)))
    }

    /// Closes `size` on the exchange and records the confirmed fill.
    pub fn close_order(
        &mut self,
        size: f64,
        client_order_id: Option<&str>,
    ) -> Result<CloseOutcome, LedgerError> {
        let mut pending = self.ledger.prepare_close(size, client_order_id, false)?;
        let fill = self.gateway.close_position(
            pending.direction,
            pending.size,
            &pending.client_order_id,
        )?;
        check_fill(&fill)?;
        pending.size = fill.size.min(pending.size);
        pending.price = fill.price;
        pending.fee = fill.fee;
        self.ledger.commit_close(pending)
    }

    /// Changes leverage on the exchange, moves the margin difference and
    /// waits until the exchange reports the expected margin.
    ///
    /// On timeout the local leverage and margin keep their previous values.
    pub fn set_leverage(
        &mut self,
        leverage: f64,
        available_capital: f64,
    ) -> Result<LeverageChange, LedgerError> {
        let Some(plan) = self.ledger.plan_leverage(leverage, available_capital)? else {
            return Ok(LeverageChange::Unchanged);
        };
        self.gateway.set_leverage(plan.target)?;

        let (Some(current), Some(expected)) = (plan.current_margin, plan.new_margin) else {
            return Ok(self.ledger.apply_leverage(&plan, None));
        };
        let delta = expected - current;
        if delta.abs() > MARGIN_EPSILON {
            self.gateway.transfer_margin(delta)?;
        }
        let confirmed = self.await_margin(expected)?;
        Ok(self.ledger.apply_leverage(&plan, Some(confirmed)))
    }

    fn await_margin(&mut self, expected: f64) -> Result<f64, LedgerError> {
        let started = Instant::now();
        loop {
            if let Some(position) = self.gateway.position_snapshot()? {
                if self.policy.accepts(expected, position.margin) {
                    info!(expected, reported = position.margin, "margin confirmed");
                    return Ok(position.margin);
                }
                debug!(expected, reported = position.margin, "margin not settled yet");
            }
            let waited = started.elapsed();
            if waited >= self.policy.timeout {
                warn!(
                    expected,
                    waited_ms = waited.as_millis() as u64,
                    "exchange margin not confirmed"
                );
                return Err(LedgerError::ExchangeReconciliationTimeout {
                    operation: "set_leverage".to_string(),
                    waited_ms: waited.as_millis(),
                });
            }
            thread::sleep(self.policy.poll_interval);
        }
    }
}

fn check_fill(fill: &Fill) -> Result<(), LedgerError> {
    if !fill.size.is_finite() || fill.size <= 0.0 {
        return Err(LedgerError::Exchange {
            reason: format!("fill size {} is not positive", fill.size),
        });
    }
    if !fill.price.is_finite() || fill.price <= 0.0 {
        return Err(LedgerError::Exchange {
            reason: format!("fill price {} is not positive", fill.price),
        });
    }
    if !fill.fee.is_finite() {
        return Err(LedgerError::Exchange {
            reason: "fill fee is not finite".to_string(),
        });
    }
    Ok(())
}
