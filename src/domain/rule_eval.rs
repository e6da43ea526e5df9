//! Rule evaluation engine.
//!
//! Evaluates rules against the current market snapshot, the previous one and
//! the open position's mark-to-market figures.
//!
//! # Evaluation Semantics
//!
//! - Missing values (unknown indicator, no previous snapshot, no position)
//!   resolve to NaN, and every comparison against NaN is `false`
//! - `CROSS_ABOVE`/`CROSS_BELOW`: compare current against previous values;
//!   `false` when there is no previous snapshot
//! - `AND`: Short-circuits on first `false`
//! - `OR`: Short-circuits on first `true`

use chrono::NaiveDateTime;

use crate::domain::position::Position;
use crate::domain::rule::{Operand, PositionField, Rule};
use crate::domain::snapshot::MarketSnapshot;

const EPSILON: f64 = 1e-9;

/// Mark-to-market figures of the open position, as seen by predicates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionMetrics {
    pub pnl_percent: f64,
    pub pnl_usd: f64,
    pub hold_minutes: f64,
    pub leverage: f64,
    pub avg_entry: f64,
    pub highest: f64,
    pub lowest: f64,
    pub margin: f64,
}

impl PositionMetrics {
    pub fn from_position(position: &Position, now: NaiveDateTime) -> Self {
        PositionMetrics {
            pnl_percent: position.unrealized_pnl_percent,
            pnl_usd: position.unrealized_pnl_usd,
            hold_minutes: position.hold_minutes(now),
            leverage: position.leverage,
            avg_entry: position.avg_entry_price,
            highest: position.highest_price,
            lowest: position.lowest_price,
            margin: position.margin,
        }
    }

    fn field(&self, field: PositionField) -> f64 {
        match field {
            PositionField::PnlPercent => self.pnl_percent,
            PositionField::PnlUsd => self.pnl_usd,
            PositionField::HoldMinutes => self.hold_minutes,
            PositionField::Leverage => self.leverage,
            PositionField::AvgEntry => self.avg_entry,
            PositionField::Highest => self.highest,
            PositionField::Lowest => self.lowest,
            PositionField::Margin => self.margin,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub snapshot: &'a MarketSnapshot,
    pub previous: Option<&'a MarketSnapshot>,
    pub position: Option<PositionMetrics>,
    /// Run-level multiplier applied by `SCALE`.
    pub multiplier: f64,
}

impl<'a> EvalContext<'a> {
    pub fn new(snapshot: &'a MarketSnapshot) -> Self {
        EvalContext {
            snapshot,
            previous: None,
            position: None,
            multiplier: 1.0,
        }
    }

    pub fn with_previous(mut self, previous: Option<&'a MarketSnapshot>) -> Self {
        self.previous = previous;
        self
    }

    pub fn with_position(mut self, position: Option<PositionMetrics>) -> Self {
        self.position = position;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Frame {
    Current,
    Previous,
}

pub fn evaluate(rule: &Rule, ctx: &EvalContext<'_>) -> bool {
    match rule {
        Rule::CrossAbove { left, right } => {
            if ctx.previous.is_none() {
                return false;
            }
            let left_curr = resolve_operand(left, ctx, Frame::Current);
            let right_curr = resolve_operand(right, ctx, Frame::Current);
            let left_prev = resolve_operand(left, ctx, Frame::Previous);
            let right_prev = resolve_operand(right, ctx, Frame::Previous);

            left_curr > right_curr && left_prev <= right_prev
        }
        Rule::CrossBelow { left, right } => {
            if ctx.previous.is_none() {
                return false;
            }
            let left_curr = resolve_operand(left, ctx, Frame::Current);
            let right_curr = resolve_operand(right, ctx, Frame::Current);
            let left_prev = resolve_operand(left, ctx, Frame::Previous);
            let right_prev = resolve_operand(right, ctx, Frame::Previous);

            left_curr < right_curr && left_prev >= right_prev
        }
        Rule::Above { left, right } => {
            resolve_operand(left, ctx, Frame::Current) > resolve_operand(right, ctx, Frame::Current)
        }
        Rule::Below { left, right } => {
            resolve_operand(left, ctx, Frame::Current) < resolve_operand(right, ctx, Frame::Current)
        }
        Rule::Between {
            operand,
            lower,
            upper,
        } => {
            let val = resolve_operand(operand, ctx, Frame::Current);
            val >= *lower && val <= *upper
        }
        Rule::Equals { left, right } => {
            let left_val = resolve_operand(left, ctx, Frame::Current);
            let right_val = resolve_operand(right, ctx, Frame::Current);
            (left_val - right_val).abs() < EPSILON
        }
        Rule::And(rules) => rules.iter().all(|r| evaluate(r, ctx)),
        Rule::Or(rules) => rules.iter().any(|r| evaluate(r, ctx)),
        Rule::Not(rule) => !evaluate(rule, ctx),
        Rule::True => true,
        Rule::False => false,
    }
}

/// All predicates of a step hold.
pub fn evaluate_step(step: &[Rule], ctx: &EvalContext<'_>) -> bool {
    step.iter().all(|rule| evaluate(rule, ctx))
}

fn resolve_operand(operand: &Operand, ctx: &EvalContext<'_>, frame: Frame) -> f64 {
    let snapshot = match frame {
        Frame::Current => Some(ctx.snapshot),
        Frame::Previous => ctx.previous,
    };
    match operand {
        Operand::Constant(v) => *v,
        Operand::Price => snapshot.map_or(f64::NAN, |s| s.price),
        Operand::Indicator(ind) => snapshot
            .and_then(|s| s.indicator(&ind.granularity, &ind.field))
            .unwrap_or(f64::NAN),
        // one snapshot back from the frame being resolved
        Operand::Previous(ind) => match frame {
            Frame::Current => ctx
                .previous
                .and_then(|s| s.indicator(&ind.granularity, &ind.field))
                .unwrap_or(f64::NAN),
            Frame::Previous => f64::NAN,
        },
        Operand::Position(field) => ctx.position.map_or(f64::NAN, |p| p.field(*field)),
        Operand::Scaled { operand, factor } => {
            resolve_operand(operand, ctx, frame) * factor * ctx.multiplier
        }
    }
}
