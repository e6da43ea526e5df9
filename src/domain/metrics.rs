//! Run-level performance figures computed from archived positions.

use crate::domain::position::ClosedPosition;

/// Summary of one session's replay.
///
/// Ratios are per closed position, not annualized: each position's realized
/// return on committed margin is one sample.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub symbol: String,
    pub strategy: String,
    pub start_capital: f64,
    pub positions: usize,
    pub wins: usize,
    pub losses: usize,
    pub win_ratio: f64,
    pub total_pnl_usd: f64,
    pub total_pnl_percent: f64,
    pub total_fees_usd: f64,
    /// Fraction of the running equity peak, `0.25` is a 25% drawdown.
    pub max_drawdown: f64,
    pub liquidations: usize,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub profit_factor: f64,
    pub largest_win_usd: f64,
    pub largest_loss_usd: f64,
    pub avg_hold_minutes: f64,
    /// Buy-and-hold return over the replayed price range, in percent.
    pub hodl_percent: f64,
}

impl RunResult {
    pub fn compute(
        symbol: &str,
        strategy: &str,
        start_capital: f64,
        closed: &[ClosedPosition],
        first_price: Option<f64>,
        last_price: Option<f64>,
    ) -> Self {
        let mut wins = 0usize;
        let mut losses = 0usize;
        let mut total_wins = 0.0_f64;
        let mut total_losses = 0.0_f64;
        let mut largest_win = 0.0_f64;
        let mut largest_loss = 0.0_f64;
        let mut total_hold = 0.0_f64;
        let mut total_fees = 0.0_f64;

        for position in closed {
            let pnl = position.realized_pnl_usd;
            if position.is_win() {
                wins += 1;
                total_wins += pnl;
                largest_win = largest_win.max(pnl);
            } else {
                losses += 1;
                total_losses += pnl.abs();
                largest_loss = largest_loss.max(pnl.abs());
            }
            total_hold += position.hold_minutes();
            total_fees += position.cumulative_fee;
        }

        let positions = closed.len();
        let win_ratio = if positions > 0 {
            wins as f64 / positions as f64
        } else {
            0.0
        };

        let total_pnl_usd: f64 = closed.iter().map(|p| p.realized_pnl_usd).sum();
        let total_pnl_percent = if start_capital > 0.0 {
            total_pnl_usd / start_capital * 100.0
        } else {
            0.0
        };

        let equity = equity_curve(start_capital, closed);
        let max_drawdown = compute_drawdown(&equity);

        let returns: Vec<f64> = closed
            .iter()
            .map(|p| p.realized_pnl_percent / 100.0)
            .collect();
        let (sharpe_ratio, sortino_ratio) = compute_risk_adjusted(&returns);

        let calmar_ratio = if max_drawdown > 0.0 {
            (total_pnl_percent / 100.0) / max_drawdown
        } else {
            0.0
        };

        let profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let avg_hold_minutes = if positions > 0 {
            total_hold / positions as f64
        } else {
            0.0
        };

        let hodl_percent = match (first_price, last_price) {
            (Some(first), Some(last)) if first > 0.0 => (last - first) / first * 100.0,
            _ => 0.0,
        };

        RunResult {
            symbol: symbol.to_string(),
            strategy: strategy.to_string(),
            start_capital,
            positions,
            wins,
            losses,
            win_ratio,
            total_pnl_usd,
            total_pnl_percent,
            total_fees_usd: total_fees,
            max_drawdown,
            liquidations: closed.iter().filter(|p| p.is_liquidated).count(),
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            profit_factor,
            largest_win_usd: largest_win,
            largest_loss_usd: largest_loss,
            avg_hold_minutes,
            hodl_percent,
        }
    }
}

/// Equity after each archived position, starting from `start_capital`.
pub fn equity_curve(start_capital: f64, closed: &[ClosedPosition]) -> Vec<f64> {
    let mut equity = Vec::with_capacity(closed.len() + 1);
    equity.push(start_capital);
    let mut running = start_capital;
    for position in closed {
        running += position.realized_pnl_usd;
        equity.push(running);
    }
    equity
}

fn compute_drawdown(equity: &[f64]) -> f64 {
    let Some(&first) = equity.first() else {
        return 0.0;
    };

    let mut peak = first;
    let mut max_dd = 0.0_f64;
    for &value in equity {
        if value > peak {
            peak = value;
        } else if peak > 0.0 {
            max_dd = max_dd.max((peak - value) / peak);
        }
    }
    max_dd
}

fn compute_risk_adjusted(returns: &[f64]) -> (f64, f64) {
    if returns.len() < 2 {
        return (0.0, 0.0);
    }

    let n = returns.len() as f64;
    let mean: f64 = returns.iter().sum::<f64>() / n;
    let variance: f64 = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let stddev = variance.sqrt();

    let sharpe = if stddev > 0.0 { mean / stddev } else { 0.0 };

    let downside: f64 = returns
        .iter()
        .filter(|&&r| r < 0.0)
        .map(|r| r.powi(2))
        .sum::<f64>()
        / n;
    let downside_stddev = downside.sqrt();

    let sortino = if downside_stddev > 0.0 {
        mean / downside_stddev
    } else {
        0.0
    };

    (sharpe, sortino)
}
