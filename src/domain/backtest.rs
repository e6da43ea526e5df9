//! Run parameters shared by the harness and the strategies.

/// Capital and risk settings for one session.
///
/// `stop_loss_percent` and `lever_reduce_percent` are loss thresholds in
/// percent of margin, given as positive numbers; zero disables them.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub start_capital: f64,
    /// Entry slicing divisor: one entry uses `available_capital / steps`.
    pub steps: u32,
    /// Scales `SCALE(...)` thresholds in predicates and the ladder triggers.
    pub multiplier: f64,
    pub stop_loss_percent: f64,
    pub lever_reduce_percent: f64,
    /// Leverage applied before each fresh entry.
    pub leverage: f64,
    pub close_at_end: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            start_capital: 250.0,
            steps: 3,
            multiplier: 1.0,
            stop_loss_percent: 80.0,
            lever_reduce_percent: 60.0,
            leverage: 2.0,
            close_at_end: true,
        }
    }
}

impl RunConfig {
    pub fn entry_slice(&self, available_capital: f64) -> f64 {
        if self.steps == 0 {
            return 0.0;
        }
        available_capital / f64::from(self.steps)
    }

    pub fn stop_loss_hit(&self, pnl_percent: f64) -> bool {
        self.stop_loss_percent > 0.0 && pnl_percent < -self.stop_loss_percent
    }

    pub fn lever_reduce_hit(&self, pnl_percent: f64) -> bool {
        self.lever_reduce_percent > 0.0 && pnl_percent < -self.lever_reduce_percent
    }
}
