//! Domain error types.

/// A parse error with position information for rule parsing.
#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// Errors raised by the position ledger and the live exchange wrapper.
///
/// Only the configuration class ([`LedgerError::is_fatal`]) aborts a run. Every
/// other variant is caller misuse or a capital/exchange condition that skips
/// the current order attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("contract configuration error: {reason}")]
    Configuration { reason: String },

    #[error("contract spec not set")]
    ContractSpecMissing,

    #[error("cannot open {requested} while a {open} position is open")]
    DirectionConflict { open: String, requested: String },

    #[error("leverage not set")]
    LeverageNotSet,

    #[error("cannot close {requested} of {open} open")]
    OversizeClose { requested: f64, open: f64 },

    #[error("no position open")]
    NoPosition,

    #[error("invalid order size {size}")]
    InvalidSize { size: f64 },

    #[error("no mark price available")]
    NoMarkPrice,

    #[error("duplicate client order id {id}")]
    DuplicateOrderId { id: String },

    #[error("insufficient capital: need {required:.4}, have {available:.4}")]
    InsufficientCapital { required: f64, available: f64 },

    #[error("exchange did not confirm {operation} within {waited_ms}ms")]
    ExchangeReconciliationTimeout { operation: String, waited_ms: u128 },

    #[error("exchange error: {reason}")]
    Exchange { reason: String },
}

impl LedgerError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::Configuration { .. } | LedgerError::ContractSpecMissing
        )
    }
}

/// Top-level error type for perptrader.
#[derive(Debug, thiserror::Error)]
pub enum PerpError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    RuleParse(#[from] ParseError),

    #[error("invalid rule: {reason}")]
    RuleInvalid { reason: String },

    #[error("feed error in {source_name}: {reason}")]
    Feed { source_name: String, reason: String },

    #[error("no market data in {source_name}")]
    NoData { source_name: String },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&PerpError> for std::process::ExitCode {
    fn from(err: &PerpError) -> Self {
        let code: u8 = match err {
            PerpError::Io(_) => 1,
            PerpError::ConfigParse { .. }
            | PerpError::ConfigMissing { .. }
            | PerpError::ConfigInvalid { .. } => 2,
            PerpError::Database { .. } | PerpError::DatabaseQuery { .. } => 3,
            PerpError::RuleParse(_) | PerpError::RuleInvalid { .. } => 4,
            PerpError::Feed { .. } | PerpError::NoData { .. } => 5,
            PerpError::Ledger(_) => 6,
        };
        std::process::ExitCode::from(code)
    }
}
