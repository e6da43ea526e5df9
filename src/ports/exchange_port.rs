//! Exchange order gateway port trait, used by the live ledger only.

use crate::domain::error::LedgerError;
use crate::domain::order::Direction;

/// Exchange-confirmed execution figures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub price: f64,
    pub size: f64,
    /// Signed, negative is a cost.
    pub fee: f64,
}

/// Position as the exchange reports it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangePosition {
    pub direction: Direction,
    pub size: f64,
    pub avg_entry_price: f64,
    pub leverage: f64,
    pub margin: f64,
}

pub trait ExchangeGateway {
    fn place_order(
        &mut self,
        direction: Direction,
        size: f64,
        client_order_id: &str,
    ) -> Result<Fill, LedgerError>;

    fn close_position(
        &mut self,
        direction: Direction,
        size: f64,
        client_order_id: &str,
    ) -> Result<Fill, LedgerError>;

    fn set_leverage(&mut self, leverage: f64) -> Result<(), LedgerError>;

    /// Moves isolated margin in or out of the position; positive adds.
    fn transfer_margin(&mut self, amount: f64) -> Result<(), LedgerError>;

    fn position_snapshot(&mut self) -> Result<Option<ExchangePosition>, LedgerError>;
}
