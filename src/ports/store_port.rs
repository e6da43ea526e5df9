//! Persistence port trait.

use crate::domain::error::PerpError;
use crate::domain::metrics::RunResult;
use crate::domain::order::Order;
use crate::domain::position::ClosedPosition;

/// Append-only record of what a session did.
///
/// Shared across concurrently running sessions, so implementations take
/// `&self` and must be `Sync`. Each write completes before it returns.
pub trait PersistenceStore: Send + Sync {
    fn write_order(&self, session: &str, order: &Order) -> Result<(), PerpError>;

    fn write_closed_position(
        &self,
        session: &str,
        position: &ClosedPosition,
    ) -> Result<(), PerpError>;

    fn write_result(&self, session: &str, result: &RunResult) -> Result<(), PerpError>;
}
