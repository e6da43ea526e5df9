//! In-memory persistence store for tests and dry runs.

use std::sync::{Mutex, MutexGuard};

use crate::domain::error::PerpError;
use crate::domain::metrics::RunResult;
use crate::domain::order::Order;
use crate::domain::position::ClosedPosition;
use crate::ports::store_port::PersistenceStore;

#[derive(Debug, Default)]
struct Records {
    orders: Vec<(String, Order)>,
    closed: Vec<(String, ClosedPosition)>,
    results: Vec<(String, RunResult)>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Records>, PerpError> {
        self.records.lock().map_err(|e| PerpError::Database {
            reason: format!("memory store poisoned: {e}"),
        })
    }

    /// Every stored order, in write order.
    pub fn orders(&self) -> Vec<Order> {
        self.lock()
            .map(|r| r.orders.iter().map(|(_, o)| o.clone()).collect())
            .unwrap_or_default()
    }

    pub fn orders_for(&self, session: &str) -> Vec<Order> {
        self.lock()
            .map(|r| {
                r.orders
                    .iter()
                    .filter(|(s, _)| s == session)
                    .map(|(_, o)| o.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn closed_positions(&self) -> Vec<ClosedPosition> {
        self.lock()
            .map(|r| r.closed.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    pub fn results(&self) -> Vec<(String, RunResult)> {
        self.lock().map(|r| r.results.clone()).unwrap_or_default()
    }
}

impl PersistenceStore for MemoryStore {
    fn write_order(&self, session: &str, order: &Order) -> Result<(), PerpError> {
        self.lock()?.orders.push((session.to_string(), order.clone()));
        Ok(())
    }

    fn write_closed_position(
        &self,
        session: &str,
        position: &ClosedPosition,
    ) -> Result<(), PerpError> {
        self.lock()?
            .closed
            .push((session.to_string(), position.clone()));
        Ok(())
    }

    fn write_result(&self, session: &str, result: &RunResult) -> Result<(), PerpError> {
        self.lock()?
            .results
            .push((session.to_string(), result.clone()));
        Ok(())
    }
}
