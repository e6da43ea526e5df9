//! Core domain types and logic.

pub mod error;
pub mod order;
pub mod contract;
pub mod position;
pub mod ledger;
pub mod snapshot;
pub mod rule;
pub mod rule_parser;
pub mod rule_eval;
pub mod signal;
pub mod strategy;
pub mod ladder;
pub mod backtest;
pub mod metrics;
pub mod harness;
pub mod live;
pub mod config_validation;
