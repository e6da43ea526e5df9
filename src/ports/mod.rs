//! Port traits implemented by adapters.

pub mod config_port;
pub mod exchange_port;
pub mod feed_port;
pub mod store_port;
