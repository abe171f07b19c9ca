pub mod aggregate;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod gauge;
pub mod geocode;
pub mod notify;
pub mod receiver;
pub mod redeem;
pub mod routes;
pub mod schedule;
pub mod state;
pub mod stats;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_support;
