pub mod config;
pub mod error;
pub mod http_probe;
pub mod metrics;
pub mod mimir;
pub mod resolver;

#[cfg(test)]
mod testing;
