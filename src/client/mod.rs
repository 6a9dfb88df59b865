//! Client side of the protocol: a health monitor that decides when a socket
//! has gone stale and a reconnecting consumer built on it.

pub mod consumer;
pub mod monitor;

pub use consumer::Consumer;
pub use monitor::{ConnectionMonitor, MonitorAction, MonitorConfig};

#[cfg(test)]
mod tests;
