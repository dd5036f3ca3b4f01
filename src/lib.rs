//! Control plane for a fleet of proxy nodes: keeps each node's manager daemon
//! in step with the desired account assignments, keeps shared DNS records
//! pointed at the active nodes, and rolls up transfer statistics.

pub mod cache;
pub mod config;
pub mod db;
pub mod dns;
pub mod error;
pub mod logging;
pub mod manager;
pub mod reconciler;
pub mod retry;
pub mod rotation;
pub mod services;
pub mod statistics;
pub mod tasks;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;
