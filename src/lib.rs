//! Peer-to-peer replication of a fixed set of SQLite tables.
//!
//! Every node owns its own database. Nodes find each other by UDP broadcast,
//! exchange row-level changes over HTTP, and converge with last-writer-wins
//! conflict resolution. There is no coordinator.

pub mod config;
pub mod discovery;
pub mod events;
pub mod node;
pub mod registry;
pub mod server;
pub mod store;
pub mod sync;

pub use config::NodeConfig;
pub use node::Node;
