//! Node-side agent: keeps a persistent websocket to the coordinator,
//! executes pushed commands against the local declarative service
//! store, reports telemetry and probe readings, and manages its own
//! installation alongside a counterpart role.

pub mod api;
pub mod config;
pub mod diagnose;
pub mod dispatch;
pub mod probe;
pub mod reconcile;
pub mod run;
pub mod store;
pub mod telemetry;
pub mod upgrade;
