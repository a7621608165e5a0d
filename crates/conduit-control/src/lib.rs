//! Coordinator for a fleet of proxy-hosting nodes.
//!
//! Nodes hold persistent websocket connections to `/system-info`; the
//! registry tracks which node owns which connections, commands are
//! pushed as `{type, data}` envelopes, and asynchronous replies are
//! matched back to callers by request id.

pub mod commands;
pub mod correlator;
pub mod lifecycle;
pub mod node_ws;
pub mod observer;
pub mod registry;
pub mod state;
