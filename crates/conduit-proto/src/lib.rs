//! Wire protocol shared by the coordinator and node agents.
//!
//! Every message exchanged over a node connection is a JSON envelope
//! `{type, data}`. Commands flow coordinator -> agent, replies and
//! telemetry flow back. The codec in [`envelope`] is deliberately
//! tolerant: intermediate transport layers are known to double-encode
//! or wrap payloads, and a single bad frame must never cost us the
//! connection.

pub mod command;
pub mod envelope;
pub mod reply;
pub mod service;

pub use command::{Command, DiagnoseRequest, QueryServicesRequest, ServiceNames, UpgradeRequest};
pub use envelope::{DecodeError, Envelope, decode_frame};
pub use reply::{DiagnoseReport, ReplyFrame, ServiceSummary};
pub use service::{Chain, ForwardNode, Forwarder, Handler, Hop, ServiceSpec, parse_port};

/// Provenance tag stamped into `metadata.managedBy` on every service the
/// coordinator pushes. Reconciliation only ever auto-removes services
/// carrying this tag.
pub const MANAGED_BY_TAG: &str = "conduit-control";

/// Metadata key holding the provenance tag.
pub const META_MANAGED_BY: &str = "managedBy";

/// Metadata key marking a service as paused (intent only; the proxy
/// process keeps the handler running).
pub const META_PAUSED: &str = "paused";
