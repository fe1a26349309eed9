//! # Skipmesh - Skip-Graph Overlay Operations
//!
//! Skipmesh implements the request side of a skip-graph overlay: the
//! operations a peer runs to find other peers by attribute, to announce and
//! withdraw its own attributes, and to join the overlay in the first place.
//!
//! - **Search**: multi-dimensional range queries answered by every matching
//!   owner, with serial or parallel result propagation and early exit at `k`
//! - **Update**: element announcement and withdrawal with per-element
//!   confirmation
//! - **Join**: admission through a bootstrap-resolved entry point
//! - **Bootstrap**: DHT-backed entry point discovery with no directory service
//!
//! ## Architecture
//!
//! Operations follow the **Actor Pattern**:
//! - Every running operation is a private actor that owns all of its state
//! - Remote peers talk to it only through channel-backed handles (reply sinks
//!   and trackers), never through shared references
//! - [`Node`] is the cheap-to-clone handle that starts operations and routes
//!   inbound results to them
//!
//! The skip-graph node, the DHT and the transport sit behind the traits in
//! [`protocols`]. [`sim`] provides an in-process overlay implementing all of
//! them, which the `skipmesh` binary and the integration tests drive.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: start operations, route results |
//! | `operation` | Retry, timeout and entry point acquisition shared by every operation |
//! | `search` | Range search aggregation and intersection |
//! | `update` | Element updates with confirmation tracking |
//! | `join` | Overlay admission |
//! | `relay` | Result messages sent back by responders |
//! | `bootstrap` | Bootstrap identifier pool and random resolution |
//! | `messages` | Message catalog and wire size accounting |
//! | `identity` | Peer identities and contacts |
//! | `protocols` | Collaborator traits (overlay, DHT, transport, monitor) |
//! | `monitor` | Per-operation statistics reports |
//! | `config` | Operation timeouts and retry budget |
//! | `sim` | Loopback overlay for simulations and tests |

pub mod bootstrap;
pub mod config;
mod identity;
pub mod join;
pub mod messages;
pub mod monitor;
mod node;
pub mod operation;
pub mod protocols;
pub mod relay;
pub mod search;
pub mod sim;
pub mod update;

#[cfg(test)]
mod testing;

pub use bootstrap::{BootstrapId, BootstrapResolver};
pub use config::OperationConfig;
pub use identity::{Contact, Identity};
pub use join::JoinOutcome;
pub use messages::{Element, Message, MessageBody, OperationId, RangeQuery};
pub use monitor::{MemoryMonitor, OperationReport, TracingMonitor};
pub use node::Node;
pub use operation::{Environment, OperationError, TrackerHandle};
pub use protocols::{DhtLookup, DhtObject, LocalOverlay, Monitor, Transport};
pub use sim::{Propagation, SimConfig, SimNetwork};
pub use update::UpdateReceipt;
