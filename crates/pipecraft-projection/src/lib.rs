//! Derives an in-memory view of a run from the durable Task Store / Run
//! Store plus live worker signals, and streams it to subscribers as typed
//! events.
//!
//! # Main types
//!
//! - [`Projection`] — one per worktree; polls, diffs, and fans out.
//! - [`ProjectionEvent`] — the 8 event variants a subscriber observes.
//! - [`Snapshot`] — the full state a fresh subscriber starts from.
//! - [`agent_graph`] — pure derivation of the pipeline's node/edge view.

/// Pure agent-graph derivation from task and worker state.
pub mod graph;
/// Event variants delivered to projection subscribers.
pub mod event;
/// The watch-and-diff actor and its subscription API.
pub mod projection;
/// The `Snapshot` type and its metadata.
pub mod snapshot;

pub use event::ProjectionEvent;
pub use graph::{agent_graph, AgentEdge, AgentGraph, AgentNode, NodeState};
pub use projection::Projection;
pub use snapshot::{Snapshot, SnapshotMetadata};
