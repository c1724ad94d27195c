//! # concord-core — Operational-transform editing core
//!
//! Pure, synchronous building blocks for real-time collaborative editing.
//! Nothing here performs I/O or holds locks; the session layer in
//! `concord-collab` serializes access.
//!
//! ## Architecture
//!
//! ```text
//!  Operation (base_version = n)
//!        │
//!        ▼
//! ┌──────────────┐  operations_since(n)  ┌──────────────────┐
//! │  transform   │ ◄──────────────────── │ DocumentReplica  │
//! │  (rebase)    │                       │  base + log      │
//! └──────┬───────┘                       │  content, version│
//!        │  Operation (base_version = v) └────────▲─────────┘
//!        └────────────── apply ──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`operation`] — `Operation`, kinds, validation
//! - [`document`] — element buffer, snapshots, replica with compacting log
//! - [`transform`] — pairwise rebase, conflict resolution, history fold
//! - [`error`] — validation, conflict and replica errors

pub mod document;
pub mod error;
pub mod operation;
pub mod transform;

pub use document::{DocumentContent, DocumentReplica, Element, Snapshot, DEFAULT_RETENTION};
pub use error::{ConflictError, ReplicaError, ValidationError};
pub use operation::{OpKind, Operation, ParticipantId};
pub use transform::{overlaps, resolve_conflict, transform, transform_pair};
