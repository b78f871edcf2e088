//! # VmGate – vSphere Transfer & Snapshot Core
//!
//! Moves virtual-machine disk images to and from a vSphere control plane
//! (OVA import/export over per-device transfer leases) and manages a VM's
//! hierarchical snapshot history.
//!
//! ## Modules
//!
//! - **types** — Config + wire data structures (leases, device URLs, snapshots)
//! - **error** — Crate-specific error types
//! - **session** — Session-authenticated HTTPS client (open / probe / close)
//! - **lease** — Transfer lease state machine + keep-alive progress reporter
//! - **transfer** — Chunked device upload / download with progress callbacks
//! - **snapshot** — Snapshot forest queries, search, and mutations
//! - **deploy** — Import / export orchestration over a scratch directory
//! - **service** — Aggregate facade owning the shared session

pub mod types;
pub mod error;
pub mod session;
pub mod lease;
pub mod transfer;
pub mod snapshot;
pub mod deploy;
pub mod service;
