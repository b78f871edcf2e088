//! # VmGate – OVA Container Codec
//!
//! Packs and unpacks OVA containers (plain tar archives bundling an OVF
//! descriptor with its binary disk images) and locates the descriptor
//! entry inside an existing container.
//!
//! ## Modules
//!
//! - **error** — Crate-specific error types
//! - **ova** — Pack / unpack / entry listing / descriptor lookup

pub mod error;
pub mod ova;

pub use error::{ArchiveError, ArchiveErrorKind, ArchiveResult};
pub use ova::{ArchiveEntry, CONTAINER_EXT, DESCRIPTOR_EXT};
