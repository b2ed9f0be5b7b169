//! The Strata buffering core
//!
//! This library implements a multi-tier I/O buffering layer: applications
//! address data as named blobs inside named buckets (tags), and the engine
//! keeps blob contents spread across a hierarchy of storage targets --
//! memory, local files, remote files -- chosen by a per-blob score. Blobs
//! migrate between tiers in the background, and buckets bound to a backing
//! file transparently stage pages in and out of it.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::type_complexity)] // long-types happen, especially in async code
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)] // byte counts fed into scores fit in f64 mantissas
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

#[macro_use]
extern crate tracing;

pub mod config;
pub use config::{CoreConfig, CoreConfigBuilder, DeviceConfig, DeviceKind};

pub mod id;
pub use id::{BlobFlags, BlobId, BufferInfo, NodeId, TagFlags, TagId, TargetId, UpdateSizeMode};

pub mod engine;
pub use engine::CoreError;

pub mod io;
pub mod lanes;
pub mod metadata;

pub mod node;
pub use node::Node;

pub mod placement;
pub mod pool;
pub mod reorganizer;

pub mod rpc;
pub use rpc::{MemoryTransport, NodeTransport, Request, Response};

pub mod stager;

mod internal_events;

#[cfg(test)]
mod test;
#[cfg(test)]
mod tests;
