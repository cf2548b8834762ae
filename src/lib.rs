//! FileMesh Control Plane
//!
//! Request routing and elastic scaling for a distributed, chunked
//! object-storage cluster. The control plane is built from four
//! tightly-coupled subsystems:
//!
//! - A priority request queue with anti-starvation aging ([`queue`]).
//! - A node registry with a TCP health prober ([`registry`], [`health`]).
//! - A worker pool forwarding queued requests to healthy aggregator nodes
//!   under a pluggable selection policy ([`worker`], [`scheduler`]).
//! - A scaling loop: a queue-pressure sensor publishing demand intents on an
//!   MQTT bus ([`scaling`], [`bus`]) and a host-manager reconciler driving
//!   container-addressable nodes through a runtime adapter
//!   ([`hostmanager`], [`runtime`]).
//!
//! The `filemesh-lb` binary runs the public HTTP surface plus the queue,
//! probe, workers, and sensor; `filemesh-hostmanager` runs the reconciler.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod api;
pub mod bus;
pub mod error;
pub mod health;
pub mod hostmanager;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod scaling;
pub mod scheduler;
pub mod settings;
pub mod stats;
pub mod worker;

pub use error::{FileMeshError, Result};
