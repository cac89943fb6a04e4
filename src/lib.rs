//! # meshrouter-core
//!
//! The router-core subsystem of a multi-tenant AMQP 1.0 mesh message
//! router: the single-threaded decision engine that owns the address
//! table, the forwarding algorithms, the link/delivery lifecycle, and the
//! thread-safe work exchange with the I/O layer.
//!
//! Out of scope, behind interfaces in [`io_bridge`] and [`policy`]: the
//! AMQP wire driver, the management agent, configuration-file parsing, and
//! the policy rules engine. This crate consumes already-compiled
//! `PolicySettings` and pattern trees, and an already-authenticated
//! principal name.
//!
//! ## Module map
//!
//! - [`bitmask`] / [`pattern`] — fixed-width router bitmask and address
//!   pattern trees (CSV and wildcard).
//! - [`message`] — chained-buffer AMQP message, lazy depth-indexed field
//!   access, annotation rewrite pipeline, Q2 watermark helpers.
//! - [`delivery`] / [`link`] / [`connection`] — delivery arena, link
//!   lifecycle, connection work-list.
//! - [`address`] — the hash-indexed mobile address table.
//! - [`forwarder`] — the five forwarding strategies.
//! - [`core_engine`] — the single-threaded action/general-work loop.
//! - [`protocol`] — connection/link protocol glue (annotation pipeline,
//!   origin-bit resolution).
//! - [`policy`] — connection/session/link admission.
//! - [`route_control`] — router-node table and link-loss re-validation.
//! - [`io_bridge`] — the trait seam the wire driver implements.
//! - [`config`] / [`error`] / [`observability`] / [`domain_types`] — the
//!   ambient stack.

pub mod address;
pub mod bitmask;
pub mod config;
pub mod connection;
pub mod core_engine;
pub mod delivery;
pub mod domain_types;
pub mod error;
pub mod forwarder;
pub mod io_bridge;
pub mod link;
pub mod message;
pub mod observability;
pub mod pattern;
pub mod policy;
pub mod protocol;
pub mod route_control;

pub use crate::config::RouterConfig;
pub use crate::core_engine::{Action, RouterCore};
pub use crate::error::CoreError;
pub use crate::io_bridge::IoBridge;
