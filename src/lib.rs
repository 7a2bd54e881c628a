//! Herald: crash-safe delivery of queued messages to an external webhook.
//!
//! A durable SQLite queue owns message status. A delivery engine claims
//! pending messages, posts them to the recipient and records each completion
//! in a Redis-backed log. A reconciler settles messages a crash or a failed
//! record write left half-done, without ever re-sending them.
//!
//! See `DESIGN.md` for the full architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod logging;

pub mod cache;
pub mod sender;
pub mod store;

pub mod delivery;
pub mod reconcile;

pub mod api;
