//! Offline-resilience engine for the classroom web client.
//!
//! Every outbound request of the client application goes through
//! [`engine::Engine`]: the [`router`] picks a caching strategy, the
//! [`strategy`] executors serve it from the [`cache`] or the network, and
//! mutations made while the origin is unreachable wait in the durable
//! [`queue`] until [`connectivity`] reports the link is back. The
//! [`lifecycle`] module installs and activates cache generations per
//! deployed version.

pub mod cache;
pub mod commands;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod queue;
pub mod router;
pub mod strategy;

#[cfg(test)]
mod testing;
