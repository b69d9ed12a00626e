//! Vigil - continuous vulnerability monitoring for fleet container images
//!
//! Agents publish the containers running on their hosts into a store. Every
//! cycle the server scans newly seen images, pushes their status to the
//! configured monitors, and reconciles what it monitors against what is
//! actually running so vanished images and owners get resolved.

pub mod backends;
pub mod config;
pub mod image;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod server;
pub mod worker;
