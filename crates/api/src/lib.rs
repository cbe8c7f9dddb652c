//! HTTP surface for analysis progress, (re)processing and queue status.

pub mod config;
pub mod error;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
