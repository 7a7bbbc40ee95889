//! Data-plane core of a self-hosted media control plane: chunked resumable
//! uploads, rule-based storage allocation, and an asynchronous transform
//! scheduler with caching and bounded concurrency.

pub mod adapters;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
