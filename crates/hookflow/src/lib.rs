//! Webhook relay built on a priority job queue.
//!
//! Inbound webhooks are enqueued as jobs, dispatched to a bounded pool of
//! worker slots, relayed to a downstream HTTP endpoint, and the submitting
//! request is answered once its job reaches a terminal state.

pub mod api;
pub mod config;
pub mod db;
pub mod downstream;
pub mod jobs;
