#![deny(missing_docs)]

//! Core library for Rusty Brief, a resumable batch describer for document collections.

/// HTTP routing and REST handlers.
pub mod api;
/// Checkpoint state machine and durable storage.
pub mod checkpoint;
/// Pure classification of discovered items.
pub mod classify;
/// Environment-driven configuration management.
pub mod config;
/// Content extraction collaborators (page rendering, archives, text excerpts).
pub mod extraction;
/// Description generator collaborators and prompt construction.
pub mod generation;
/// Structured logging and tracing setup.
pub mod logging;
/// Batch manifests and description consolidation.
pub mod manifest;
/// Processing counters.
pub mod metrics;
/// Shared data model: work items, results, run settings.
pub mod model;
/// Batch orchestration: discovery, reconciliation, bounded draining, finalization.
pub mod orchestrator;
/// Per-item dispatch, two-stage generation and container aggregation.
pub mod processor;
/// Work-set listing for local directories and remote folders.
pub mod source;
