//! # Courier
//!
//! Scheduled refresh and distribution of short-lived vault tokens for batch
//! compute services.
//!
//! One run takes every configured service through a fixed stage order —
//! Kerberos ticket acquisition, vault-token storage or fetch, destination
//! reachability, token push — with per-stage timeouts, per-worker retries,
//! and partial-failure propagation: a failing service drops out of later
//! stages without disturbing its siblings. Errors fan into a notification
//! subsystem that emails per-service operators, thresholds repeat offenders
//! against persistent counters, and ends the run with one admin digest.
//!
//! ## Pipeline
//!
//! 1. [`config::Config`] loads and validates the hierarchical TOML file.
//! 2. [`pipeline::assemble_service_configs`] builds one immutable
//!    [`service::ServiceConfig`] per service, resolving uids through
//!    [`db::Store`].
//! 3. [`pipeline::run`] sequences the stages, spawning one
//!    [`worker`] invocation per stage over the [`channels`] triple and
//!    filtering failed services between stages.
//! 4. [`notify`] routes worker notifications to per-service email managers
//!    and the [`admin`] aggregator, which consults and persists the error
//!    counters.
//!
//! ## Modules
//!
//! - [`types`] — service identity, notifications, the worker error taxonomy
//! - [`config`] — configuration file loading, overrides, validation
//! - [`context`] — run-scoped cancellation and timeout table
//! - [`environment`] — typed command environment
//! - [`service`] — per-service config bundle with rollback construction
//! - [`channels`] — the worker channel triple and its close-order contract
//! - [`process`] — cancellable external command execution
//! - [`retry`] — bounded retry with fixed sleep
//! - [`token`] — vault/bearer token structural checks and file discovery
//! - [`worker`] — stage worker scaffolding and dispatch
//! - [`kerberos`], [`vault`], [`ping`], [`push`] — the stage actions
//! - [`pipeline`] — the stage-sequencing driver
//! - [`notify`], [`admin`], [`email`] — notification routing, thresholding,
//!   delivery
//! - [`db`] — embedded SQLite store (error counters, uid cache)
//! - [`schedd`] — memoized credential-daemon discovery

/// Admin aggregation: counting, thresholding, the end-of-run digest.
pub mod admin;

/// The worker channel triple and its close-order contract.
pub mod channels;

/// Configuration file loading, overrides, and startup validation.
pub mod config;

/// Run-scoped cancellation and the per-stage timeout table.
pub mod context;

/// Embedded SQLite store: error counters and the uid cache.
pub mod db;

/// Message delivery: SMTP, webhook, templates.
pub mod email;

/// Typed command environment.
pub mod environment;

/// Kerberos stage action.
pub mod kerberos;

/// Notification routing and per-service email managers.
pub mod notify;

/// The stage-sequencing pipeline driver.
pub mod pipeline;

/// Reachability stage action.
pub mod ping;

/// Cancellable external command execution.
pub mod process;

/// Distribution stage action.
pub mod push;

/// Bounded retry around single-shot actions.
pub mod retry;

/// Memoized schedd discovery per collector host.
pub mod schedd;

/// Per-service configuration bundle.
pub mod service;

/// Vault and bearer token structural checks.
pub mod token;

/// Domain types: identity, notifications, error taxonomy.
pub mod types;

/// Vault-token stage actions.
pub mod vault;

/// Worker scaffolding and variant dispatch.
pub mod worker;
