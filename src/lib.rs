//! awsideman - administrative tooling for AWS Identity Center (SSO) at
//! organization scale.
//!
//! This crate is the CORE engine behind the `awsideman` CLI: it owns every
//! subsystem whose behavior determines correctness (caching, account
//! discovery, retrying, concurrent execution, the operation journal,
//! rollback, bulk operations, copy/clone, and template resolution). It does
//! not own the command-line shell, configuration file loading, colored
//! console rendering, OS keyring access, or the concrete AWS SDK clients --
//! those are external collaborators that hand validated, typed values to
//! the core.
//!
//! # Module organization
//!
//! - [`config`] - typed configuration consumed by every other module
//! - [`error`] - the closed error taxonomy shared across the core
//! - [`types`] - identifiers and value types used throughout
//! - [`aws`] - the narrow AWS collaborator surface, expressed as a trait
//! - [`cache`] - the tiered key/value cache
//! - [`resolver`] - name-to-ARN/ID resolution
//! - [`accounts`] - the account-cache optimizer and filter expressions
//! - [`retry`] - backoff and adaptive concurrency
//! - [`executor`] - the multi-account worker pool
//! - [`operations`] - the append-only operation journal
//! - [`rollback`] - inverse-operation planning and execution
//! - [`bulk`] - the CSV/JSON bulk pipeline
//! - [`copyclone`] - assignment copy and permission-set cloning
//! - [`template`] - declarative template resolution

#![warn(clippy::all, rust_2018_idioms)]

#[macro_use]
pub mod logging_macros;

pub mod accounts;
pub mod aws;
pub mod bulk;
pub mod cache;
pub mod config;
pub mod copyclone;
pub mod error;
pub mod executor;
pub mod operations;
pub mod resolver;
pub mod retry;
pub mod rollback;
pub mod template;
pub mod types;
