//! # Repository Layer
//!
//! This module contains repository implementations that encapsulate SeaORM operations
//! for the catalog entities, including the guarded status transitions the background
//! services rely on.

pub mod connection;
pub mod repo;
pub mod repo_job;
pub mod secret;

pub use connection::{ConnectionRepository, DeclarativeUpsert, SyncRequest};
pub use repo::RepoRepository;
pub use repo_job::{IndexOutcome, RepoJobRepository};
pub use secret::{SecretError, SecretRepository};
