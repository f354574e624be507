//! Core types and services for the flexicli orchestration runtime.
//!
//! This crate owns everything the rest of the workspace agrees on:
//! the shared data model, the error taxonomy, environment configuration,
//! the per-project directory layout, the token budget manager, abort
//! signal plumbing, and the durable session store.

pub mod abort;
pub mod budget;
pub mod config;
pub mod error;
pub mod logs;
pub mod project;
pub mod store;
pub mod types;

pub use abort::{AbortHandle, AbortSignal};
pub use error::{ErrorKind, Kinded};
