//! The uniform tool contract, discovery registry, sensitivity
//! classification, and approval gate.
//!
//! Concrete tool implementations live behind the [`contract::Tool`] trait;
//! a small built-in set ships here so the runtime is usable out of the box.

pub mod approval;
pub mod builtin;
pub mod contract;
pub mod registry;
pub mod sensitivity;

pub use approval::{ApprovalDecision, ApprovalGate, ApprovalRequest, ApprovalTransport};
pub use contract::{Tool, ToolError, ToolOutcome};
pub use registry::ToolRegistry;
pub use sensitivity::classify;
