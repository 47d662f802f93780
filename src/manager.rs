//! Error taxonomy shared by every resource manager.
//!
//! Three terminal outcomes besides success: a guard refused the operation
//! before any remote call, ownership could not be proven, or the provider
//! itself failed. Nothing in this layer retries; a single provider failure
//! maps directly to a reported error.

use thiserror::Error;

use crate::guard::GuardError;

/// Failure returned by the remote API. `BucketNotEmpty` is classified
/// distinctly on bucket deletion but is never auto-resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("bucket is not empty; empty it first")]
    BucketNotEmpty,
    #[error("{0}")]
    Api(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("policy violation: {0}")]
    Guard(#[from] GuardError),
    /// Marker mismatch, marker absent, or the fetch needed to prove
    /// ownership failed. Deliberately indistinguishable from "does not
    /// exist" so foreign resources are not enumerable through this tool.
    #[error("access denied: resource not found or not managed by this tool")]
    AccessDenied,
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type OpResult<T> = Result<T, OpError>;
