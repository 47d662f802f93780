//! Pre-flight policy checks applied before mutating provider calls.
//!
//! A guard failure is terminal for the requested operation: no provider API
//! call is made at all. The policy is static configuration, read on every
//! create/resize and never mutated at runtime.

use thiserror::Error;

/// Instance types the self-service portal is allowed to launch.
pub const ALLOWED_INSTANCE_TYPES: [&str; 2] = ["t3.micro", "t2.small"];
/// Ceiling on concurrent non-terminated instances owned by this tool.
pub const MAX_ACTIVE_INSTANCES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("limit reached ({active}/{limit})")]
    CapacityExceeded { active: usize, limit: usize },
    #[error("instance type '{requested}' not allowed (allowed: {allowed})")]
    TypeNotAllowed { requested: String, allowed: String },
    #[error("{0}")]
    Precondition(String),
}

#[derive(Debug, Clone)]
pub struct GuardPolicy {
    pub max_active_instances: usize,
    pub allowed_instance_types: Vec<String>,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            max_active_instances: MAX_ACTIVE_INSTANCES,
            allowed_instance_types: ALLOWED_INSTANCE_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl GuardPolicy {
    /// Fails when the owned non-terminated count is already at the ceiling.
    /// The count must come from a fresh list call, not a cached one.
    pub fn check_capacity(&self, active: usize) -> Result<(), GuardError> {
        if active >= self.max_active_instances {
            return Err(GuardError::CapacityExceeded {
                active,
                limit: self.max_active_instances,
            });
        }
        Ok(())
    }

    /// Closed allowlist membership, case-sensitive.
    pub fn check_instance_type(&self, requested: &str) -> Result<(), GuardError> {
        if !self.allowed_instance_types.iter().any(|t| t == requested) {
            return Err(GuardError::TypeNotAllowed {
                requested: requested.to_string(),
                allowed: self.allowed_instance_types.join(", "),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_accepts_below_limit() {
        let policy = GuardPolicy::default();
        assert!(policy.check_capacity(0).is_ok());
        assert!(policy.check_capacity(1).is_ok());
    }

    #[test]
    fn capacity_rejects_at_and_above_limit() {
        let policy = GuardPolicy::default();
        let err = policy.check_capacity(2).unwrap_err();
        assert_eq!(err.to_string(), "limit reached (2/2)");
        assert!(policy.check_capacity(3).is_err());
    }

    #[test]
    fn allowlist_is_closed() {
        let policy = GuardPolicy::default();
        assert!(policy.check_instance_type("t3.micro").is_ok());
        assert!(policy.check_instance_type("t2.small").is_ok());
        assert!(policy.check_instance_type("m5.24xlarge").is_err());
        assert!(policy.check_instance_type("t3.nano").is_err());
    }

    #[test]
    fn allowlist_is_case_sensitive() {
        let policy = GuardPolicy::default();
        assert!(policy.check_instance_type("T3.Micro").is_err());
        assert!(policy.check_instance_type("T2.SMALL").is_err());
    }
}
