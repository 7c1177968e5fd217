//! Error types surfaced to the embedder.
//!
//! Collection itself never fails from the embedder's point of view: a cycle
//! always runs to completion, possibly compacting less than it could. The
//! errors here come from allocation and handle management.

use crate::config::ConfigError;
use crate::heap::AllocationSpace;
use thiserror::Error;

/// Result type for fallible heap operations.
pub type GcResult<T> = Result<T, GcError>;

/// Recoverable heap errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GcError {
    /// A space could not satisfy an allocation request.
    #[error("out of memory in {space:?}: requested {requested} bytes")]
    OutOfMemory {
        /// Space the allocation targeted.
        space: AllocationSpace,
        /// Requested size in bytes.
        requested: usize,
    },

    /// The heap configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// An object of this size cannot be represented.
    #[error("object of {size} bytes exceeds the maximum object size")]
    ObjectTooLarge {
        /// Requested size in bytes.
        size: usize,
    },

    /// A global handle was used after it was destroyed.
    #[error("global handle {0} is not live")]
    InvalidHandle(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = GcError::OutOfMemory {
            space: AllocationSpace::OldPointer,
            requested: 64,
        };
        assert_eq!(err.to_string(), "out of memory in OldPointer: requested 64 bytes");

        let err: GcError = ConfigError::NurseryTooSmall.into();
        assert_eq!(
            err.to_string(),
            "invalid configuration: nursery must hold at least one page"
        );
    }
}
