#![forbid(unsafe_code)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Engine configuration

use crate::error::GuardError;

/// Capability declared by threads that must never block.
pub const NON_BLOCKING_MARKER: &str = "blockwatch::NonBlocking";

/// Default bound on the number of frames inspected per check.
pub const DEFAULT_MAX_STACK_DEPTH: usize = 1024;

/// Default number of frames fetched from the host per page.
pub const DEFAULT_STACK_PAGE_SIZE: usize = 128;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardConfig {
    /// Maximum frames inspected per classification
    pub max_stack_depth: usize,

    /// Frames requested from the host per page
    pub stack_page_size: usize,

    /// Capability marker of restricted threads
    pub non_blocking_marker: String,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
            stack_page_size: DEFAULT_STACK_PAGE_SIZE,
            non_blocking_marker: NON_BLOCKING_MARKER.to_string(),
        }
    }
}

impl GuardConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::InvalidConfig`] when a bound is zero or the
    /// marker is empty.
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.max_stack_depth == 0 {
            return Err(GuardError::InvalidConfig(
                "max_stack_depth must be > 0".to_string(),
            ));
        }
        if self.stack_page_size == 0 {
            return Err(GuardError::InvalidConfig(
                "stack_page_size must be > 0".to_string(),
            ));
        }
        if self.non_blocking_marker.is_empty() {
            return Err(GuardError::InvalidConfig(
                "non_blocking_marker must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GuardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stack_page_size, 128);
        assert_eq!(config.non_blocking_marker, NON_BLOCKING_MARKER);
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let config = GuardConfig {
            stack_page_size: 0,
            ..GuardConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stack_page_size"));
    }

    #[test]
    fn test_empty_marker_rejected() {
        let config = GuardConfig {
            non_blocking_marker: String::new(),
            ..GuardConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
