#![forbid(unsafe_code)]
#![allow(clippy::inline_always)] /* Hot path */

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

/* Hook registry: operation id -> allow/disallow policy record */

use dashmap::DashMap;

use crate::host::OperationId;

/// Policy record attached to an operation.
///
/// `allowed == true` excuses blocking calls made beneath the operation.
/// `allowed == false` marks runtime machinery: checks apply beneath it, but
/// an enclosing allowed hook still wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHook {
    /// Declaring type of the hooked member
    pub declaring_type: String,
    /// Hooked member name
    pub member_name: String,
    /// Allow or disallow blocking calls beneath this operation
    pub allowed: bool,
}

impl OperationHook {
    /// Creates a hook record
    #[must_use]
    pub fn new(
        declaring_type: impl Into<String>,
        member_name: impl Into<String>,
        allowed: bool,
    ) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            member_name: member_name.into(),
            allowed,
        }
    }
}

/// Insert-or-overwrite map from operation to hook, read on every check
#[derive(Debug, Default)]
pub struct HookRegistry {
    hooks: DashMap<OperationId, OperationHook>,
}

impl HookRegistry {
    /// Create new registry
    #[must_use]
    pub fn new() -> Self {
        Self {
            hooks: DashMap::new(),
        }
    }

    /// Inserts or overwrites the hook for `operation`.
    ///
    /// Returns the record it replaced.
    pub fn register_hook(
        &self,
        operation: OperationId,
        hook: OperationHook,
    ) -> Option<OperationHook> {
        self.hooks.insert(operation, hook)
    }

    /// Full record lookup
    #[must_use]
    pub fn lookup(&self, operation: OperationId) -> Option<OperationHook> {
        self.hooks.get(&operation).map(|hook| hook.value().clone())
    }

    /// Allow flag of the hook on `operation`, if any
    #[inline(always)]
    #[must_use]
    pub fn is_allowed(&self, operation: OperationId) -> Option<bool> {
        self.hooks.get(&operation).map(|hook| hook.allowed)
    }

    /// Number of hooked operations
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Check if no hooks registered
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_registry() {
        let registry = HookRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.lookup(OperationId(1)), None);
        assert_eq!(registry.is_allowed(OperationId(1)), None);
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HookRegistry::new();
        let hook = OperationHook::new("reactor::Schedulers", "worker_schedule", false);

        let previous = registry.register_hook(OperationId(10), hook.clone());
        assert!(previous.is_none());

        assert_eq!(registry.lookup(OperationId(10)), Some(hook));
        assert_eq!(registry.is_allowed(OperationId(10)), Some(false));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = HookRegistry::new();
        registry.register_hook(OperationId(5), OperationHook::new("a::B", "run", false));

        let previous =
            registry.register_hook(OperationId(5), OperationHook::new("a::B", "run", true));
        assert_eq!(previous.map(|h| h.allowed), Some(false));
        assert_eq!(registry.is_allowed(OperationId(5)), Some(true));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_idempotent_registration() {
        let registry = HookRegistry::new();
        let hook = OperationHook::new("a::B", "run", true);

        registry.register_hook(OperationId(1), hook.clone());
        registry.register_hook(OperationId(1), hook.clone());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(OperationId(1)), Some(hook));
    }

    #[test]
    fn test_concurrent_registration_and_lookup() {
        let registry = Arc::new(HookRegistry::new());
        let mut handles = Vec::new();

        for worker in 0..4u64 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for i in 0..250u64 {
                    let id = OperationId(worker * 1000 + i);
                    registry.register_hook(id, OperationHook::new("t::T", "m", i % 2 == 0));
                    assert_eq!(registry.is_allowed(id), Some(i % 2 == 0));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 1000);
    }
}
