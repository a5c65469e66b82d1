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

//! Static policy surface
//!
//! A [`Policy`] is data: which members are blocking, and which members allow
//! or disallow blocking calls made beneath them. It is resolved against the
//! host's type catalog as types load.

use std::collections::{BTreeMap, BTreeSet};

/// Whether a member has a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    /// Per-type member, rendered with `.`
    Static,
    /// Per-instance member, rendered with `#`
    Instance,
}

/// Compile-time description of a member.
///
/// Used by the in-process host to define frames and native entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Declaring type
    pub declaring_type: &'static str,
    /// Member name
    pub name: &'static str,
    /// Receiver kind
    pub kind: MemberKind,
    /// Implemented by a native entry point
    pub native: bool,
}

impl MemberRef {
    /// Per-type member
    #[must_use]
    pub const fn per_type(declaring_type: &'static str, name: &'static str) -> Self {
        Self {
            declaring_type,
            name,
            kind: MemberKind::Static,
            native: false,
        }
    }

    /// Per-instance member
    #[must_use]
    pub const fn instance(declaring_type: &'static str, name: &'static str) -> Self {
        Self {
            declaring_type,
            name,
            kind: MemberKind::Instance,
            native: false,
        }
    }

    /// Marks the member as a native entry point
    #[must_use]
    pub const fn native(mut self) -> Self {
        self.native = true;
        self
    }

    /// Returns true for per-type members
    #[inline]
    #[must_use]
    pub const fn is_static(&self) -> bool {
        matches!(self.kind, MemberKind::Static)
    }
}

/// Blocking members and call-chain allowances
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    blocking: BTreeMap<String, BTreeSet<String>>,
    allowances: BTreeMap<String, BTreeMap<String, bool>>,
}

impl Policy {
    /// Empty policy
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy listing the guarded std primitives of [`crate::natives`]
    #[must_use]
    pub fn std() -> Self {
        let mut policy = Self::new();
        for member in crate::natives::STD_NATIVES {
            policy.mark_blocking(member.declaring_type, member.name);
        }
        policy
    }

    /// Marks `member` of `declaring_type` as blocking
    pub fn mark_blocking(&mut self, declaring_type: impl Into<String>, member: impl Into<String>) {
        self.blocking
            .entry(declaring_type.into())
            .or_default()
            .insert(member.into());
    }

    /// Records an allowance; a later call for the same member overwrites it
    pub fn set_allowance(
        &mut self,
        declaring_type: impl Into<String>,
        member: impl Into<String>,
        allowed: bool,
    ) {
        self.allowances
            .entry(declaring_type.into())
            .or_default()
            .insert(member.into(), allowed);
    }

    /// Returns true if `member` of `declaring_type` is blocking
    #[must_use]
    pub fn is_blocking(&self, declaring_type: &str, member: &str) -> bool {
        self.blocking
            .get(declaring_type)
            .is_some_and(|members| members.contains(member))
    }

    /// Blocking members declared on `declaring_type`
    #[must_use]
    pub fn blocking_members(&self, declaring_type: &str) -> Option<&BTreeSet<String>> {
        self.blocking.get(declaring_type)
    }

    /// Allowances declared on `declaring_type`
    #[must_use]
    pub fn allowances_for(&self, declaring_type: &str) -> Option<&BTreeMap<String, bool>> {
        self.allowances.get(declaring_type)
    }

    /// Iterates over every `(type, member, allowed)` allowance
    pub fn allowances(&self) -> impl Iterator<Item = (&str, &str, bool)> {
        self.allowances.iter().flat_map(|(ty, members)| {
            members
                .iter()
                .map(move |(member, allowed)| (ty.as_str(), member.as_str(), *allowed))
        })
    }

    /// Types that carry blocking members
    pub fn blocking_types(&self) -> impl Iterator<Item = &str> {
        self.blocking.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_ref_kinds() {
        const SLEEP: MemberRef = MemberRef::per_type("std::thread::Thread", "sleep").native();
        const POLL: MemberRef = MemberRef::instance("app::Task", "poll");

        assert!(SLEEP.is_static());
        assert!(SLEEP.native);
        assert!(!POLL.is_static());
        assert!(!POLL.native);
    }

    #[test]
    fn test_allowance_overwrite() {
        let mut policy = Policy::new();
        policy.set_allowance("app::Scheduler", "run", false);
        policy.set_allowance("app::Scheduler", "run", true);

        let allowances: Vec<_> = policy.allowances().collect();
        assert_eq!(allowances, vec![("app::Scheduler", "run", true)]);
    }

    #[test]
    fn test_std_policy_lists_sleep() {
        let policy = Policy::std();
        assert!(policy.is_blocking("std::thread::Thread", "sleep"));
        assert!(!policy.is_blocking("std::thread::Thread", "spawn"));
    }
}
