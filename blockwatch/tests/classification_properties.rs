/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

// Property-based tests for stack classification invariants

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use blockwatch::{
    Engine, GuardConfig, Instrumentation, MemberRef, OperationId, Policy, ThreadHandle, Verdict,
};
use common::ScriptedHost;
use proptest::prelude::*;

const FRAMES_TYPE: &str = "prop::Frames";

/// Hook state of one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    None,
    Allow,
    Disallow,
}

fn hook_strategy() -> impl Strategy<Value = Hook> {
    prop_oneof![
        6 => Just(Hook::None),
        1 => Just(Hook::Allow),
        2 => Just(Hook::Disallow),
    ]
}

/// Innermost first, bounded by `max_depth`
fn expected(restricted: bool, innermost_first: &[Hook], max_depth: usize) -> Verdict {
    if !restricted {
        return Verdict::Permitted;
    }
    let visible = &innermost_first[..innermost_first.len().min(max_depth)];
    if visible.contains(&Hook::Allow) {
        Verdict::Permitted
    } else if visible.contains(&Hook::Disallow) {
        Verdict::Violating
    } else {
        Verdict::Permitted
    }
}

/// Engine over a scripted stack, innermost hook first
fn scripted(
    restricted: bool,
    innermost_first: &[Hook],
    config: GuardConfig,
) -> (Arc<ScriptedHost>, Arc<Engine>) {
    let host = ScriptedHost::new();
    // Members need 'static names
    let names: Vec<&'static str> = (0..innermost_first.len())
        .map(|i| -> &'static str { Box::leak(format!("f{i}").into_boxed_str()) })
        .collect();

    let ids: Vec<OperationId> = names
        .iter()
        .map(|&name| host.add(&MemberRef::instance(FRAMES_TYPE, name)))
        .collect();
    host.load(FRAMES_TYPE);

    let engine = blockwatch::builder()
        .policy(Policy::new())
        .config(config)
        .build(host.clone())
        .unwrap();

    for (name, hook) in names.iter().zip(innermost_first) {
        match hook {
            Hook::Allow => assert_eq!(engine.register_hook(FRAMES_TYPE, name, true), 1),
            Hook::Disallow => assert_eq!(engine.register_hook(FRAMES_TYPE, name, false), 1),
            Hook::None => {}
        }
    }

    let outermost_first: Vec<OperationId> = ids.into_iter().rev().collect();
    host.set_stack(&outermost_first);
    if restricted {
        host.restrict_current();
    }
    (host, engine)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn verdict_matches_nearest_allow_model(
        restricted in any::<bool>(),
        hooks in prop::collection::vec(hook_strategy(), 0..300),
    ) {
        let (host, engine) = scripted(restricted, &hooks, GuardConfig::default());
        let verdict = engine.classify(host.current_thread());

        prop_assert_eq!(verdict, expected(restricted, &hooks, usize::MAX));
    }

    #[test]
    fn paging_and_depth_bound_respected(
        hooks in prop::collection::vec(hook_strategy(), 0..120),
        page_size in 1usize..16,
        max_stack_depth in 1usize..150,
    ) {
        let config = GuardConfig {
            max_stack_depth,
            stack_page_size: page_size,
            ..GuardConfig::default()
        };
        let (host, engine) = scripted(true, &hooks, config);
        let verdict = engine.classify(host.current_thread());

        prop_assert_eq!(verdict, expected(true, &hooks, max_stack_depth));
    }

    #[test]
    fn unrestricted_threads_never_walk_the_stack(
        hooks in prop::collection::vec(hook_strategy(), 0..64),
    ) {
        let (host, engine) = scripted(false, &hooks, GuardConfig::default());
        let thread = host.current_thread();

        prop_assert_eq!(engine.classify(thread), Verdict::Permitted);
        prop_assert_eq!(host.stack_fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn classification_is_idempotent(
        restricted in any::<bool>(),
        hooks in prop::collection::vec(hook_strategy(), 0..64),
        repeats in 2usize..8,
    ) {
        let (host, engine) = scripted(restricted, &hooks, GuardConfig::default());
        let thread = host.current_thread();

        let first = engine.classify(thread);
        for _ in 1..repeats {
            prop_assert_eq!(engine.classify(thread), first);
        }
        prop_assert_eq!(host.thread_info_fetches.load(Ordering::SeqCst), 1);
        prop_assert_eq!(
            engine.threads().cached(thread).map(|tag| tag.is_restricted),
            Some(restricted)
        );
    }
}

#[test]
fn no_hooks_is_permitted_for_context_queries() {
    let (host, engine) = scripted(true, &[Hook::None; 10], GuardConfig::default());
    assert_eq!(engine.classify(host.current_thread()), Verdict::Permitted);
}

#[test]
fn disallow_inside_allow_is_permitted() {
    // Innermost disallow, outer allow
    let hooks = [Hook::Disallow, Hook::None, Hook::Allow];
    let (host, engine) = scripted(true, &hooks, GuardConfig::default());
    assert_eq!(engine.classify(host.current_thread()), Verdict::Permitted);
}

#[test]
fn allow_beyond_max_depth_is_not_seen() {
    let mut hooks = vec![Hook::Disallow];
    hooks.extend([Hook::None; 7]);
    hooks.push(Hook::Allow);

    let config = GuardConfig {
        max_stack_depth: 8,
        stack_page_size: 3,
        ..GuardConfig::default()
    };
    let (host, engine) = scripted(true, &hooks, config);
    assert_eq!(engine.classify(host.current_thread()), Verdict::Violating);
}

#[test]
fn thread_classified_once_per_thread() {
    let (host, engine) = scripted(true, &[Hook::Disallow], GuardConfig::default());

    let other = ThreadHandle(7);
    host.set_thread(other, &[]);

    for _ in 0..5 {
        let _ = engine.classify(host.current_thread());
        let _ = engine.classify(other);
    }

    assert_eq!(host.thread_info_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(engine.threads().cached_count(), 2);
    assert_eq!(engine.metrics().snapshot().restricted_threads, 1);
}
