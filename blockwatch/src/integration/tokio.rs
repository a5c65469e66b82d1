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

//! Tokio integration
//!
//! Runtime threads are announced with [`TOKIO_THREAD`] through
//! [`instrument_runtime`], or on the first [`TaskPoll`] they run, and are
//! re-classified on every query. While a task
//! spawned with [`spawn`] is being polled the thread also holds
//! [`TOKIO_TASK`] and is restricted; blocking-pool threads never poll tasks
//! and stay unrestricted.
//!
//! ```no_run
//! use blockwatch::integration::tokio::{instrument_runtime, spawn};
//!
//! blockwatch::install_local()?;
//!
//! let runtime = instrument_runtime(&mut tokio::runtime::Builder::new_multi_thread())
//!     .enable_all()
//!     .build()?;
//!
//! runtime.block_on(async {
//!     spawn(async {
//!         // guarded primitives fail here
//!     })
//!     .await
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use tokio::runtime;
use tokio::task::JoinHandle;

use crate::builder::{Builder, Integration};
use crate::host::{LocalRuntime, ThreadInfo};
use crate::policy::MemberRef;

/// Capability of every thread of an instrumented runtime
pub const TOKIO_THREAD: &str = "tokio::runtime::Thread";

/// Capability held while a task is polled
pub const TOKIO_TASK: &str = "tokio::task::Task";

/// Frame wrapping every task poll
pub const TASK_POLL: MemberRef = MemberRef::instance("tokio::task::Task", "poll");

/// Frame wrapping [`block_in_place`]
pub const BLOCK_IN_PLACE: MemberRef = MemberRef::per_type("tokio::task", "block_in_place");

/// Restricts task polls on instrumented runtimes
#[derive(Debug, Clone, Copy)]
pub struct TokioIntegration {
    allow_block_in_place: bool,
}

impl Default for TokioIntegration {
    fn default() -> Self {
        Self {
            allow_block_in_place: true,
        }
    }
}

impl TokioIntegration {
    /// Reports blocking calls made inside [`block_in_place`] too
    #[must_use]
    pub fn strict() -> Self {
        Self {
            allow_block_in_place: false,
        }
    }
}

impl Integration for TokioIntegration {
    fn apply_to(&self, builder: &mut Builder) {
        builder
            .non_blocking_thread_predicate(|current| {
                Arc::new(move |info: &ThreadInfo| current(info) || info.has_capability(TOKIO_TASK))
            })
            .dynamic_thread_predicate(|info| {
                info.has_capability(TOKIO_THREAD) || info.has_capability(TOKIO_TASK)
            })
            .disallow_blocking_calls_inside(TASK_POLL.declaring_type, TASK_POLL.name);

        if self.allow_block_in_place {
            builder.allow_blocking_calls_inside(BLOCK_IN_PLACE.declaring_type, BLOCK_IN_PLACE.name);
        }
    }

    fn priority(&self) -> i32 {
        10
    }
}

/// Announces every thread of the runtime to the global host
pub fn instrument_runtime(builder: &mut runtime::Builder) -> &mut runtime::Builder {
    builder.on_thread_start(|| LocalRuntime::global().declare_thread([TOKIO_THREAD]))
}

pin_project! {
    /// Future polled as a restricted task
    #[must_use = "futures do nothing unless polled"]
    pub struct TaskPoll<F> {
        #[pin]
        inner: F,
        runtime: Arc<LocalRuntime>,
    }
}

impl<F: Future> TaskPoll<F> {
    /// Wraps `inner`
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            runtime: LocalRuntime::global(),
        }
    }
}

impl<F: Future> Future for TaskPoll<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        // Threads of runtimes built without `instrument_runtime` join on first poll
        if !this.runtime.has_capability(TOKIO_THREAD) {
            this.runtime.declare_thread([TOKIO_THREAD]);
        }
        let _task = this.runtime.scoped_capability(TOKIO_TASK);
        let _frame = this.runtime.push_frame(&TASK_POLL);
        this.inner.poll(cx)
    }
}

/// `tokio::spawn` with every poll restricted
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(TaskPoll::new(future))
}

/// `tokio::task::block_in_place` inside an allowed frame.
///
/// # Panics
///
/// Panics on a current-thread runtime, as `tokio::task::block_in_place` does.
pub fn block_in_place<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let _frame = LocalRuntime::global().push_frame(&BLOCK_IN_PLACE);
    tokio::task::block_in_place(f)
}
