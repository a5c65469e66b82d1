#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![warn(rust_2018_idioms)]

/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Tower middleware for blockwatch
//!
//! Runs every `Service::call` and every poll of the returned future inside a
//! frame of the in-process host. Hooks registered for that frame then apply
//! to the whole request.
//!
//! # Examples
//!
//! ```rust
//! use tower::{service_fn, ServiceBuilder};
//! use tower_blockwatch::BlockwatchLayer;
//! use std::convert::Infallible;
//!
//! let service = ServiceBuilder::new()
//!     .layer(BlockwatchLayer::new())
//!     .service(service_fn(|req: u32| async move { Ok::<_, Infallible>(req + 1) }));
//! ```
//!
//! Pair it with [`TowerIntegration`] so blocking calls made while serving a
//! request on a restricted thread are reported:
//!
//! ```rust,no_run
//! use tower_blockwatch::TowerIntegration;
//!
//! blockwatch::install(
//!     blockwatch::LocalRuntime::global(),
//!     vec![Box::new(TowerIntegration::default()) as Box<dyn blockwatch::Integration>],
//! )?;
//! # Ok::<(), blockwatch::GuardError>(())
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use blockwatch::host::{Instrumented, LocalRuntime};
use blockwatch::{Builder, Integration, MemberRef};
use tower::{Layer, Service};

/// Frame wrapping every service call
pub const SERVICE_CALL: MemberRef = MemberRef::instance("tower::Service", "call");

/// Tower layer running services inside a frame
#[derive(Debug, Clone)]
pub struct BlockwatchLayer {
    member: MemberRef,
    runtime: Arc<LocalRuntime>,
}

impl Default for BlockwatchLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockwatchLayer {
    /// Layer recording [`SERVICE_CALL`] frames on the global runtime
    #[must_use]
    pub fn new() -> Self {
        Self::with_member(SERVICE_CALL)
    }

    /// Layer recording frames for a custom member
    #[must_use]
    pub fn with_member(member: MemberRef) -> Self {
        Self {
            member,
            runtime: LocalRuntime::global(),
        }
    }

    /// Member recorded for every call
    pub fn member(&self) -> &MemberRef {
        &self.member
    }
}

impl<S> Layer<S> for BlockwatchLayer {
    type Service = BlockwatchService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BlockwatchService {
            inner,
            member: self.member,
            runtime: Arc::clone(&self.runtime),
        }
    }
}

/// Tower service wrapper recording a frame per call
#[derive(Debug, Clone)]
pub struct BlockwatchService<S> {
    inner: S,
    member: MemberRef,
    runtime: Arc<LocalRuntime>,
}

impl<S> BlockwatchService<S> {
    /// Get reference to inner service
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Get mutable reference to inner service
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S, Request> Service<Request> for BlockwatchService<S>
where
    S: Service<Request>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Instrumented<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let future = {
            let _frame = self.runtime.push_frame(&self.member);
            self.inner.call(request)
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(member = self.member.name, "Service call instrumented");

        self.runtime.instrument(self.member, future)
    }
}

/// Makes checks apply to blocking calls made while serving a request
#[derive(Debug, Clone, Copy)]
pub struct TowerIntegration {
    member: MemberRef,
}

impl Default for TowerIntegration {
    fn default() -> Self {
        Self {
            member: SERVICE_CALL,
        }
    }
}

impl TowerIntegration {
    /// Integration for a layer built with [`BlockwatchLayer::with_member`]
    #[must_use]
    pub fn for_member(member: MemberRef) -> Self {
        Self { member }
    }
}

impl Integration for TowerIntegration {
    fn apply_to(&self, builder: &mut Builder) {
        builder.disallow_blocking_calls_inside(self.member.declaring_type, self.member.name);
    }
}
