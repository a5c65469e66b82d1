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

//! Bundled integrations
//!
//! [`defaults`] is what [`crate::install`] applies before caller supplied
//! integrations.

mod stdio;

#[cfg(feature = "tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "tokio")))]
pub mod tokio;

pub use stdio::StdioIntegration;

use crate::builder::Integration;

/// Integrations enabled by the current feature set
#[must_use]
pub fn defaults() -> Vec<Box<dyn Integration>> {
    let mut integrations: Vec<Box<dyn Integration>> = vec![Box::new(StdioIntegration)];

    #[cfg(feature = "tokio")]
    integrations.push(Box::new(self::tokio::TokioIntegration::default()));

    integrations
}
