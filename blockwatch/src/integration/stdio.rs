/*
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

//! Console output integration

use crate::builder::{Builder, Integration};
use crate::natives::{CONSOLE_FLUSH, CONSOLE_WRITE};

/// Allows [`crate::natives::Console`] output from restricted threads
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioIntegration;

impl Integration for StdioIntegration {
    fn apply_to(&self, builder: &mut Builder) {
        for member in [CONSOLE_WRITE, CONSOLE_FLUSH] {
            builder.allow_blocking_calls_inside(member.declaring_type, member.name);
        }
    }
}
