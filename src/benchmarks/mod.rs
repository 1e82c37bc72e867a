//! Concrete browser benchmarks.

mod motionmark;
mod video;

use std::time::Duration;

use anyhow::{Context, Result};
use headless_chrome::Tab;

use crate::context::ExecutionContext;
use crate::session::BrowserSession;

pub use motionmark::MotionMarkTest;
pub use video::VideoTest;

/// Poll `script` (which must evaluate to a boolean) until it is true.
///
/// Gives up before the next evaluation once the context is cancelled or its
/// deadline passes.
fn wait_for_condition(
    ctx: &ExecutionContext<BrowserSession>,
    tab: &Tab,
    script: &str,
    poll: Duration,
) -> Result<()> {
    loop {
        ctx.check()?;
        let ready = tab
            .evaluate(script, false)
            .context("Failed to poll page state")?
            .value
            .and_then(|value| value.as_bool())
            .unwrap_or(false);
        if ready {
            return Ok(());
        }
        ctx.sleep(poll)?;
    }
}
