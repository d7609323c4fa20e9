use anyhow::Result;

use super::scripts;
use crate::cdp::CdpConnection;

/// Freezes CSS and JS animations in two layers: an init script installed
/// before any page script runs, and a post-load reinforcement sweep.
pub struct AnimationSuppressor {
    enabled: bool,
}

impl AnimationSuppressor {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// The pre-navigation init script, when suppression is on.
    pub fn init_script(&self) -> Option<String> {
        self.enabled.then(|| {
            scripts::ANIMATION_INIT_JS_TEMPLATE.replace("__CSS__", &escaped_kill_css())
        })
    }

    /// Re-assert suppression after the story is ready: re-inject the style,
    /// clear inline animation/transition properties, patch
    /// `getComputedStyle`, finish Web Animations, hide loader overlays.
    pub async fn reinforce(&self, conn: &mut CdpConnection) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let reinforce =
            scripts::ANIMATION_REINFORCE_JS_TEMPLATE.replace("__CSS__", &escaped_kill_css());
        conn.eval(&reinforce).await?;
        conn.eval(scripts::FINISH_ANIMATIONS_JS).await?;
        Ok(())
    }
}

fn escaped_kill_css() -> String {
    scripts::escape_for_template_literal(scripts::DISABLE_ANIMATIONS_CSS)
}
