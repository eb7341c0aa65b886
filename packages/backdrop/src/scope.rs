//! Refcounted begin/end draw scope.

use backdrop_hal::{
    AlphaMode, DrawContext, GpuError, SurfaceFlags, SurfaceSize,
};
use tracing::warn;

/// Result of closing a draw scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndDrawOutcome {
    /// EndDraw succeeded (or the scope is still nested).
    Completed,
    /// EndDraw failed but the device is still alive; the frame is lost,
    /// drawing may continue.
    SoftFailure,
    /// Device loss confirmed; all device-dependent resources must be
    /// rebuilt.
    DeviceLost,
}

/// Wraps a draw context with a nesting counter so that the native
/// BeginDraw/EndDraw pair is issued exactly on the 0→1 and 1→0
/// transitions. Not internally locked; callers serialize access per
/// window.
pub struct DrawScope {
    ctx: Box<dyn DrawContext>,
    depth: u32,
}

impl DrawScope {
    pub fn new(ctx: Box<dyn DrawContext>) -> Self {
        Self { ctx, depth: 0 }
    }

    pub fn ctx(&mut self) -> &mut dyn DrawContext {
        self.ctx.as_mut()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_drawing(&self) -> bool {
        self.depth > 0
    }

    pub fn begin(&mut self) {
        if self.depth == 0 {
            self.ctx.begin_draw();
        }
        self.depth += 1;
    }

    pub fn end(&mut self) -> EndDrawOutcome {
        if self.depth == 0 {
            warn!("unbalanced end of draw scope");
            return EndDrawOutcome::Completed;
        }
        self.depth -= 1;
        if self.depth > 0 {
            return EndDrawOutcome::Completed;
        }
        match self.ctx.end_draw() {
            Ok(()) => EndDrawOutcome::Completed,
            Err(GpuError::EndDraw { code, tag1, tag2 }) => {
                warn!(code = format_args!("{code:#010X}"), tag1, tag2, "EndDraw failed");
                self.probe_outcome()
            }
            Err(err) => {
                warn!(%err, "EndDraw failed");
                self.probe_outcome()
            }
        }
    }

    /// Forcibly ends the native draw sequence without touching the
    /// counter, so resource-invalidating operations (swap-chain resize)
    /// can run mid-scope. Must be paired with [`resume`](Self::resume).
    pub fn suspend(&mut self) {
        if self.depth == 0 {
            return;
        }
        if let Err(err) = self.ctx.end_draw() {
            warn!(%err, "EndDraw failed during suspend");
        }
    }

    pub fn resume(&mut self) {
        if self.depth > 0 {
            self.ctx.begin_draw();
        }
    }

    /// EndDraw's own error code does not say whether the device is
    /// gone. Allocating a trivial render target is the reliable signal:
    /// it fails with a recreate-target code iff the device was lost.
    fn probe_outcome(&mut self) -> EndDrawOutcome {
        match self.ctx.create_surface(
            SurfaceSize::new(1, 1),
            AlphaMode::Premultiplied,
            SurfaceFlags::TARGET,
        ) {
            Ok(_) => EndDrawOutcome::SoftFailure,
            Err(err) if err.is_device_loss() => {
                warn!(%err, "device loss confirmed by probe allocation");
                EndDrawOutcome::DeviceLost
            }
            Err(err) => {
                warn!(%err, "probe allocation failed without device loss");
                EndDrawOutcome::SoftFailure
            }
        }
    }
}
