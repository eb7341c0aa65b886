//! Per-window presentation: swap chain, back-buffer bitmap, flush and
//! present paths.

use std::rc::Rc;
use std::sync::Arc;

use backdrop_hal::{
    AlphaMode, GpuDevice, PixelRect, SurfaceFlags, SurfacePoint, SurfaceRect, SurfaceSize,
    SwapChain,
};
use euclid::default::Vector2D;
use raw_window_handle::RawWindowHandle;
use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::device::GraphicsDevice;
use crate::region::DirtyRegion;
use crate::scope::EndDrawOutcome;

/// The window this library paints into. Geometry, handle and
/// translucency come from the embedder; device-lost notifications go
/// back to it as posted events so recovery runs off the failing call
/// stack.
pub trait PaintWindow {
    /// Window rectangle in screen coordinates.
    fn geometry(&self) -> PixelRect;
    fn raw_window_handle(&self) -> RawWindowHandle;
    fn is_translucent(&self) -> bool;
    /// Whether this window owns swap-chain presentation (top-level) or
    /// is composited by someone else (child/embedded).
    fn owns_presentation(&self) -> bool;
    /// Delivered at most once per loss episode per window.
    fn post_device_lost(&self);
}

/// Owns the swap chain (direct rendering) or an off-screen composited
/// bitmap (translucent rendering) of one window.
pub struct WindowTarget {
    gfx: Arc<GraphicsDevice>,
    window: Rc<dyn PaintWindow>,
    device: Option<Arc<dyn GpuDevice>>,
    swap_chain: Option<Box<dyn SwapChain>>,
    // declared after swap_chain but torn down first everywhere it
    // matters: the bitmap may wrap the swap chain's buffer
    bitmap: Option<Bitmap>,
    direct: bool,
    needs_full_repaint: bool,
    device_lost: bool,
}

impl WindowTarget {
    pub fn new(gfx: Arc<GraphicsDevice>, window: Rc<dyn PaintWindow>) -> Self {
        let device = gfx.device();
        let direct = window.owns_presentation() && !window.is_translucent();
        Self {
            gfx,
            window,
            device,
            swap_chain: None,
            bitmap: None,
            direct,
            needs_full_repaint: false,
            device_lost: false,
        }
    }

    pub fn window(&self) -> &Rc<dyn PaintWindow> {
        &self.window
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn device_lost(&self) -> bool {
        self.device_lost
    }

    pub fn needs_full_repaint(&self) -> bool {
        self.needs_full_repaint
    }

    fn window_size(&self) -> SurfaceSize {
        let g = self.window.geometry();
        SurfaceSize::new(g.width().max(1) as u32, g.height().max(1) as u32)
    }

    /// Re-evaluates direct vs indirect mode. A flip invalidates the
    /// back-buffer bitmap (and the swap chain when leaving direct mode).
    fn update_mode(&mut self) {
        let direct = self.window.owns_presentation() && !self.window.is_translucent();
        if direct == self.direct {
            return;
        }
        debug!(direct, "rendering mode changed");
        self.direct = direct;
        self.bitmap = None;
        if !direct {
            self.swap_chain = None;
        }
    }

    /// Creates the swap chain sized to the window's current geometry.
    pub fn setup_swap_chain(&mut self) -> bool {
        if self.device_lost {
            return false;
        }
        let Some(device) = self.device.clone() else {
            return false;
        };
        let size = self.window_size();
        match device.create_swap_chain(self.window.raw_window_handle(), size, AlphaMode::Ignore) {
            Ok(sc) => {
                self.swap_chain = Some(sc);
                self.needs_full_repaint = true;
                true
            }
            Err(err) => {
                warn!(%err, "swap chain creation failed");
                if err.is_device_loss() {
                    self.note_device_lost();
                }
                false
            }
        }
    }

    /// Destructively resizes the swap chain buffers. The back-buffer
    /// bitmap is released first: nothing referencing the buffer may
    /// outlive this call.
    pub fn resize_swap_chain(&mut self, size: SurfaceSize) -> bool {
        if self.device_lost {
            return false;
        }
        self.bitmap = None;
        let Some(sc) = self.swap_chain.as_mut() else {
            return false;
        };
        match sc.resize_buffers(size) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "swap chain resize failed");
                if err.is_device_loss() {
                    self.note_device_lost();
                }
                false
            }
        }
    }

    /// Lazily (re)creates the back-buffer bitmap: a wrap of the swap
    /// chain's buffer for direct windows, a GDI-compatible texture for
    /// translucent ones. Sets the full-repaint flag on creation.
    pub fn setup_bitmap(&mut self) -> bool {
        self.update_mode();
        if self.device_lost {
            return false;
        }
        if self.bitmap.as_ref().is_some_and(Bitmap::is_valid) {
            return true;
        }
        let Some(device) = self.device.clone() else {
            return false;
        };
        let Some(mut bitmap) = Bitmap::new(&device) else {
            return false;
        };
        let ok = if self.direct {
            if self.swap_chain.is_none() && !self.setup_swap_chain() {
                return false;
            }
            match self.swap_chain.as_ref().map(|sc| sc.back_buffer()) {
                Some(Ok(texel)) => bitmap.wrap_external(texel.as_ref(), true, AlphaMode::Ignore),
                Some(Err(err)) => {
                    warn!(%err, "back buffer retrieval failed");
                    if err.is_device_loss() {
                        self.note_device_lost();
                    }
                    false
                }
                None => false,
            }
        } else {
            bitmap.resize_with(
                self.window_size(),
                AlphaMode::Premultiplied,
                SurfaceFlags::TARGET | SurfaceFlags::GDI_COMPATIBLE,
            )
        };
        if ok {
            self.bitmap = Some(bitmap);
            self.needs_full_repaint = true;
        }
        ok
    }

    pub fn bitmap(&mut self) -> Option<&mut Bitmap> {
        if !self.setup_bitmap() {
            return None;
        }
        self.bitmap.as_mut()
    }

    /// Draws `source` into the back buffer. `region` is in window
    /// coordinates; `offset` maps window coordinates into `source`.
    /// The first flush after any back-buffer recreation draws the full
    /// window area regardless of `region`.
    pub fn flush(&mut self, source: &mut Bitmap, region: &DirtyRegion, offset: Vector2D<i32>) {
        if self.device_lost || !self.setup_bitmap() {
            return;
        }
        let Some(src_surface) = source.surface().cloned() else {
            return;
        };
        // drawing the back buffer into itself would be a no-op
        if let Some(own) = self.bitmap.as_ref().and_then(Bitmap::surface) {
            if Rc::ptr_eq(own, &src_surface) {
                return;
            }
        }
        let bounds = PixelRect::from_size(self.window_size().to_i32());
        let Some(target) = self.bitmap.as_mut() else {
            return;
        };
        let scope = target.scope();
        scope.begin();
        // a region already covering the window takes the full-area path
        // too, skipping the per-rect clips
        if self.needs_full_repaint || region.covers(bounds) {
            let dst = bounds.to_f32();
            let src = bounds.translate(offset).to_f32();
            scope.ctx().draw_surface(&src_surface, dst, src);
            self.needs_full_repaint = false;
        } else {
            for rect in region.clipped(bounds).iter() {
                let dst = rect.to_f32();
                let src = rect.translate(offset).to_f32();
                scope.ctx().push_clip(dst);
                scope.ctx().draw_surface(&src_surface, dst, src);
                scope.ctx().pop_clip();
            }
        }
        let outcome = scope.end();
        if outcome == EndDrawOutcome::DeviceLost {
            self.note_device_lost();
        }
    }

    /// Pushes the back buffer to the screen: swap-chain present with
    /// interval 0 for direct windows, a per-pixel-alpha layered-window
    /// update for translucent ones.
    pub fn present(&mut self, _region: &DirtyRegion) {
        if self.device_lost {
            return;
        }
        self.update_mode();
        if self.direct {
            let Some(sc) = self.swap_chain.as_mut() else {
                return;
            };
            match sc.present(false) {
                Ok(()) => {}
                Err(err) if err.is_device_loss() => {
                    warn!(%err, "present failed with device loss");
                    self.note_device_lost();
                }
                Err(err) => warn!(%err, "present failed"),
            }
        } else {
            self.present_layered();
        }
    }

    fn present_layered(&mut self) {
        let Some(device) = self.device.clone() else {
            return;
        };
        let Some(surface) = self.bitmap.as_ref().and_then(Bitmap::surface).cloned() else {
            return;
        };
        match surface.acquire_dc() {
            Ok(dc) => {
                if let Err(err) =
                    device.update_layered_window(self.window.raw_window_handle(), dc, surface.size())
                {
                    warn!(%err, "layered window update failed");
                }
                if let Err(err) = surface.release_dc() {
                    warn!(%err, "ReleaseDC on back buffer failed");
                }
            }
            Err(err) => warn!(%err, "GetDC on back buffer failed"),
        }
    }

    /// GPU-side snapshot of the current back buffer, used for
    /// cross-window flushes and content preservation across resizes.
    pub fn copy_back_buffer(&mut self) -> Option<Bitmap> {
        let device = self.device.clone()?;
        let src = self.bitmap.as_ref().filter(|b| b.is_valid())?;
        let size = src.size();
        let mut copy = Bitmap::new(&device)?;
        if !copy.resize(size)
            || !copy.copy_from_bitmap(src, SurfaceRect::from_size(size), SurfacePoint::origin())
        {
            return None;
        }
        Some(copy)
    }

    /// Rebuilds everything tied to the lost device. The caller must
    /// have run [`GraphicsDevice::reset`] first; the bitmap itself is
    /// rebuilt lazily on the next flush, and secondary caches died with
    /// the dropped draw context.
    pub fn reset_device_dependent_resources(&mut self) -> bool {
        self.bitmap = None;
        self.swap_chain = None;
        self.device_lost = false;
        self.device = self.gfx.device();
        if self.device.is_none() {
            warn!("no gpu device available after reset");
            return false;
        }
        self.update_mode();
        if self.direct {
            self.setup_swap_chain()
        } else {
            true
        }
    }

    /// Latches the loss and posts the event; at most one per episode.
    pub(crate) fn note_device_lost(&mut self) {
        if self.device_lost {
            return;
        }
        self.device_lost = true;
        self.window.post_device_lost();
    }
}
