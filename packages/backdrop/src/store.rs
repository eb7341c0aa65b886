//! Toolkit-facing backing stores.
//!
//! Two strategies behind one trait, picked at window-creation time:
//! windows that own swap-chain presentation get
//! [`SwapChainBackingStore`]; child/embedded windows get
//! [`BlitBackingStore`], which pushes pixels through raw OS device
//! contexts instead.

use std::rc::Rc;
use std::sync::Arc;

use backdrop_hal::{
    AlphaMode, Color, GpuDevice, OsDcHandle, PixelBuffer, PixelPoint, PixelRect, StagingStore,
    SurfaceFlags, SurfacePoint, SurfaceRect, SurfaceSize,
};
use euclid::default::Vector2D;
use tracing::{debug, warn};

use crate::bitmap::Bitmap;
use crate::device::GraphicsDevice;
use crate::region::DirtyRegion;
use crate::scope::EndDrawOutcome;
use crate::window::{PaintWindow, WindowTarget};

pub trait BackingStore {
    /// Opens the paint bitmap's draw scope and clears the dirty region
    /// to fully transparent with source-replace compositing. Returns
    /// `false` when no bitmap could be obtained.
    fn begin_paint(&mut self, region: &DirtyRegion) -> bool;

    /// Closes the draw scope. A confirmed device loss is posted to the
    /// window from here.
    fn end_paint(&mut self);

    /// Composites the painted region to screen. `target` other than
    /// the owning window promotes the content to that window instead
    /// (cross-window render). `offset` maps window coordinates into the
    /// paint bitmap.
    fn flush(&mut self, target: Option<&mut WindowTarget>, region: &DirtyRegion, offset: Vector2D<i32>);

    /// Destructive resize; `preserve` rects are copied across
    /// best-effort when non-empty.
    fn resize(&mut self, size: SurfaceSize, preserve: &DirtyRegion);

    fn to_image(&mut self) -> Option<PixelBuffer>;

    /// Paint bitmap for the client to draw through between
    /// `begin_paint` and `end_paint`.
    fn bitmap(&mut self) -> Option<&mut Bitmap>;

    /// Drops every resource tied to the lost device, paint bitmap
    /// included, so the next paint rebuilds on the current one. The
    /// caller has already run [`GraphicsDevice::reset`].
    fn reset_device_dependent_resources(&mut self) -> bool;
}

/// Picks the store strategy from the window's presentation ownership.
pub fn create_backing_store(
    gfx: Arc<GraphicsDevice>,
    window: Rc<dyn PaintWindow>,
) -> Box<dyn BackingStore> {
    if window.owns_presentation() {
        Box::new(SwapChainBackingStore::new(gfx, window))
    } else {
        Box::new(BlitBackingStore::new(gfx, window))
    }
}

fn clear_dirty_region(bitmap: &mut Bitmap, region: &DirtyRegion) {
    let scope = bitmap.scope();
    scope.begin();
    for rect in region.iter() {
        let rect = rect.to_f32();
        scope.ctx().push_clip(rect);
        scope.ctx().clear(Some(rect), Color::TRANSPARENT);
        scope.ctx().pop_clip();
    }
}

fn snapshot_bitmap(device: &Arc<dyn GpuDevice>, src: &Bitmap) -> Option<Bitmap> {
    let size = src.size();
    let mut copy = Bitmap::new(device)?;
    if !copy.resize(size)
        || !copy.copy_from_bitmap(src, SurfaceRect::from_size(size), SurfacePoint::origin())
    {
        return None;
    }
    Some(copy)
}

fn restore_preserved(pixmap: &mut Bitmap, snapshot: &Bitmap, preserve: &DirtyRegion) {
    let old = PixelRect::from_size(snapshot.size().to_i32());
    let new = PixelRect::from_size(pixmap.size().to_i32());
    for rect in preserve.clipped(old).clipped(new).iter() {
        let src = SurfaceRect::new(
            SurfacePoint::new(rect.min.x as u32, rect.min.y as u32),
            SurfacePoint::new(rect.max.x as u32, rect.max.y as u32),
        );
        pixmap.copy_from_bitmap(snapshot, src, src.min);
    }
}

/// Backing store for windows presenting through their own swap chain.
pub struct SwapChainBackingStore {
    gfx: Arc<GraphicsDevice>,
    target: WindowTarget,
    pixmap: Option<Bitmap>,
}

impl SwapChainBackingStore {
    pub fn new(gfx: Arc<GraphicsDevice>, window: Rc<dyn PaintWindow>) -> Self {
        let target = WindowTarget::new(gfx.clone(), window);
        Self { gfx, target, pixmap: None }
    }

    pub fn window_target(&mut self) -> &mut WindowTarget {
        &mut self.target
    }

    fn ensure_pixmap(&mut self) -> bool {
        if self.pixmap.as_ref().is_some_and(Bitmap::is_valid) {
            return true;
        }
        let Some(device) = self.gfx.device() else {
            return false;
        };
        let g = self.target.window().geometry();
        let size = SurfaceSize::new(g.width().max(1) as u32, g.height().max(1) as u32);
        let Some(mut pixmap) = Bitmap::new(&device) else {
            return false;
        };
        if !pixmap.resize(size) {
            return false;
        }
        self.pixmap = Some(pixmap);
        true
    }
}

impl BackingStore for SwapChainBackingStore {
    fn begin_paint(&mut self, region: &DirtyRegion) -> bool {
        if !self.ensure_pixmap() {
            return false;
        }
        let Some(pixmap) = self.pixmap.as_mut() else {
            return false;
        };
        clear_dirty_region(pixmap, region);
        true
    }

    fn end_paint(&mut self) {
        let Some(pixmap) = self.pixmap.as_mut() else {
            return;
        };
        if pixmap.scope().end() == EndDrawOutcome::DeviceLost {
            self.target.note_device_lost();
        }
    }

    fn flush(&mut self, target: Option<&mut WindowTarget>, region: &DirtyRegion, offset: Vector2D<i32>) {
        match target {
            Some(other) if !Rc::ptr_eq(other.window(), self.target.window()) => {
                // promote the current back buffer to the other window
                let Some(mut copy) = self.target.copy_back_buffer() else {
                    debug!("cross-window flush with no back buffer to copy");
                    return;
                };
                other.flush(&mut copy, region, offset);
                other.present(region);
            }
            _ => {
                let Some(pixmap) = self.pixmap.as_mut() else {
                    return;
                };
                self.target.flush(pixmap, region, offset);
                self.target.present(region);
            }
        }
    }

    fn resize(&mut self, size: SurfaceSize, preserve: &DirtyRegion) {
        let snapshot = match (&self.pixmap, self.gfx.device()) {
            (Some(pixmap), Some(device)) if !preserve.is_empty() && pixmap.is_valid() => {
                snapshot_bitmap(&device, pixmap)
            }
            _ => None,
        };
        self.target.resize_swap_chain(size);
        let resized = match self.pixmap.as_mut() {
            Some(pixmap) => pixmap.resize(size),
            None => false,
        };
        if let (true, Some(snapshot)) = (resized, snapshot) {
            if let Some(pixmap) = self.pixmap.as_mut() {
                restore_preserved(pixmap, &snapshot, preserve);
            }
        }
    }

    fn to_image(&mut self) -> Option<PixelBuffer> {
        self.pixmap.as_mut()?.to_image(SurfaceRect::zero())
    }

    fn bitmap(&mut self) -> Option<&mut Bitmap> {
        self.pixmap.as_mut()
    }

    fn reset_device_dependent_resources(&mut self) -> bool {
        // the paint bitmap holds a surface and draw context from the
        // dead device; ensure_pixmap would happily reuse them
        self.pixmap = None;
        self.target.reset_device_dependent_resources()
    }
}

/// Backing store for windows without swap-chain presentation. Blits
/// through the GPU surface's GDI DC when the platform bridge works, or
/// through a CPU staging store when the one-time probe found it broken.
pub struct BlitBackingStore {
    gfx: Arc<GraphicsDevice>,
    window: Rc<dyn PaintWindow>,
    pixmap: Option<Bitmap>,
    // staging DIB for the manual path, recreated only when the image
    // dimensions change
    staging: Option<Box<dyn StagingStore>>,
    device_lost: bool,
}

impl BlitBackingStore {
    pub fn new(gfx: Arc<GraphicsDevice>, window: Rc<dyn PaintWindow>) -> Self {
        Self {
            gfx,
            window,
            pixmap: None,
            staging: None,
            device_lost: false,
        }
    }

    fn window_size(&self) -> SurfaceSize {
        let g = self.window.geometry();
        SurfaceSize::new(g.width().max(1) as u32, g.height().max(1) as u32)
    }

    fn ensure_pixmap(&mut self) -> bool {
        if self.pixmap.as_ref().is_some_and(Bitmap::is_valid) {
            return true;
        }
        let Some(device) = self.gfx.device() else {
            return false;
        };
        let Some(mut pixmap) = Bitmap::new(&device) else {
            return false;
        };
        if !pixmap.resize_with(
            self.window_size(),
            AlphaMode::Premultiplied,
            SurfaceFlags::TARGET | SurfaceFlags::GDI_COMPATIBLE,
        ) {
            return false;
        }
        self.pixmap = Some(pixmap);
        true
    }

    fn note_device_lost(&mut self) {
        if self.device_lost {
            return;
        }
        self.device_lost = true;
        self.window.post_device_lost();
    }

    /// Renders a solid color through the GPU-surface DC and checks what
    /// comes out the other side. All-zero read-back is the fingerprint
    /// of a broken driver bridge.
    fn probe_bridge(device: &Arc<dyn GpuDevice>) -> bool {
        let Some(mut probe) = Bitmap::new(device) else {
            return false;
        };
        if !probe.resize_with(
            SurfaceSize::new(1, 1),
            AlphaMode::Premultiplied,
            SurfaceFlags::TARGET | SurfaceFlags::GDI_COMPATIBLE,
        ) {
            return false;
        }
        if probe.fill(Color::WHITE) != EndDrawOutcome::Completed {
            return false;
        }
        let Some(surface) = probe.surface().cloned() else {
            return false;
        };
        let dc = match surface.acquire_dc() {
            Ok(dc) => dc,
            Err(err) => {
                warn!(%err, "bridge probe could not acquire a surface DC");
                return false;
            }
        };
        let staging = match device.create_staging(SurfaceSize::new(1, 1)) {
            Ok(staging) => staging,
            Err(err) => {
                warn!(%err, "bridge probe could not create a staging store");
                let _ = surface.release_dc();
                return false;
            }
        };
        let blit = device.blit(
            staging.dc(),
            PixelRect::from_size(euclid::default::Size2D::new(1, 1)),
            dc,
            PixelPoint::origin(),
        );
        if let Err(err) = surface.release_dc() {
            warn!(%err, "bridge probe could not release the surface DC");
        }
        if blit.is_err() {
            return false;
        }
        let broken = match staging.read_pixels() {
            Ok(pixels) => pixels.pixel(0, 0) == 0,
            Err(_) => false,
        };
        if broken {
            warn!("gpu surface to os dc bridge is broken, using the cpu copy path");
        }
        broken
    }

    /// Blit directly from the GPU surface's DC to the window DC.
    fn flush_fast(&mut self, region: &DirtyRegion, offset: Vector2D<i32>) {
        let Some(device) = self.gfx.device() else {
            return;
        };
        let Some(surface) = self.pixmap.as_ref().and_then(Bitmap::surface).cloned() else {
            return;
        };
        let src_dc = match surface.acquire_dc() {
            Ok(dc) => dc,
            Err(err) => {
                warn!(%err, "GetDC on paint bitmap failed");
                return;
            }
        };
        self.compose_to_window(&device, src_dc, region, offset);
        if let Err(err) = surface.release_dc() {
            warn!(%err, "ReleaseDC on paint bitmap failed");
        }
    }

    /// GPU read-back into the staging DIB, then blit that.
    fn flush_manual(&mut self, region: &DirtyRegion, offset: Vector2D<i32>) {
        let Some(device) = self.gfx.device() else {
            return;
        };
        let Some(image) = self.pixmap.as_mut().and_then(|p| p.to_image(SurfaceRect::zero()))
        else {
            return;
        };
        if self.staging.as_ref().is_none_or(|s| s.size() != image.size()) {
            self.staging = match device.create_staging(image.size()) {
                Ok(staging) => Some(staging),
                Err(err) => {
                    warn!(%err, "staging store creation failed");
                    None
                }
            };
        }
        let Some(staging) = self.staging.as_mut() else {
            return;
        };
        if let Err(err) = staging.write_pixels(PixelPoint::origin(), &image) {
            warn!(%err, "staging upload failed");
            return;
        }
        let src_dc = staging.dc();
        self.compose_to_window(&device, src_dc, region, offset);
    }

    fn compose_to_window(
        &self,
        device: &Arc<dyn GpuDevice>,
        src_dc: OsDcHandle,
        region: &DirtyRegion,
        offset: Vector2D<i32>,
    ) {
        let handle = self.window.raw_window_handle();
        if self.window.is_translucent() {
            if let Err(err) = device.update_layered_window(handle, src_dc, self.window_size()) {
                warn!(%err, "layered window update failed");
            }
            return;
        }
        let wnd_dc = match device.window_dc(handle) {
            Ok(dc) => dc,
            Err(err) => {
                warn!(%err, "GetDC on window failed");
                return;
            }
        };
        let bounds = PixelRect::from_size(self.window_size().to_i32());
        for rect in region.clipped(bounds).iter() {
            if let Err(err) = device.blit(wnd_dc, rect, src_dc, rect.min + offset) {
                warn!(%err, "BitBlt to window failed");
            }
        }
        if let Err(err) = device.release_window_dc(handle, wnd_dc) {
            warn!(%err, "ReleaseDC on window failed");
        }
    }
}

impl BackingStore for BlitBackingStore {
    fn begin_paint(&mut self, region: &DirtyRegion) -> bool {
        if !self.ensure_pixmap() {
            return false;
        }
        let Some(pixmap) = self.pixmap.as_mut() else {
            return false;
        };
        clear_dirty_region(pixmap, region);
        true
    }

    fn end_paint(&mut self) {
        let Some(pixmap) = self.pixmap.as_mut() else {
            return;
        };
        if pixmap.scope().end() == EndDrawOutcome::DeviceLost {
            self.note_device_lost();
        }
    }

    fn flush(&mut self, _target: Option<&mut WindowTarget>, region: &DirtyRegion, offset: Vector2D<i32>) {
        if self.device_lost || !self.ensure_pixmap() {
            return;
        }
        let Some(device) = self.gfx.device() else {
            return;
        };
        let broken = self.gfx.bridge_broken(|| Self::probe_bridge(&device));
        if broken {
            self.flush_manual(region, offset);
        } else {
            self.flush_fast(region, offset);
        }
    }

    fn resize(&mut self, size: SurfaceSize, preserve: &DirtyRegion) {
        let snapshot = match (&self.pixmap, self.gfx.device()) {
            (Some(pixmap), Some(device)) if !preserve.is_empty() && pixmap.is_valid() => {
                snapshot_bitmap(&device, pixmap)
            }
            _ => None,
        };
        let resized = match self.pixmap.as_mut() {
            Some(pixmap) => pixmap.resize_with(
                size,
                AlphaMode::Premultiplied,
                SurfaceFlags::TARGET | SurfaceFlags::GDI_COMPATIBLE,
            ),
            None => false,
        };
        // the staging DIB no longer matches the image dimensions
        self.staging = None;
        if let (true, Some(snapshot)) = (resized, snapshot) {
            if let Some(pixmap) = self.pixmap.as_mut() {
                restore_preserved(pixmap, &snapshot, preserve);
            }
        }
    }

    fn to_image(&mut self) -> Option<PixelBuffer> {
        self.pixmap.as_mut()?.to_image(SurfaceRect::zero())
    }

    fn bitmap(&mut self) -> Option<&mut Bitmap> {
        self.pixmap.as_mut()
    }

    fn reset_device_dependent_resources(&mut self) -> bool {
        self.pixmap = None;
        self.staging = None;
        self.device_lost = false;
        true
    }
}
