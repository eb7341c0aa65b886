//! Scriptable in-memory backend.
//!
//! Implements the full hardware boundary on plain `PixelBuffer`s so the
//! presentation core can be exercised on any platform. Failure modes
//! (device creation refusal, lost devices on present/resize, failing
//! end-draw, a broken GDI bridge) are injected through the
//! [`MockBackend`] handle, which can be cloned and kept by the test
//! while the core owns the device.

use std::any::Any;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use raw_window_handle::RawWindowHandle;
use rustc_hash::FxHashMap;

use crate::image::{pack_color, PixelBuffer, PixelFormat};
use crate::{
    AlphaMode, Color, DeviceOptions, DrawContext, DrawRect, DriverKind, ExternalSurface,
    GpuBackend, GpuDevice, GpuError, GpuResult, GpuSurface, OsDcHandle, PixelPoint, PixelRect,
    StagingStore, SurfaceFlags, SurfaceHandle, SurfacePoint, SurfaceRect, SurfaceSize, SwapChain,
    DEVICE_REMOVED, DEVICE_RESET, RECREATE_TARGET,
};

/// Snapshot of backend call counters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MockStats {
    pub devices: u32,
    pub contexts: u32,
    pub swap_chains: u32,
    pub surfaces: u32,
    pub staging: u32,
    pub begin_draw: u32,
    pub end_draw: u32,
    pub presents: u32,
    pub resizes: u32,
    pub blits: u32,
    pub layered_updates: u32,
    pub dc_acquires: u32,
}

/// One recorded draw-context operation.
#[derive(Debug, Clone, PartialEq)]
pub enum MockDrawOp {
    Clear { rect: Option<DrawRect> },
    Blit { dst: DrawRect, src: DrawRect },
}

struct Script {
    fail_hardware: bool,
    fail_software: bool,
    end_draw_failures: u32,
    end_draw_is_loss: bool,
    // armed by a loss-flagged end-draw failure; fails the next
    // surface allocation with D2DERR_RECREATE_TARGET
    probe_create_fails: bool,
    present_error: Option<u32>,
    resize_error: Option<u32>,
    dc_bridge_works: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_hardware: false,
            fail_software: false,
            end_draw_failures: 0,
            end_draw_is_loss: false,
            probe_create_fails: false,
            present_error: None,
            resize_error: None,
            dc_bridge_works: true,
        }
    }
}

#[derive(Default)]
struct Counters {
    devices: AtomicU32,
    contexts: AtomicU32,
    swap_chains: AtomicU32,
    surfaces: AtomicU32,
    staging: AtomicU32,
    begin_draw: AtomicU32,
    end_draw: AtomicU32,
    presents: AtomicU32,
    resizes: AtomicU32,
    blits: AtomicU32,
    layered_updates: AtomicU32,
    dc_acquires: AtomicU32,
}

struct DcBuffer {
    pixels: PixelBuffer,
}

struct Shared {
    script: Mutex<Script>,
    counters: Counters,
    draw_ops: Mutex<Vec<MockDrawOp>>,
    dcs: Mutex<FxHashMap<isize, DcBuffer>>,
    next_dc: AtomicIsize,
}

impl Shared {
    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    fn dcs(&self) -> MutexGuard<'_, FxHashMap<isize, DcBuffer>> {
        self.dcs.lock().unwrap()
    }

    fn alloc_dc(&self, pixels: PixelBuffer) -> OsDcHandle {
        let id = self.next_dc.fetch_add(1, Ordering::Relaxed);
        self.dcs().insert(id, DcBuffer { pixels });
        OsDcHandle(id)
    }
}

#[derive(Clone)]
pub struct MockBackend {
    shared: Arc<Shared>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::default(),
                counters: Counters::default(),
                draw_ops: Mutex::default(),
                dcs: Mutex::default(),
                next_dc: AtomicIsize::new(0x1000),
            }),
        }
    }

    pub fn fail_hardware(&self, on: bool) {
        self.shared.script().fail_hardware = on;
    }

    pub fn fail_software(&self, on: bool) {
        self.shared.script().fail_software = on;
    }

    /// The next `end_draw` fails. With `device_lost` the subsequent
    /// surface allocation fails with `D2DERR_RECREATE_TARGET`, which is
    /// how a lost device actually surfaces after a bad end-draw; the
    /// device stays dead from then on.
    pub fn fail_next_end_draw(&self, device_lost: bool) {
        let mut s = self.shared.script();
        s.end_draw_failures += 1;
        s.end_draw_is_loss = device_lost;
    }

    /// HRESULT returned by the next present (`DEVICE_REMOVED` etc).
    pub fn set_present_error(&self, code: Option<u32>) {
        self.shared.script().present_error = code;
    }

    pub fn set_resize_error(&self, code: Option<u32>) {
        self.shared.script().resize_error = code;
    }

    /// When false, DCs acquired from surfaces read back all zeroes,
    /// mimicking drivers whose GDI interop is broken.
    pub fn set_dc_bridge(&self, works: bool) {
        self.shared.script().dc_bridge_works = works;
    }

    pub fn stats(&self) -> MockStats {
        let c = &self.shared.counters;
        let get = |a: &AtomicU32| a.load(Ordering::Relaxed);
        MockStats {
            devices: get(&c.devices),
            contexts: get(&c.contexts),
            swap_chains: get(&c.swap_chains),
            surfaces: get(&c.surfaces),
            staging: get(&c.staging),
            begin_draw: get(&c.begin_draw),
            end_draw: get(&c.end_draw),
            presents: get(&c.presents),
            resizes: get(&c.resizes),
            blits: get(&c.blits),
            layered_updates: get(&c.layered_updates),
            dc_acquires: get(&c.dc_acquires),
        }
    }

    /// Drains the recorded clear/blit operations.
    pub fn take_draw_ops(&self) -> Vec<MockDrawOp> {
        std::mem::take(&mut self.shared.draw_ops.lock().unwrap())
    }
}

impl GpuBackend for MockBackend {
    fn create_device(
        &self,
        driver: DriverKind,
        _options: &DeviceOptions,
    ) -> GpuResult<Arc<dyn GpuDevice>> {
        {
            let s = self.shared.script();
            let refused = match driver {
                DriverKind::Hardware => s.fail_hardware,
                DriverKind::Software => s.fail_software,
            };
            if refused {
                return Err(GpuError::CreateFailed {
                    call: "D3D11CreateDevice",
                    code: 0x887A_0004, // DXGI_ERROR_UNSUPPORTED
                });
            }
        }
        self.shared.counters.devices.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockDevice {
            shared: self.shared.clone(),
            driver,
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

fn loss_error(code: u32) -> GpuError {
    if code == DEVICE_RESET {
        GpuError::DeviceReset { code }
    } else {
        GpuError::DeviceRemoved { code }
    }
}

fn stale_error() -> GpuError {
    GpuError::DeviceRemoved { code: DEVICE_REMOVED }
}

struct MockDevice {
    shared: Arc<Shared>,
    driver: DriverKind,
    // cleared when a scripted loss is delivered through a resource of
    // this device; everything created on it then refuses further work,
    // as it would on real hardware
    alive: Arc<AtomicBool>,
}

impl GpuDevice for MockDevice {
    fn driver(&self) -> DriverKind {
        self.driver
    }

    fn create_draw_context(&self) -> GpuResult<Box<dyn DrawContext>> {
        self.shared.counters.contexts.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockDrawContext {
            shared: self.shared.clone(),
            alive: self.alive.clone(),
            target: None,
            drawing: false,
            clips: Vec::new(),
        }))
    }

    fn create_swap_chain(
        &self,
        _window: RawWindowHandle,
        size: SurfaceSize,
        _alpha: AlphaMode,
    ) -> GpuResult<Box<dyn SwapChain>> {
        self.shared.counters.swap_chains.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockSwapChain {
            shared: self.shared.clone(),
            alive: self.alive.clone(),
            store: Arc::new(SurfaceStore::new(size)),
        }))
    }

    fn create_staging(&self, size: SurfaceSize) -> GpuResult<Box<dyn StagingStore>> {
        self.shared.counters.staging.fetch_add(1, Ordering::Relaxed);
        let pixels = PixelBuffer::new(size.width, size.height, PixelFormat::Argb32Premultiplied);
        let dc = self.shared.alloc_dc(pixels);
        Ok(Box::new(MockStaging { shared: self.shared.clone(), dc, size }))
    }

    fn window_dc(&self, _window: RawWindowHandle) -> GpuResult<OsDcHandle> {
        let pixels = PixelBuffer::new(1024, 1024, PixelFormat::Argb32Premultiplied);
        Ok(self.shared.alloc_dc(pixels))
    }

    fn release_window_dc(&self, _window: RawWindowHandle, dc: OsDcHandle) -> GpuResult<()> {
        self.shared.dcs().remove(&dc.0);
        Ok(())
    }

    fn blit(
        &self,
        dst: OsDcHandle,
        dst_rect: PixelRect,
        src: OsDcHandle,
        src_origin: PixelPoint,
    ) -> GpuResult<()> {
        let patch = {
            let dcs = self.shared.dcs();
            let src_buf = dcs.get(&src.0).ok_or(GpuError::Interop("BitBlt: bad source DC"))?;
            let rect = SurfaceRect::new(
                SurfacePoint::new(src_origin.x.max(0) as u32, src_origin.y.max(0) as u32),
                SurfacePoint::new(
                    (src_origin.x + dst_rect.width()).max(0) as u32,
                    (src_origin.y + dst_rect.height()).max(0) as u32,
                ),
            );
            src_buf.pixels.copy_rect(rect)
        };
        let mut dcs = self.shared.dcs();
        let dst_buf = dcs.get_mut(&dst.0).ok_or(GpuError::Interop("BitBlt: bad target DC"))?;
        dst_buf
            .pixels
            .blit_from(&patch, dst_rect.min.x.max(0) as u32, dst_rect.min.y.max(0) as u32);
        self.shared.counters.blits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn update_layered_window(
        &self,
        _window: RawWindowHandle,
        src: OsDcHandle,
        _size: SurfaceSize,
    ) -> GpuResult<()> {
        if !self.shared.dcs().contains_key(&src.0) {
            return Err(GpuError::Interop("UpdateLayeredWindow: bad source DC"));
        }
        self.shared.counters.layered_updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Pixel store shared between a surface handle, the swap chain that
/// owns it, and any wrap of its back buffer.
struct SurfaceStore {
    pixels: Mutex<PixelBuffer>,
}

impl SurfaceStore {
    fn new(size: SurfaceSize) -> Self {
        Self {
            pixels: Mutex::new(PixelBuffer::new(
                size.width,
                size.height,
                PixelFormat::Argb32Premultiplied,
            )),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PixelBuffer> {
        self.pixels.lock().unwrap()
    }
}

struct MockSurface {
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
    store: Arc<SurfaceStore>,
    alpha: AlphaMode,
    flags: SurfaceFlags,
    dc: Mutex<Option<OsDcHandle>>,
}

impl MockSurface {
    fn check_alive(&self) -> GpuResult<()> {
        if self.alive.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(stale_error())
        }
    }
}

impl GpuSurface for MockSurface {
    fn size(&self) -> SurfaceSize {
        self.store.lock().size()
    }

    fn alpha_mode(&self) -> AlphaMode {
        self.alpha
    }

    fn flags(&self) -> SurfaceFlags {
        self.flags
    }

    fn copy_from(
        &self,
        src: &dyn GpuSurface,
        dst_origin: SurfacePoint,
        src_rect: SurfaceRect,
    ) -> GpuResult<()> {
        self.check_alive()?;
        let src = src
            .as_any()
            .downcast_ref::<MockSurface>()
            .ok_or(GpuError::Unsupported("foreign surface"))?;
        let patch = src.store.lock().copy_rect(src_rect);
        self.store.lock().blit_from(&patch, dst_origin.x, dst_origin.y);
        Ok(())
    }

    fn acquire_dc(&self) -> GpuResult<OsDcHandle> {
        self.check_alive()?;
        if !self.flags.contains(SurfaceFlags::GDI_COMPATIBLE) {
            return Err(GpuError::Unsupported("surface is not GDI compatible"));
        }
        let pixels = self.store.lock().clone();
        let snapshot = if self.shared.script().dc_bridge_works {
            pixels
        } else {
            PixelBuffer::new(pixels.width(), pixels.height(), PixelFormat::Argb32Premultiplied)
        };
        let dc = self.shared.alloc_dc(snapshot);
        *self.dc.lock().unwrap() = Some(dc);
        self.shared.counters.dc_acquires.fetch_add(1, Ordering::Relaxed);
        Ok(dc)
    }

    fn release_dc(&self) -> GpuResult<()> {
        let dc = self
            .dc
            .lock()
            .unwrap()
            .take()
            .ok_or(GpuError::Interop("ReleaseDC without GetDC"))?;
        // GDI writes made through the DC flow back into the surface
        if let Some(buf) = self.shared.dcs().remove(&dc.0) {
            if self.shared.script().dc_bridge_works {
                *self.store.lock() = buf.pixels;
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MockTexel {
    store: Arc<SurfaceStore>,
}

impl ExternalSurface for MockTexel {
    fn size(&self) -> SurfaceSize {
        self.store.lock().size()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct MockSwapChain {
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
    store: Arc<SurfaceStore>,
}

impl SwapChain for MockSwapChain {
    fn size(&self) -> SurfaceSize {
        self.store.lock().size()
    }

    fn back_buffer(&self) -> GpuResult<Box<dyn ExternalSurface>> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(stale_error());
        }
        Ok(Box::new(MockTexel { store: self.store.clone() }))
    }

    fn resize_buffers(&mut self, size: SurfaceSize) -> GpuResult<()> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(stale_error());
        }
        if let Some(code) = self.shared.script().resize_error.take() {
            self.alive.store(false, Ordering::Relaxed);
            return Err(loss_error(code));
        }
        // Mirrors ResizeBuffers failing with E_INVALIDARG while buffer
        // references are alive.
        if Arc::strong_count(&self.store) > 1 {
            return Err(GpuError::Interop("ResizeBuffers with outstanding buffer references"));
        }
        self.shared.counters.resizes.fetch_add(1, Ordering::Relaxed);
        *self.store.lock() =
            PixelBuffer::new(size.width, size.height, PixelFormat::Argb32Premultiplied);
        Ok(())
    }

    fn present(&mut self, _sync: bool) -> GpuResult<()> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(stale_error());
        }
        if let Some(code) = self.shared.script().present_error.take() {
            self.alive.store(false, Ordering::Relaxed);
            return Err(loss_error(code));
        }
        self.shared.counters.presents.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct MockStaging {
    shared: Arc<Shared>,
    dc: OsDcHandle,
    size: SurfaceSize,
}

impl StagingStore for MockStaging {
    fn size(&self) -> SurfaceSize {
        self.size
    }

    fn dc(&self) -> OsDcHandle {
        self.dc
    }

    fn write_pixels(&mut self, origin: PixelPoint, image: &PixelBuffer) -> GpuResult<()> {
        let mut dcs = self.shared.dcs();
        let buf = dcs.get_mut(&self.dc.0).ok_or(GpuError::Interop("staging DC released"))?;
        let pm = image.convert_to(PixelFormat::Argb32Premultiplied);
        buf.pixels.blit_from(&pm, origin.x.max(0) as u32, origin.y.max(0) as u32);
        Ok(())
    }

    fn read_pixels(&self) -> GpuResult<PixelBuffer> {
        let dcs = self.shared.dcs();
        let buf = dcs.get(&self.dc.0).ok_or(GpuError::Interop("staging DC released"))?;
        Ok(buf.pixels.clone())
    }
}

impl Drop for MockStaging {
    fn drop(&mut self) {
        self.shared.dcs().remove(&self.dc.0);
    }
}

struct MockDrawContext {
    shared: Arc<Shared>,
    alive: Arc<AtomicBool>,
    target: Option<Arc<SurfaceStore>>,
    drawing: bool,
    clips: Vec<DrawRect>,
}

impl MockDrawContext {
    fn log(&self, op: MockDrawOp) {
        self.shared.draw_ops.lock().unwrap().push(op);
    }

    fn clip_rect(&self, rect: DrawRect) -> Option<DrawRect> {
        self.clips
            .iter()
            .try_fold(rect, |acc, clip| acc.intersection(clip))
    }

    fn store_of(surface: &SurfaceHandle) -> GpuResult<Arc<SurfaceStore>> {
        surface
            .as_any()
            .downcast_ref::<MockSurface>()
            .map(|s| s.store.clone())
            .ok_or(GpuError::Unsupported("foreign surface"))
    }
}

impl DrawContext for MockDrawContext {
    fn create_surface(
        &mut self,
        size: SurfaceSize,
        alpha: AlphaMode,
        flags: SurfaceFlags,
    ) -> GpuResult<SurfaceHandle> {
        {
            let mut s = self.shared.script();
            if s.probe_create_fails {
                s.probe_create_fails = false;
                // the allocation failure that confirms the loss also
                // seals this device's fate
                self.alive.store(false, Ordering::Relaxed);
                return Err(GpuError::CreateFailed {
                    call: "CreateBitmap",
                    code: RECREATE_TARGET,
                });
            }
        }
        if !self.alive.load(Ordering::Relaxed) {
            return Err(stale_error());
        }
        self.shared.counters.surfaces.fetch_add(1, Ordering::Relaxed);
        Ok(Rc::new(MockSurface {
            shared: self.shared.clone(),
            alive: self.alive.clone(),
            store: Arc::new(SurfaceStore::new(size)),
            alpha,
            flags,
            dc: Mutex::new(None),
        }))
    }

    fn create_surface_with_pixels(
        &mut self,
        image: &PixelBuffer,
        alpha: AlphaMode,
        flags: SurfaceFlags,
    ) -> GpuResult<SurfaceHandle> {
        let surface = self.create_surface(image.size(), alpha, flags)?;
        let store = Self::store_of(&surface)?;
        *store.lock() = image.convert_to(PixelFormat::Argb32Premultiplied);
        Ok(surface)
    }

    fn wrap_external(
        &mut self,
        texel: &dyn ExternalSurface,
        alpha: AlphaMode,
    ) -> GpuResult<SurfaceHandle> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(stale_error());
        }
        let texel = texel
            .as_any()
            .downcast_ref::<MockTexel>()
            .ok_or(GpuError::Unsupported("foreign texel"))?;
        Ok(Rc::new(MockSurface {
            shared: self.shared.clone(),
            alive: self.alive.clone(),
            store: texel.store.clone(),
            alpha,
            flags: SurfaceFlags::TARGET,
            dc: Mutex::new(None),
        }))
    }

    fn set_target(&mut self, surface: Option<&SurfaceHandle>) {
        self.target = surface.and_then(|s| Self::store_of(s).ok());
    }

    fn begin_draw(&mut self) {
        self.shared.counters.begin_draw.fetch_add(1, Ordering::Relaxed);
        self.drawing = true;
    }

    fn end_draw(&mut self) -> GpuResult<()> {
        self.shared.counters.end_draw.fetch_add(1, Ordering::Relaxed);
        self.drawing = false;
        if !self.alive.load(Ordering::Relaxed) {
            return Err(GpuError::EndDraw { code: RECREATE_TARGET, tag1: 0, tag2: 0 });
        }
        let mut s = self.shared.script();
        if s.end_draw_failures > 0 {
            s.end_draw_failures -= 1;
            if s.end_draw_is_loss {
                s.probe_create_fails = true;
            }
            return Err(GpuError::EndDraw { code: 0x8000_4005, tag1: 7, tag2: 3 });
        }
        Ok(())
    }

    fn clear(&mut self, rect: Option<DrawRect>, color: Color) {
        if !self.alive.load(Ordering::Relaxed) {
            return;
        }
        self.log(MockDrawOp::Clear { rect });
        let Some(target) = &self.target else { return };
        let mut pixels = target.lock();
        let full = DrawRect::from_size(pixels.size().to_f32());
        let rect = match self.clip_rect(rect.unwrap_or(full)).and_then(|r| r.intersection(&full)) {
            Some(r) => r,
            None => return,
        };
        let px = pack_color(color);
        for y in rect.min.y as u32..rect.max.y as u32 {
            for x in rect.min.x as u32..rect.max.x as u32 {
                pixels.set_pixel(x, y, px);
            }
        }
    }

    fn push_clip(&mut self, rect: DrawRect) {
        self.clips.push(rect);
    }

    fn pop_clip(&mut self) {
        self.clips.pop();
    }

    fn draw_surface(&mut self, src: &SurfaceHandle, dst: DrawRect, src_rect: DrawRect) {
        if !self.alive.load(Ordering::Relaxed) {
            return;
        }
        self.log(MockDrawOp::Blit { dst, src: src_rect });
        let (Some(target), Ok(store)) = (&self.target, Self::store_of(src)) else {
            return;
        };
        let rect = SurfaceRect::new(
            SurfacePoint::new(src_rect.min.x.max(0.0) as u32, src_rect.min.y.max(0.0) as u32),
            SurfacePoint::new(src_rect.max.x.max(0.0) as u32, src_rect.max.y.max(0.0) as u32),
        );
        let patch = store.lock().copy_rect(rect);
        target
            .lock()
            .blit_from(&patch, dst.min.x.max(0.0) as u32, dst.min.y.max(0.0) as u32);
    }

    fn read_pixels(&mut self, src: &SurfaceHandle, rect: SurfaceRect) -> GpuResult<PixelBuffer> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(stale_error());
        }
        let store = Self::store_of(src)?;
        let out = store.lock().copy_rect(rect);
        Ok(out)
    }

    fn write_pixels(
        &mut self,
        dst: &SurfaceHandle,
        origin: SurfacePoint,
        image: &PixelBuffer,
    ) -> GpuResult<()> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(stale_error());
        }
        let store = Self::store_of(dst)?;
        let pm = image.convert_to(PixelFormat::Argb32Premultiplied);
        store.lock().blit_from(&pm, origin.x, origin.y);
        Ok(())
    }

    fn flush(&mut self) -> GpuResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> (MockBackend, Arc<dyn GpuDevice>) {
        let backend = MockBackend::new();
        let device = backend
            .create_device(DriverKind::Hardware, &DeviceOptions::default())
            .unwrap();
        (backend, device)
    }

    #[test]
    fn hardware_refusal_is_scriptable() {
        let backend = MockBackend::new();
        backend.fail_hardware(true);
        assert!(backend
            .create_device(DriverKind::Hardware, &DeviceOptions::default())
            .is_err());
        assert!(backend
            .create_device(DriverKind::Software, &DeviceOptions::default())
            .is_ok());
    }

    #[test]
    fn draw_clear_read_back() {
        let (_backend, device) = device();
        let mut ctx = device.create_draw_context().unwrap();
        let surface = ctx
            .create_surface(SurfaceSize::new(4, 4), AlphaMode::Premultiplied, SurfaceFlags::TARGET)
            .unwrap();
        ctx.set_target(Some(&surface));
        ctx.begin_draw();
        ctx.clear(None, Color::new([1.0, 0.0, 0.0, 1.0]));
        ctx.end_draw().unwrap();
        let pixels = ctx
            .read_pixels(&surface, SurfaceRect::from_size(surface.size()))
            .unwrap();
        assert_eq!(pixels.pixel(2, 2), 0xFFFF_0000);
    }

    #[test]
    fn lost_end_draw_arms_probe_failure() {
        let (backend, device) = device();
        let mut ctx = device.create_draw_context().unwrap();
        backend.fail_next_end_draw(true);
        ctx.begin_draw();
        assert!(ctx.end_draw().is_err());
        let probe = ctx.create_surface(
            SurfaceSize::new(1, 1),
            AlphaMode::Premultiplied,
            SurfaceFlags::TARGET,
        );
        assert!(matches!(probe, Err(ref e) if e.is_device_loss()));
        // the confirmed loss is permanent for this device
        assert!(ctx
            .create_surface(SurfaceSize::new(1, 1), AlphaMode::Premultiplied, SurfaceFlags::TARGET)
            .is_err());
    }

    #[test]
    fn present_loss_invalidates_device_resources() {
        let (backend, device) = device();
        let mut ctx = device.create_draw_context().unwrap();
        let mut sc = device
            .create_swap_chain(
                RawWindowHandle::Web(raw_window_handle::WebWindowHandle::new(1)),
                SurfaceSize::new(4, 4),
                AlphaMode::Ignore,
            )
            .unwrap();
        backend.set_present_error(Some(DEVICE_REMOVED));
        assert!(matches!(sc.present(false), Err(ref e) if e.is_device_loss()));
        // everything created on the dead device refuses further work
        let stale = ctx.create_surface(
            SurfaceSize::new(1, 1),
            AlphaMode::Premultiplied,
            SurfaceFlags::TARGET,
        );
        assert!(matches!(stale, Err(ref e) if e.is_device_loss()));
        assert!(sc.back_buffer().is_err());
        // a fresh device is unaffected
        let device2 = backend
            .create_device(DriverKind::Hardware, &DeviceOptions::default())
            .unwrap();
        let mut ctx2 = device2.create_draw_context().unwrap();
        assert!(ctx2
            .create_surface(SurfaceSize::new(1, 1), AlphaMode::Premultiplied, SurfaceFlags::TARGET)
            .is_ok());
    }

    #[test]
    fn resize_rejects_outstanding_back_buffer_wraps() {
        let (_backend, device) = device();
        let mut ctx = device.create_draw_context().unwrap();
        let mut sc = device
            .create_swap_chain(
                RawWindowHandle::Web(raw_window_handle::WebWindowHandle::new(1)),
                SurfaceSize::new(8, 8),
                AlphaMode::Ignore,
            )
            .unwrap();
        let texel = sc.back_buffer().unwrap();
        let wrap = ctx.wrap_external(texel.as_ref(), AlphaMode::Ignore).unwrap();
        drop(texel);
        assert!(sc.resize_buffers(SurfaceSize::new(16, 16)).is_err());
        drop(wrap);
        sc.resize_buffers(SurfaceSize::new(16, 16)).unwrap();
        assert_eq!(sc.size(), SurfaceSize::new(16, 16));
    }

    #[test]
    fn broken_dc_bridge_reads_zeroes() {
        let (backend, device) = device();
        let mut ctx = device.create_draw_context().unwrap();
        let surface = ctx
            .create_surface(
                SurfaceSize::new(2, 2),
                AlphaMode::Premultiplied,
                SurfaceFlags::TARGET | SurfaceFlags::GDI_COMPATIBLE,
            )
            .unwrap();
        ctx.set_target(Some(&surface));
        ctx.begin_draw();
        ctx.clear(None, Color::WHITE);
        ctx.end_draw().unwrap();

        backend.set_dc_bridge(false);
        let src = surface.acquire_dc().unwrap();
        let mut staging = device.create_staging(SurfaceSize::new(2, 2)).unwrap();
        device
            .blit(
                staging.dc(),
                PixelRect::from_size(euclid::default::Size2D::new(2, 2)),
                src,
                PixelPoint::origin(),
            )
            .unwrap();
        surface.release_dc().unwrap();
        assert_eq!(staging.read_pixels().unwrap().pixel(0, 0), 0);
        let _ = staging.write_pixels(PixelPoint::origin(), &PixelBuffer::new(1, 1, PixelFormat::Argb32));
    }
}
