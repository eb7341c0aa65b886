//! Direct2D implementation of the hardware boundary traits.
//!
//! Device derivation follows the usual D3D11 -> DXGI -> D2D chain: a
//! Direct3D 11 device with BGRA support, its DXGI device and factory,
//! then a Direct2D factory and device on top. Surfaces are
//! `ID2D1Bitmap1`s; GDI-compatible surfaces are backed by a D3D11
//! texture created with `D3D11_RESOURCE_MISC_GDI_COMPATIBLE` so the
//! DXGI surface can hand out a real HDC.

use std::any::Any;
use std::ffi::c_void;
use std::rc::Rc;
use std::sync::Arc;

use backdrop_hal::{
    AlphaMode, Color, DeviceOptions, DrawContext, DrawRect, DriverKind, ExternalSurface,
    GpuBackend, GpuDevice, GpuError, GpuResult, GpuSurface, OsDcHandle, PixelBuffer, PixelFormat,
    PixelPoint, PixelRect, StagingStore, SurfaceFlags, SurfaceHandle, SurfacePoint, SurfaceRect,
    SurfaceSize, SwapChain, DEVICE_REMOVED, DEVICE_RESET,
};
use raw_window_handle::RawWindowHandle;
use tracing::{debug, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{COLORREF, HANDLE, HMODULE, HWND, POINT, SIZE};
use windows::Win32::Graphics::Direct2D::Common::*;
use windows::Win32::Graphics::Direct2D::*;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::DirectWrite::{
    DWriteCreateFactory, IDWriteFactory, IDWriteGdiInterop, DWRITE_FACTORY_TYPE_SHARED,
};
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;
use windows::Win32::Graphics::Gdi::{
    BitBlt, CreateCompatibleDC, CreateDIBSection, DeleteDC, DeleteObject, GdiFlush, GetDC,
    ReleaseDC, SelectObject, BITMAPINFO, BITMAPINFOHEADER, BI_RGB, BLENDFUNCTION, DIB_RGB_COLORS,
    HBITMAP, HDC, HGDIOBJ, SRCCOPY,
};
use windows::Win32::UI::WindowsAndMessaging::{UpdateLayeredWindow, ULW_ALPHA};

// AC_SRC_OVER / AC_SRC_ALPHA from wingdi.h; the constants are typed
// u32 in the bindings but BLENDFUNCTION wants u8 fields.
const BLEND_OP_SOURCE_OVER: u8 = 0x00;
const BLEND_ALPHA_PREMULTIPLIED: u8 = 0x01;

fn hr_code(err: &windows::core::Error) -> u32 {
    err.code().0 as u32
}

/// Maps a failed COM call, keeping device-loss HRESULTs recognizable.
fn device_err(call: &'static str, err: windows::core::Error) -> GpuError {
    let code = hr_code(&err);
    match code {
        DEVICE_REMOVED => GpuError::DeviceRemoved { code },
        DEVICE_RESET => GpuError::DeviceReset { code },
        _ => GpuError::CreateFailed { call, code },
    }
}

fn hwnd_of(window: RawWindowHandle) -> GpuResult<HWND> {
    match window {
        RawWindowHandle::Win32(h) => Ok(HWND(h.hwnd.get() as *mut c_void)),
        _ => Err(GpuError::Unsupported("non-win32 window handle")),
    }
}

fn to_rect_f(r: DrawRect) -> D2D_RECT_F {
    D2D_RECT_F { left: r.min.x, top: r.min.y, right: r.max.x, bottom: r.max.y }
}

fn to_rect_u(r: SurfaceRect) -> D2D_RECT_U {
    D2D_RECT_U { left: r.min.x, top: r.min.y, right: r.max.x, bottom: r.max.y }
}

fn to_color_f(c: Color) -> D2D1_COLOR_F {
    let [r, g, b, a] = c.components;
    D2D1_COLOR_F { r, g, b, a }
}

fn d2d_alpha(alpha: AlphaMode) -> D2D1_ALPHA_MODE {
    match alpha {
        AlphaMode::Ignore => D2D1_ALPHA_MODE_IGNORE,
        AlphaMode::Premultiplied => D2D1_ALPHA_MODE_PREMULTIPLIED,
    }
}

fn bitmap_props(alpha: AlphaMode, flags: SurfaceFlags) -> D2D1_BITMAP_PROPERTIES1 {
    let mut options = D2D1_BITMAP_OPTIONS_NONE;
    if flags.contains(SurfaceFlags::TARGET) {
        options |= D2D1_BITMAP_OPTIONS_TARGET;
    }
    if flags.contains(SurfaceFlags::GDI_COMPATIBLE) {
        options |= D2D1_BITMAP_OPTIONS_GDI_COMPATIBLE;
    }
    if flags.contains(SurfaceFlags::CPU_READ) {
        options |= D2D1_BITMAP_OPTIONS_CPU_READ;
    }
    if flags.contains(SurfaceFlags::CANNOT_DRAW) {
        options |= D2D1_BITMAP_OPTIONS_CANNOT_DRAW;
    }
    D2D1_BITMAP_PROPERTIES1 {
        pixelFormat: D2D1_PIXEL_FORMAT {
            format: DXGI_FORMAT_B8G8R8A8_UNORM,
            alphaMode: d2d_alpha(alpha),
        },
        dpiX: 96.0,
        dpiY: 96.0,
        bitmapOptions: options,
        ..Default::default()
    }
}

/// The production backend. Stateless; every device it creates owns its
/// own factory chain.
pub struct D2dBackend;

impl GpuBackend for D2dBackend {
    fn create_device(
        &self,
        driver: DriverKind,
        options: &DeviceOptions,
    ) -> GpuResult<Arc<dyn GpuDevice>> {
        Ok(Arc::new(D2dDevice::new(driver, options)?))
    }
}

pub struct D2dDevice {
    driver: DriverKind,
    // Reverse dependency order so drops release dependents first.
    #[allow(dead_code)]
    dwrite_gdi: IDWriteGdiInterop,
    #[allow(dead_code)]
    dwrite_factory: IDWriteFactory,
    d2d_device: ID2D1Device,
    #[allow(dead_code)]
    d2d_factory: ID2D1Factory1,
    dxgi_factory: IDXGIFactory2,
    #[allow(dead_code)]
    dxgi_device: IDXGIDevice,
    d3d_device: ID3D11Device,
}

// The COM objects held here are created on a free-threaded D3D device
// and are documented thread-safe; single-threaded D2D state lives in
// the draw contexts, which are not Send.
unsafe impl Send for D2dDevice {}
unsafe impl Sync for D2dDevice {}

impl D2dDevice {
    fn new(driver: DriverKind, options: &DeviceOptions) -> GpuResult<Self> {
        let driver_type = match driver {
            DriverKind::Hardware => D3D_DRIVER_TYPE_HARDWARE,
            DriverKind::Software => D3D_DRIVER_TYPE_WARP,
        };
        let feature_levels = [D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0];
        let mut device = None;
        let mut chosen = D3D_FEATURE_LEVEL_11_0;
        unsafe {
            D3D11CreateDevice(
                None,
                driver_type,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&feature_levels),
                D3D11_SDK_VERSION,
                Some(&mut device),
                Some(&mut chosen),
                None,
            )
        }
        .map_err(|e| device_err("D3D11CreateDevice", e))?;
        let d3d_device = device.ok_or(GpuError::Interop("D3D11CreateDevice returned no device"))?;

        let dxgi_device: IDXGIDevice =
            d3d_device.cast().map_err(|e| device_err("IDXGIDevice cast", e))?;
        let adapter =
            unsafe { dxgi_device.GetAdapter() }.map_err(|e| device_err("GetAdapter", e))?;
        let dxgi_factory: IDXGIFactory2 =
            unsafe { adapter.GetParent() }.map_err(|e| device_err("GetParent", e))?;

        let factory_type = if options.multithreaded_factory {
            D2D1_FACTORY_TYPE_MULTI_THREADED
        } else {
            D2D1_FACTORY_TYPE_SINGLE_THREADED
        };
        let d2d_factory = unsafe { D2D1CreateFactory::<ID2D1Factory1>(factory_type, None) }
            .map_err(|e| device_err("D2D1CreateFactory", e))?;
        let d2d_device = unsafe { d2d_factory.CreateDevice(&dxgi_device) }
            .map_err(|e| device_err("ID2D1Factory1::CreateDevice", e))?;

        // Text layout rides the same device lifetime; it is recreated
        // with everything else after a device loss.
        let dwrite_factory =
            unsafe { DWriteCreateFactory::<IDWriteFactory>(DWRITE_FACTORY_TYPE_SHARED) }
                .map_err(|e| device_err("DWriteCreateFactory", e))?;
        let dwrite_gdi = unsafe { dwrite_factory.GetGdiInterop() }
            .map_err(|e| device_err("GetGdiInterop", e))?;

        debug!(?driver, feature_level = chosen.0, "created direct2d device");
        Ok(Self {
            driver,
            dwrite_gdi,
            dwrite_factory,
            d2d_device,
            d2d_factory,
            dxgi_factory,
            dxgi_device,
            d3d_device,
        })
    }
}

impl GpuDevice for D2dDevice {
    fn driver(&self) -> DriverKind {
        self.driver
    }

    fn create_draw_context(&self) -> GpuResult<Box<dyn DrawContext>> {
        let ctx = unsafe { self.d2d_device.CreateDeviceContext(D2D1_DEVICE_CONTEXT_OPTIONS_NONE) }
            .map_err(|e| device_err("CreateDeviceContext", e))?;
        unsafe { ctx.SetUnitMode(D2D1_UNIT_MODE_PIXELS) };
        Ok(Box::new(D2dDrawContext { ctx, d3d: self.d3d_device.clone() }))
    }

    fn create_swap_chain(
        &self,
        window: RawWindowHandle,
        size: SurfaceSize,
        alpha: AlphaMode,
    ) -> GpuResult<Box<dyn SwapChain>> {
        let hwnd = hwnd_of(window)?;
        let desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: size.width,
            Height: size.height,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: 2,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_SEQUENTIAL,
            AlphaMode: match alpha {
                // Hwnd swap chains reject per-pixel alpha.
                AlphaMode::Ignore => DXGI_ALPHA_MODE_IGNORE,
                AlphaMode::Premultiplied => DXGI_ALPHA_MODE_PREMULTIPLIED,
            },
            ..Default::default()
        };
        let sc = unsafe {
            self.dxgi_factory.CreateSwapChainForHwnd(&self.d3d_device, hwnd, &desc, None, None)
        }
        .map_err(|e| device_err("CreateSwapChainForHwnd", e))?;
        Ok(Box::new(D2dSwapChain { sc, size }))
    }

    fn create_staging(&self, size: SurfaceSize) -> GpuResult<Box<dyn StagingStore>> {
        Ok(Box::new(DibStaging::new(size)?))
    }

    fn window_dc(&self, window: RawWindowHandle) -> GpuResult<OsDcHandle> {
        let hwnd = hwnd_of(window)?;
        let hdc = unsafe { GetDC(hwnd) };
        if hdc.0.is_null() {
            return Err(GpuError::Interop("GetDC failed"));
        }
        Ok(OsDcHandle(hdc.0 as isize))
    }

    fn release_window_dc(&self, window: RawWindowHandle, dc: OsDcHandle) -> GpuResult<()> {
        let hwnd = hwnd_of(window)?;
        let released = unsafe { ReleaseDC(hwnd, HDC(dc.0 as *mut c_void)) };
        if released == 0 {
            warn!("ReleaseDC refused the handle");
        }
        Ok(())
    }

    fn blit(
        &self,
        dst: OsDcHandle,
        dst_rect: PixelRect,
        src: OsDcHandle,
        src_origin: PixelPoint,
    ) -> GpuResult<()> {
        unsafe {
            BitBlt(
                HDC(dst.0 as *mut c_void),
                dst_rect.min.x,
                dst_rect.min.y,
                dst_rect.width(),
                dst_rect.height(),
                HDC(src.0 as *mut c_void),
                src_origin.x,
                src_origin.y,
                SRCCOPY,
            )
        }
        .map_err(|_| GpuError::Interop("BitBlt failed"))
    }

    fn update_layered_window(
        &self,
        window: RawWindowHandle,
        src: OsDcHandle,
        size: SurfaceSize,
    ) -> GpuResult<()> {
        let hwnd = hwnd_of(window)?;
        let blend = BLENDFUNCTION {
            BlendOp: BLEND_OP_SOURCE_OVER,
            BlendFlags: 0,
            SourceConstantAlpha: 255,
            AlphaFormat: BLEND_ALPHA_PREMULTIPLIED,
        };
        let wnd_size = SIZE { cx: size.width as i32, cy: size.height as i32 };
        let src_pt = POINT { x: 0, y: 0 };
        unsafe {
            UpdateLayeredWindow(
                hwnd,
                HDC::default(),
                None,
                Some(&wnd_size),
                HDC(src.0 as *mut c_void),
                Some(&src_pt),
                COLORREF(0),
                Some(&blend),
                ULW_ALPHA,
            )
        }
        .map_err(|_| GpuError::Interop("UpdateLayeredWindow failed"))
    }
}

struct D2dDrawContext {
    ctx: ID2D1DeviceContext,
    d3d: ID3D11Device,
}

impl D2dDrawContext {
    fn native<'a>(&self, surface: &'a dyn GpuSurface) -> GpuResult<&'a D2dSurface> {
        surface
            .as_any()
            .downcast_ref::<D2dSurface>()
            .ok_or(GpuError::Unsupported("surface from another backend"))
    }

    /// D2D bitmap over a fresh GDI-compatible D3D texture. The misc
    /// flag is what lets the DXGI surface hand out an HDC later.
    fn create_gdi_surface(
        &mut self,
        size: SurfaceSize,
        alpha: AlphaMode,
        flags: SurfaceFlags,
    ) -> GpuResult<Rc<D2dSurface>> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: size.width,
            Height: size.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_RENDER_TARGET.0 as u32 | D3D11_BIND_SHADER_RESOURCE.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: D3D11_RESOURCE_MISC_GDI_COMPATIBLE.0 as u32,
        };
        let mut texture = None;
        unsafe { self.d3d.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(|e| device_err("CreateTexture2D", e))?;
        let texture = texture.ok_or(GpuError::Interop("CreateTexture2D returned no texture"))?;
        let surface: IDXGISurface =
            texture.cast().map_err(|e| device_err("IDXGISurface cast", e))?;
        let gdi: IDXGISurface1 =
            texture.cast().map_err(|e| device_err("IDXGISurface1 cast", e))?;
        let bitmap = unsafe {
            self.ctx.CreateBitmapFromDxgiSurface(&surface, Some(&bitmap_props(alpha, flags)))
        }
        .map_err(|e| device_err("CreateBitmapFromDxgiSurface", e))?;
        Ok(Rc::new(D2dSurface { bitmap, gdi: Some(gdi), size, alpha, flags }))
    }
}

impl DrawContext for D2dDrawContext {
    fn create_surface(
        &mut self,
        size: SurfaceSize,
        alpha: AlphaMode,
        flags: SurfaceFlags,
    ) -> GpuResult<SurfaceHandle> {
        if flags.contains(SurfaceFlags::GDI_COMPATIBLE) {
            return Ok(self.create_gdi_surface(size, alpha, flags)?);
        }
        let bitmap = unsafe {
            self.ctx.CreateBitmap(
                D2D_SIZE_U { width: size.width, height: size.height },
                None,
                0,
                &bitmap_props(alpha, flags),
            )
        }
        .map_err(|e| device_err("CreateBitmap", e))?;
        Ok(Rc::new(D2dSurface { bitmap, gdi: None, size, alpha, flags }))
    }

    fn create_surface_with_pixels(
        &mut self,
        image: &PixelBuffer,
        alpha: AlphaMode,
        flags: SurfaceFlags,
    ) -> GpuResult<SurfaceHandle> {
        let size = image.size();
        let bitmap = unsafe {
            self.ctx.CreateBitmap(
                D2D_SIZE_U { width: size.width, height: size.height },
                Some(image.bytes().as_ptr() as *const c_void),
                image.stride() as u32,
                &bitmap_props(alpha, flags),
            )
        }
        .map_err(|e| device_err("CreateBitmap", e))?;
        Ok(Rc::new(D2dSurface { bitmap, gdi: None, size, alpha, flags }))
    }

    fn wrap_external(
        &mut self,
        texel: &dyn ExternalSurface,
        alpha: AlphaMode,
    ) -> GpuResult<SurfaceHandle> {
        let texel = texel
            .as_any()
            .downcast_ref::<D2dTexel>()
            .ok_or(GpuError::Unsupported("texel from another backend"))?;
        let flags = SurfaceFlags::TARGET | SurfaceFlags::CANNOT_DRAW;
        // Some drivers reject explicit properties on shared surfaces;
        // fall back to inherited properties, then to opaque alpha.
        let bitmap = unsafe {
            self.ctx
                .CreateBitmapFromDxgiSurface(&texel.surface, Some(&bitmap_props(alpha, flags)))
        }
        .or_else(|first| {
            warn!(code = hr_code(&first), "backbuffer wrap with explicit properties failed");
            unsafe { self.ctx.CreateBitmapFromDxgiSurface(&texel.surface, None) }
        })
        .or_else(|_| unsafe {
            self.ctx.CreateBitmapFromDxgiSurface(
                &texel.surface,
                Some(&bitmap_props(AlphaMode::Ignore, flags)),
            )
        })
        .map_err(|e| device_err("CreateBitmapFromDxgiSurface", e))?;
        Ok(Rc::new(D2dSurface { bitmap, gdi: None, size: texel.size, alpha, flags }))
    }

    fn set_target(&mut self, surface: Option<&SurfaceHandle>) {
        match surface.and_then(|s| s.as_any().downcast_ref::<D2dSurface>()) {
            Some(s) => unsafe { self.ctx.SetTarget(&s.bitmap) },
            None => unsafe { self.ctx.SetTarget(None::<&ID2D1Image>) },
        }
    }

    fn begin_draw(&mut self) {
        unsafe { self.ctx.BeginDraw() };
    }

    fn end_draw(&mut self) -> GpuResult<()> {
        let mut tag1 = 0u64;
        let mut tag2 = 0u64;
        unsafe { self.ctx.EndDraw(Some(&mut tag1), Some(&mut tag2)) }
            .map_err(|e| GpuError::EndDraw { code: hr_code(&e), tag1, tag2 })
    }

    fn clear(&mut self, rect: Option<DrawRect>, color: Color) {
        let color = to_color_f(color);
        match rect {
            Some(r) => unsafe {
                self.ctx.PushAxisAlignedClip(&to_rect_f(r), D2D1_ANTIALIAS_MODE_ALIASED);
                self.ctx.Clear(Some(&color));
                self.ctx.PopAxisAlignedClip();
            },
            None => unsafe { self.ctx.Clear(Some(&color)) },
        }
    }

    fn push_clip(&mut self, rect: DrawRect) {
        unsafe { self.ctx.PushAxisAlignedClip(&to_rect_f(rect), D2D1_ANTIALIAS_MODE_ALIASED) };
    }

    fn pop_clip(&mut self) {
        unsafe { self.ctx.PopAxisAlignedClip() };
    }

    fn draw_surface(&mut self, src: &SurfaceHandle, dst: DrawRect, src_rect: DrawRect) {
        let Some(surface) = src.as_any().downcast_ref::<D2dSurface>() else {
            warn!("draw_surface skipped a surface from another backend");
            return;
        };
        unsafe {
            self.ctx.DrawBitmap(
                &surface.bitmap,
                Some(&to_rect_f(dst)),
                1.0,
                D2D1_INTERPOLATION_MODE_LINEAR,
                Some(&to_rect_f(src_rect)),
                None,
            )
        };
    }

    fn read_pixels(&mut self, src: &SurfaceHandle, rect: SurfaceRect) -> GpuResult<PixelBuffer> {
        let surface = self.native(src.as_ref())?;
        let size = rect.size();
        let staging = unsafe {
            self.ctx.CreateBitmap(
                D2D_SIZE_U { width: size.width, height: size.height },
                None,
                0,
                &bitmap_props(
                    surface.alpha,
                    SurfaceFlags::CPU_READ | SurfaceFlags::CANNOT_DRAW,
                ),
            )
        }
        .map_err(|e| device_err("CreateBitmap", e))?;
        unsafe {
            staging.CopyFromBitmap(
                Some(&D2D_POINT_2U { x: 0, y: 0 }),
                &surface.bitmap,
                Some(&to_rect_u(rect)),
            )
        }
        .map_err(|e| device_err("CopyFromBitmap", e))?;

        let mapped = unsafe { staging.Map(D2D1_MAP_OPTIONS_READ) }
            .map_err(|e| device_err("Map", e))?;
        let len = mapped.pitch as usize * size.height as usize;
        let bytes = unsafe { std::slice::from_raw_parts(mapped.bits, len) };
        let format = match surface.alpha {
            AlphaMode::Ignore => PixelFormat::Rgb32,
            AlphaMode::Premultiplied => PixelFormat::Argb32Premultiplied,
        };
        let image =
            PixelBuffer::from_bytes(size.width, size.height, mapped.pitch as usize, format, bytes);
        unsafe { staging.Unmap() }.map_err(|e| device_err("Unmap", e))?;
        Ok(image)
    }

    fn write_pixels(
        &mut self,
        dst: &SurfaceHandle,
        origin: SurfacePoint,
        image: &PixelBuffer,
    ) -> GpuResult<()> {
        let surface = self.native(dst.as_ref())?;
        let rect = D2D_RECT_U {
            left: origin.x,
            top: origin.y,
            right: origin.x + image.width(),
            bottom: origin.y + image.height(),
        };
        unsafe {
            surface.bitmap.CopyFromMemory(
                Some(&rect),
                image.bytes().as_ptr() as *const c_void,
                image.stride() as u32,
            )
        }
        .map_err(|e| device_err("CopyFromMemory", e))
    }

    fn flush(&mut self) -> GpuResult<()> {
        unsafe { self.ctx.Flush(None, None) }.map_err(|e| device_err("Flush", e))
    }
}

struct D2dSurface {
    bitmap: ID2D1Bitmap1,
    /// Present only for GDI-compatible surfaces.
    gdi: Option<IDXGISurface1>,
    size: SurfaceSize,
    alpha: AlphaMode,
    flags: SurfaceFlags,
}

impl GpuSurface for D2dSurface {
    fn size(&self) -> SurfaceSize {
        self.size
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
        let src = src
            .as_any()
            .downcast_ref::<D2dSurface>()
            .ok_or(GpuError::Unsupported("surface from another backend"))?;
        unsafe {
            self.bitmap.CopyFromBitmap(
                Some(&D2D_POINT_2U { x: dst_origin.x, y: dst_origin.y }),
                &src.bitmap,
                Some(&to_rect_u(src_rect)),
            )
        }
        .map_err(|e| device_err("CopyFromBitmap", e))
    }

    fn acquire_dc(&self) -> GpuResult<OsDcHandle> {
        let gdi = self.gdi.as_ref().ok_or(GpuError::Unsupported("surface has no GDI interop"))?;
        let hdc = unsafe { gdi.GetDC(false) }
            .map_err(|e| device_err("IDXGISurface1::GetDC", e))?;
        Ok(OsDcHandle(hdc.0 as isize))
    }

    fn release_dc(&self) -> GpuResult<()> {
        let gdi = self.gdi.as_ref().ok_or(GpuError::Unsupported("surface has no GDI interop"))?;
        unsafe { gdi.ReleaseDC(None) }.map_err(|e| device_err("IDXGISurface1::ReleaseDC", e))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A DXGI surface handed across the swap chain boundary.
struct D2dTexel {
    surface: IDXGISurface,
    size: SurfaceSize,
}

impl ExternalSurface for D2dTexel {
    fn size(&self) -> SurfaceSize {
        self.size
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct D2dSwapChain {
    sc: IDXGISwapChain1,
    size: SurfaceSize,
}

impl SwapChain for D2dSwapChain {
    fn size(&self) -> SurfaceSize {
        self.size
    }

    fn back_buffer(&self) -> GpuResult<Box<dyn ExternalSurface>> {
        let surface: IDXGISurface =
            unsafe { self.sc.GetBuffer(0) }.map_err(|e| device_err("GetBuffer", e))?;
        Ok(Box::new(D2dTexel { surface, size: self.size }))
    }

    fn resize_buffers(&mut self, size: SurfaceSize) -> GpuResult<()> {
        unsafe {
            self.sc.ResizeBuffers(
                0,
                size.width,
                size.height,
                DXGI_FORMAT_B8G8R8A8_UNORM,
                DXGI_SWAP_CHAIN_FLAG(0),
            )
        }
        .map_err(|e| device_err("ResizeBuffers", e))?;
        self.size = size;
        Ok(())
    }

    fn present(&mut self, sync: bool) -> GpuResult<()> {
        let interval = if sync { 1 } else { 0 };
        unsafe { self.sc.Present(interval, DXGI_PRESENT(0)) }
            .ok()
            .map_err(|e| device_err("Present", e))
    }
}

/// Top-down 32-bit DIB section selected into a memory DC. The pixel
/// bits are owned by GDI; the pointer stays valid until the section is
/// deleted.
struct DibStaging {
    size: SurfaceSize,
    mem_dc: HDC,
    dib: HBITMAP,
    old_bitmap: HGDIOBJ,
    bits: *mut u8,
}

impl DibStaging {
    fn new(size: SurfaceSize) -> GpuResult<Self> {
        let mem_dc = unsafe { CreateCompatibleDC(HDC::default()) };
        if mem_dc.0.is_null() {
            return Err(GpuError::Interop("CreateCompatibleDC failed"));
        }

        let mut bmi = BITMAPINFO::default();
        bmi.bmiHeader = BITMAPINFOHEADER {
            biSize: size_of::<BITMAPINFOHEADER>() as u32,
            biWidth: size.width as i32,
            // Negative height selects top-down row order.
            biHeight: -(size.height as i32),
            biPlanes: 1,
            biBitCount: 32,
            biCompression: BI_RGB.0,
            ..Default::default()
        };

        let mut bits: *mut c_void = std::ptr::null_mut();
        let dib = match unsafe {
            CreateDIBSection(mem_dc, &bmi, DIB_RGB_COLORS, &mut bits, HANDLE::default(), 0)
        } {
            Ok(dib) if !bits.is_null() => dib,
            _ => {
                unsafe {
                    let _ = DeleteDC(mem_dc);
                }
                return Err(GpuError::Interop("CreateDIBSection failed"));
            }
        };
        let old_bitmap = unsafe { SelectObject(mem_dc, dib) };
        Ok(Self { size, mem_dc, dib, old_bitmap, bits: bits as *mut u8 })
    }

    fn stride(&self) -> usize {
        self.size.width as usize * 4
    }
}

impl StagingStore for DibStaging {
    fn size(&self) -> SurfaceSize {
        self.size
    }

    fn dc(&self) -> OsDcHandle {
        OsDcHandle(self.mem_dc.0 as isize)
    }

    fn write_pixels(&mut self, origin: PixelPoint, image: &PixelBuffer) -> GpuResult<()> {
        if origin.x < 0
            || origin.y < 0
            || origin.x as u32 + image.width() > self.size.width
            || origin.y as u32 + image.height() > self.size.height
        {
            return Err(GpuError::Unsupported("staging write out of bounds"));
        }
        unsafe {
            let _ = GdiFlush();
        }
        let stride = self.stride();
        for y in 0..image.height() {
            let row = image.row(y);
            let offset = (origin.y as usize + y as usize) * stride + origin.x as usize * 4;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    row.as_ptr() as *const u8,
                    self.bits.add(offset),
                    row.len() * 4,
                );
            }
        }
        Ok(())
    }

    fn read_pixels(&self) -> GpuResult<PixelBuffer> {
        unsafe {
            let _ = GdiFlush();
        }
        let len = self.stride() * self.size.height as usize;
        let bytes = unsafe { std::slice::from_raw_parts(self.bits, len) };
        Ok(PixelBuffer::from_bytes(
            self.size.width,
            self.size.height,
            self.stride(),
            PixelFormat::Argb32Premultiplied,
            bytes,
        ))
    }
}

impl Drop for DibStaging {
    fn drop(&mut self) {
        unsafe {
            let _ = SelectObject(self.mem_dc, self.old_bitmap);
            let _ = DeleteObject(self.dib);
            let _ = DeleteDC(self.mem_dc);
        }
    }
}
