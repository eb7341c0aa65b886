//! Hardware boundary for the backdrop presentation core.
//!
//! Everything above this crate is portable: the core talks to the GPU
//! and to the window system exclusively through the traits defined
//! here. The production backend wraps Direct2D/DXGI; the `testing`
//! feature compiles a scriptable in-memory backend that the core's
//! test suite drives on any platform.

use std::any::Any;
use std::rc::Rc;
use std::sync::Arc;

use raw_window_handle::RawWindowHandle;

pub mod image;
#[cfg(feature = "testing")]
pub mod mock;

pub use image::{PixelBuffer, PixelFormat};
pub use peniko::Color;

/// Integer surface extent in device pixels.
pub type SurfaceSize = euclid::default::Size2D<u32>;
/// Unsigned rectangle within a surface.
pub type SurfaceRect = euclid::default::Box2D<u32>;
/// Unsigned point within a surface.
pub type SurfacePoint = euclid::default::Point2D<u32>;
/// Signed pixel rectangle (window coordinates, may extend off-surface).
pub type PixelRect = euclid::default::Box2D<i32>;
/// Signed pixel point.
pub type PixelPoint = euclid::default::Point2D<i32>;
/// Rectangle handed to draw calls.
pub type DrawRect = euclid::default::Box2D<f32>;

/// `DXGI_ERROR_DEVICE_REMOVED`
pub const DEVICE_REMOVED: u32 = 0x887A_0005;
/// `DXGI_ERROR_DEVICE_RESET`
pub const DEVICE_RESET: u32 = 0x887A_0007;
/// `D2DERR_RECREATE_TARGET`
pub const RECREATE_TARGET: u32 = 0x8899_000C;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GpuError {
    #[error("gpu device removed (0x{code:08X})")]
    DeviceRemoved { code: u32 },
    #[error("gpu device reset (0x{code:08X})")]
    DeviceReset { code: u32 },
    #[error("end-draw failed (0x{code:08X}, tags {tag1}/{tag2})")]
    EndDraw { code: u32, tag1: u64, tag2: u64 },
    #[error("{call} failed (0x{code:08X})")]
    CreateFailed { call: &'static str, code: u32 },
    #[error("os interop failure: {0}")]
    Interop(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl GpuError {
    /// Classifies an HRESULT as a loss of the underlying device.
    pub fn code_is_device_loss(code: u32) -> bool {
        code == DEVICE_REMOVED || code == DEVICE_RESET || code == RECREATE_TARGET
    }

    /// Whether this error means the device (or its render targets) must
    /// be thrown away and recreated, as opposed to a per-call failure.
    pub fn is_device_loss(&self) -> bool {
        match self {
            GpuError::DeviceRemoved { .. } | GpuError::DeviceReset { .. } => true,
            GpuError::EndDraw { code, .. } | GpuError::CreateFailed { code, .. } => {
                Self::code_is_device_loss(*code)
            }
            _ => false,
        }
    }
}

pub type GpuResult<T> = Result<T, GpuError>;

/// Which driver backs a [`GpuDevice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    /// Real display adapter.
    Hardware,
    /// Software rasterizer (WARP). Slower, but survives broken drivers.
    Software,
}

/// Alpha treatment of a surface or swap chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlphaMode {
    /// Alpha channel is undefined and ignored on composition.
    Ignore,
    /// Color channels are premultiplied by alpha.
    Premultiplied,
}

bitflags::bitflags! {
    /// Capabilities requested when allocating a surface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SurfaceFlags: u32 {
        /// Surface can be set as a draw target.
        const TARGET = 1 << 0;
        /// Surface exposes a GDI device context via `acquire_dc`.
        const GDI_COMPATIBLE = 1 << 1;
        /// Surface contents can be read back to the CPU.
        const CPU_READ = 1 << 2;
        /// Surface cannot be sampled from (readback-only intermediate).
        const CANNOT_DRAW = 1 << 3;
    }
}

/// Opaque handle to an OS device context (an `HDC` on Windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsDcHandle(pub isize);

/// Startup knobs for device creation, read once from the environment.
#[derive(Debug, Clone)]
pub struct DeviceOptions {
    /// Permit falling back to the software rasterizer when hardware
    /// device creation fails.
    pub allow_software_fallback: bool,
    /// Create the Direct2D factory in multithreaded mode.
    pub multithreaded_factory: bool,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            allow_software_fallback: false,
            multithreaded_factory: false,
        }
    }
}

impl DeviceOptions {
    pub fn from_env() -> Self {
        Self {
            allow_software_fallback: env_flag("BACKDROP_SOFTWARE_DEVICE"),
            multithreaded_factory: env_flag("BACKDROP_MT_FACTORY"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Entry point of a backend implementation.
pub trait GpuBackend: Send + Sync {
    fn create_device(
        &self,
        driver: DriverKind,
        options: &DeviceOptions,
    ) -> GpuResult<Arc<dyn GpuDevice>>;
}

/// A live GPU device plus the OS blit primitives the core needs for
/// windows it cannot present to through a swap chain.
pub trait GpuDevice: Send + Sync {
    fn driver(&self) -> DriverKind;

    /// New drawing context. Contexts are cheap and single-threaded;
    /// surfaces created on one context must only be used on it.
    fn create_draw_context(&self) -> GpuResult<Box<dyn DrawContext>>;

    fn create_swap_chain(
        &self,
        window: RawWindowHandle,
        size: SurfaceSize,
        alpha: AlphaMode,
    ) -> GpuResult<Box<dyn SwapChain>>;

    /// CPU-side staging store with a GDI-blittable device context.
    fn create_staging(&self, size: SurfaceSize) -> GpuResult<Box<dyn StagingStore>>;

    fn window_dc(&self, window: RawWindowHandle) -> GpuResult<OsDcHandle>;
    fn release_window_dc(&self, window: RawWindowHandle, dc: OsDcHandle) -> GpuResult<()>;

    /// Opaque copy of `dst_rect`-sized pixels from `src` starting at
    /// `src_origin` into `dst` at `dst_rect`'s origin.
    fn blit(
        &self,
        dst: OsDcHandle,
        dst_rect: PixelRect,
        src: OsDcHandle,
        src_origin: PixelPoint,
    ) -> GpuResult<()>;

    /// Pushes premultiplied content from `src` to a layered window.
    fn update_layered_window(
        &self,
        window: RawWindowHandle,
        src: OsDcHandle,
        size: SurfaceSize,
    ) -> GpuResult<()>;
}

/// Texture owned by a draw context. Handles are reference counted;
/// dropping the last handle releases the GPU resource.
pub trait GpuSurface {
    fn size(&self) -> SurfaceSize;
    fn alpha_mode(&self) -> AlphaMode;
    fn flags(&self) -> SurfaceFlags;

    /// GPU-side copy, no draw pass required. Both surfaces must belong
    /// to the same context and `src_rect` must lie within both.
    fn copy_from(
        &self,
        src: &dyn GpuSurface,
        dst_origin: SurfacePoint,
        src_rect: SurfaceRect,
    ) -> GpuResult<()>;

    /// Borrow a GDI device context over the surface contents. Requires
    /// [`SurfaceFlags::GDI_COMPATIBLE`] and must be paired with
    /// [`release_dc`](Self::release_dc) before any further drawing.
    fn acquire_dc(&self) -> GpuResult<OsDcHandle>;
    fn release_dc(&self) -> GpuResult<()>;

    fn as_any(&self) -> &dyn Any;
}

pub type SurfaceHandle = Rc<dyn GpuSurface>;

/// Single-threaded recording and submission context.
pub trait DrawContext {
    fn create_surface(
        &mut self,
        size: SurfaceSize,
        alpha: AlphaMode,
        flags: SurfaceFlags,
    ) -> GpuResult<SurfaceHandle>;

    fn create_surface_with_pixels(
        &mut self,
        image: &PixelBuffer,
        alpha: AlphaMode,
        flags: SurfaceFlags,
    ) -> GpuResult<SurfaceHandle>;

    /// Wraps a swap chain back buffer as a drawable surface.
    fn wrap_external(
        &mut self,
        texel: &dyn ExternalSurface,
        alpha: AlphaMode,
    ) -> GpuResult<SurfaceHandle>;

    fn set_target(&mut self, surface: Option<&SurfaceHandle>);

    /// Begin/end are not nestable at this level; the core's draw scope
    /// refcounts on top of them.
    fn begin_draw(&mut self);
    fn end_draw(&mut self) -> GpuResult<()>;

    /// Clear `rect` (or the whole target) to `color`.
    fn clear(&mut self, rect: Option<DrawRect>, color: Color);
    fn push_clip(&mut self, rect: DrawRect);
    fn pop_clip(&mut self);
    fn draw_surface(&mut self, src: &SurfaceHandle, dst: DrawRect, src_rect: DrawRect);

    fn read_pixels(&mut self, src: &SurfaceHandle, rect: SurfaceRect) -> GpuResult<PixelBuffer>;
    fn write_pixels(
        &mut self,
        dst: &SurfaceHandle,
        origin: SurfacePoint,
        image: &PixelBuffer,
    ) -> GpuResult<()>;

    /// Submit pending work without ending the draw.
    fn flush(&mut self) -> GpuResult<()>;
}

/// Per-window flip-model swap chain.
pub trait SwapChain {
    fn size(&self) -> SurfaceSize;

    /// Current back buffer. The returned texel handle is only valid
    /// until the next [`resize_buffers`](Self::resize_buffers).
    fn back_buffer(&self) -> GpuResult<Box<dyn ExternalSurface>>;

    /// All surfaces wrapping the back buffer must have been released
    /// before calling this.
    fn resize_buffers(&mut self, size: SurfaceSize) -> GpuResult<()>;

    fn present(&mut self, sync: bool) -> GpuResult<()>;
}

/// Backend-native texture that can be wrapped by a draw context.
pub trait ExternalSurface {
    fn size(&self) -> SurfaceSize;
    fn as_any(&self) -> &dyn Any;
}

/// CPU-side pixel store with a GDI device context (a DIB section on
/// Windows). Used to blit GPU readback through plain `BitBlt`.
pub trait StagingStore {
    fn size(&self) -> SurfaceSize;
    fn dc(&self) -> OsDcHandle;
    fn write_pixels(&mut self, origin: PixelPoint, image: &PixelBuffer) -> GpuResult<()>;
    /// Current contents, including anything blitted in through the DC.
    fn read_pixels(&self) -> GpuResult<PixelBuffer>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_loss_classification() {
        assert!(GpuError::DeviceRemoved { code: DEVICE_REMOVED }.is_device_loss());
        assert!(GpuError::DeviceReset { code: DEVICE_RESET }.is_device_loss());
        assert!(
            GpuError::CreateFailed { call: "CreateBitmap", code: RECREATE_TARGET }
                .is_device_loss()
        );
        assert!(!GpuError::EndDraw { code: 0x8000_4005, tag1: 0, tag2: 0 }.is_device_loss());
        assert!(!GpuError::Interop("GetDC").is_device_loss());
    }

    #[test]
    fn env_flag_parsing() {
        unsafe { std::env::set_var("BACKDROP_HAL_TEST_FLAG", "TRUE") };
        assert!(env_flag("BACKDROP_HAL_TEST_FLAG"));
        unsafe { std::env::set_var("BACKDROP_HAL_TEST_FLAG", "0") };
        assert!(!env_flag("BACKDROP_HAL_TEST_FLAG"));
        unsafe { std::env::remove_var("BACKDROP_HAL_TEST_FLAG") };
        assert!(!env_flag("BACKDROP_HAL_TEST_FLAG"));
    }
}
