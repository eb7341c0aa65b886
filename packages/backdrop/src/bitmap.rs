//! GPU-resident pixel surface with an attached draw scope and an
//! optional CPU shadow for fast read-back.

use std::sync::Arc;

use backdrop_hal::image::PixelFormat;
use backdrop_hal::{
    AlphaMode, Color, ExternalSurface, GpuDevice, PixelBuffer, SurfaceFlags, SurfaceHandle,
    SurfacePoint, SurfaceRect, SurfaceSize,
};
use tracing::warn;

use crate::scope::{DrawScope, EndDrawOutcome};

/// A drawable GPU surface. The shadow caches the last known CPU copy of
/// the pixels; every mutation and every hand-out of the draw scope
/// drops it.
pub struct Bitmap {
    scope: DrawScope,
    surface: Option<SurfaceHandle>,
    shadow: Option<PixelBuffer>,
}

impl Bitmap {
    /// Surfaceless bitmap on a fresh draw context. Returns `None` when
    /// the context cannot be created (device already lost).
    pub fn new(device: &Arc<dyn GpuDevice>) -> Option<Self> {
        match device.create_draw_context() {
            Ok(ctx) => Some(Self {
                scope: DrawScope::new(ctx),
                surface: None,
                shadow: None,
            }),
            Err(err) => {
                warn!(%err, "draw context creation failed");
                None
            }
        }
    }

    pub fn is_valid(&self) -> bool {
        self.surface.is_some()
    }

    pub fn size(&self) -> SurfaceSize {
        self.surface.as_ref().map_or(SurfaceSize::zero(), |s| s.size())
    }

    /// Allocates a premultiplied render target of exactly `size`,
    /// dropping the previous surface and its contents.
    pub fn resize(&mut self, size: SurfaceSize) -> bool {
        self.resize_with(size, AlphaMode::Premultiplied, SurfaceFlags::TARGET)
    }

    pub fn resize_with(&mut self, size: SurfaceSize, alpha: AlphaMode, flags: SurfaceFlags) -> bool {
        self.detach();
        match self.scope.ctx().create_surface(size, alpha, flags) {
            Ok(surface) => {
                if flags.contains(SurfaceFlags::TARGET) {
                    self.scope.ctx().set_target(Some(&surface));
                }
                self.surface = Some(surface);
                true
            }
            Err(err) => {
                warn!(%err, width = size.width, height = size.height, "surface allocation failed");
                false
            }
        }
    }

    /// Uploads `image`, converting to premultiplied ARGB32 first (the
    /// only format GPU bitmaps use). The converted buffer becomes the
    /// CPU shadow.
    pub fn from_image(&mut self, image: &PixelBuffer) -> bool {
        let converted = image.convert_to(PixelFormat::Argb32Premultiplied);
        self.detach();
        match self.scope.ctx().create_surface_with_pixels(
            &converted,
            AlphaMode::Premultiplied,
            SurfaceFlags::TARGET,
        ) {
            Ok(surface) => {
                self.scope.ctx().set_target(Some(&surface));
                self.surface = Some(surface);
                self.shadow = Some(converted);
                true
            }
            Err(err) => {
                warn!(%err, "image upload failed");
                false
            }
        }
    }

    /// Imports an externally owned surface as this bitmap's backing.
    pub fn wrap_external(
        &mut self,
        texel: &dyn ExternalSurface,
        is_target: bool,
        alpha: AlphaMode,
    ) -> bool {
        self.detach();
        match self.scope.ctx().wrap_external(texel, alpha) {
            Ok(surface) => {
                if is_target {
                    self.scope.ctx().set_target(Some(&surface));
                }
                self.surface = Some(surface);
                true
            }
            Err(err) => {
                warn!(%err, "wrapping external surface failed");
                false
            }
        }
    }

    /// Fills the whole surface. Reports the close of the draw scope so
    /// a device loss confirmed during the fill is not swallowed.
    pub fn fill(&mut self, color: Color) -> EndDrawOutcome {
        if self.surface.is_none() {
            return EndDrawOutcome::Completed;
        }
        self.shadow = None;
        self.scope.begin();
        self.scope.ctx().clear(None, color);
        self.scope.end()
    }

    /// Current pixels. An empty `rect`, or one equal to the full
    /// bounds, returns the whole image. Reads the CPU shadow when it is
    /// still valid, the GPU otherwise.
    pub fn to_image(&mut self, rect: SurfaceRect) -> Option<PixelBuffer> {
        let surface = self.surface.clone()?;
        let full = SurfaceRect::from_size(surface.size());
        let whole = rect.is_empty() || rect == full;
        if let Some(shadow) = &self.shadow {
            return Some(if whole { shadow.clone() } else { shadow.copy_rect(rect) });
        }
        match self.scope.ctx().read_pixels(&surface, if whole { full } else { rect }) {
            Ok(image) => {
                if whole {
                    // read-back is in sync with the surface by definition
                    self.shadow = Some(image.clone());
                }
                Some(image)
            }
            Err(err) => {
                warn!(%err, "gpu read-back failed");
                None
            }
        }
    }

    /// GPU-side copy of `src_rect` from `src` into this bitmap.
    pub fn copy_from_bitmap(
        &mut self,
        src: &Bitmap,
        src_rect: SurfaceRect,
        dst_origin: SurfacePoint,
    ) -> bool {
        let (Some(dst), Some(src)) = (&self.surface, &src.surface) else {
            return false;
        };
        self.shadow = None;
        match dst.copy_from(src.as_ref(), dst_origin, src_rect) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "gpu surface copy failed");
                false
            }
        }
    }

    /// Draw scope over this bitmap. The caller may draw through it, so
    /// the shadow is invalidated on every access.
    pub fn scope(&mut self) -> &mut DrawScope {
        self.shadow = None;
        &mut self.scope
    }

    pub(crate) fn surface(&self) -> Option<&SurfaceHandle> {
        self.surface.as_ref()
    }

    /// Clears the render target binding and releases the surface and
    /// shadow. Required before resizing a swap chain whose buffer this
    /// bitmap wraps.
    pub fn detach(&mut self) {
        self.scope.ctx().set_target(None);
        self.surface = None;
        self.shadow = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backdrop_hal::mock::MockBackend;
    use backdrop_hal::{DeviceOptions, DriverKind, GpuBackend};

    fn bitmap(backend: &MockBackend) -> Bitmap {
        let device = backend
            .create_device(DriverKind::Hardware, &DeviceOptions::default())
            .unwrap();
        Bitmap::new(&device).unwrap()
    }

    #[test]
    fn resize_reports_exact_size_and_drops_shadow() {
        let backend = MockBackend::new();
        let mut bmp = bitmap(&backend);
        let mut img = PixelBuffer::new(2, 2, PixelFormat::Argb32);
        img.fill(0xFF11_2233);
        assert!(bmp.from_image(&img));
        assert_eq!(bmp.size(), SurfaceSize::new(2, 2));

        assert!(bmp.resize(SurfaceSize::new(7, 5)));
        assert_eq!(bmp.size(), SurfaceSize::new(7, 5));
        let image = bmp.to_image(SurfaceRect::zero()).unwrap();
        assert_eq!(image.size(), SurfaceSize::new(7, 5));
        assert_eq!(image.pixel(0, 0), 0);
    }

    #[test]
    fn image_round_trip_through_shadow() {
        let backend = MockBackend::new();
        let mut bmp = bitmap(&backend);
        let mut img = PixelBuffer::new(3, 1, PixelFormat::Argb32Premultiplied);
        img.set_pixel(0, 0, 0xFF00_FF00); // opaque
        img.set_pixel(1, 0, 0x0000_0000); // transparent
        img.set_pixel(2, 0, 0x8080_0000); // half alpha
        assert!(bmp.from_image(&img));
        let out = bmp.to_image(img.rect()).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn image_round_trip_through_gpu_read_back() {
        let backend = MockBackend::new();
        let mut bmp = bitmap(&backend);
        let mut img = PixelBuffer::new(3, 1, PixelFormat::Argb32Premultiplied);
        img.set_pixel(0, 0, 0xFFAA_BBCC);
        img.set_pixel(2, 0, 0x8040_2010);
        assert!(bmp.from_image(&img));
        // shadow is gone once the draw scope has been handed out
        bmp.scope();
        let out = bmp.to_image(img.rect()).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn straight_alpha_input_is_premultiplied() {
        let backend = MockBackend::new();
        let mut bmp = bitmap(&backend);
        let mut img = PixelBuffer::new(1, 1, PixelFormat::Argb32);
        img.set_pixel(0, 0, 0x80FF_FFFF);
        assert!(bmp.from_image(&img));
        let out = bmp.to_image(SurfaceRect::zero()).unwrap();
        assert_eq!(out.pixel(0, 0), 0x8080_8080);
    }

    #[test]
    fn fill_reports_confirmed_device_loss() {
        let backend = MockBackend::new();
        let mut bmp = bitmap(&backend);
        assert!(bmp.resize(SurfaceSize::new(2, 2)));
        assert_eq!(bmp.fill(Color::WHITE), EndDrawOutcome::Completed);
        backend.fail_next_end_draw(true);
        assert_eq!(bmp.fill(Color::WHITE), EndDrawOutcome::DeviceLost);
    }

    #[test]
    fn fill_invalidates_shadow() {
        let backend = MockBackend::new();
        let mut bmp = bitmap(&backend);
        let img = PixelBuffer::new(2, 2, PixelFormat::Argb32Premultiplied);
        assert!(bmp.from_image(&img));
        bmp.fill(Color::new([1.0, 0.0, 0.0, 1.0]));
        let out = bmp.to_image(SurfaceRect::zero()).unwrap();
        assert_eq!(out.pixel(1, 1), 0xFFFF_0000);
    }

    #[test]
    fn partial_to_image_crops() {
        let backend = MockBackend::new();
        let mut bmp = bitmap(&backend);
        let mut img = PixelBuffer::new(4, 4, PixelFormat::Argb32Premultiplied);
        img.set_pixel(3, 3, 0xFF12_3456);
        assert!(bmp.from_image(&img));
        let rect = SurfaceRect::new(SurfacePoint::new(3, 3), SurfacePoint::new(4, 4));
        let out = bmp.to_image(rect).unwrap();
        assert_eq!(out.size(), SurfaceSize::new(1, 1));
        assert_eq!(out.pixel(0, 0), 0xFF12_3456);
    }

    #[test]
    fn copy_from_bitmap_preserves_rect() {
        let backend = MockBackend::new();
        let mut a = bitmap(&backend);
        let mut b = bitmap(&backend);
        let mut img = PixelBuffer::new(2, 2, PixelFormat::Argb32Premultiplied);
        img.fill(0xFF66_7788);
        assert!(a.from_image(&img));
        assert!(b.resize(SurfaceSize::new(2, 2)));
        assert!(b.copy_from_bitmap(&a, img.rect(), SurfacePoint::origin()));
        let out = b.to_image(SurfaceRect::zero()).unwrap();
        assert_eq!(out.pixel(1, 0), 0xFF66_7788);
    }
}
