//! CPU-side pixel storage shared between the core and the backends.
//!
//! Pixels are 32-bit BGRA in memory (little-endian `0xAARRGGBB` when
//! read as a `u32`), matching `DXGI_FORMAT_B8G8R8A8_UNORM`. All GPU
//! surfaces hold premultiplied alpha; the straight-alpha and opaque
//! formats only exist at the API edge and are converted on upload.

use crate::{SurfaceRect, SurfaceSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// BGRA, color channels premultiplied by alpha. The only format the
    /// GPU ever sees.
    Argb32Premultiplied,
    /// BGRA with straight (non-premultiplied) alpha.
    Argb32,
    /// BGRX, alpha byte ignored.
    Rgb32,
}

/// Owned pixel rectangle. Rows are tightly packed 32-bit words so the
/// byte view is always 4-aligned.
#[derive(Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u32>,
}

impl std::fmt::Debug for PixelBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PixelBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl PixelBuffer {
    /// Zero-filled buffer (transparent black, or black for `Rgb32`).
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            data: vec![0; width as usize * height as usize],
        }
    }

    /// Repacks raw BGRA rows with an arbitrary byte stride.
    pub fn from_bytes(
        width: u32,
        height: u32,
        stride: usize,
        format: PixelFormat,
        bytes: &[u8],
    ) -> Self {
        assert!(stride >= width as usize * 4);
        assert!(bytes.len() >= stride * height as usize);
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height as usize {
            let row = &bytes[y * stride..y * stride + width as usize * 4];
            data.extend(
                row.chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }
        Self { width, height, format, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn size(&self) -> SurfaceSize {
        SurfaceSize::new(self.width, self.height)
    }

    pub fn rect(&self) -> SurfaceRect {
        SurfaceRect::from_size(self.size())
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> usize {
        self.width as usize * 4
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.data)
    }

    pub fn words(&self) -> &[u32] {
        &self.data
    }

    pub fn row(&self, y: u32) -> &[u32] {
        let start = y as usize * self.width as usize;
        &self.data[start..start + self.width as usize]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u32] {
        let start = y as usize * self.width as usize;
        let end = start + self.width as usize;
        &mut self.data[start..end]
    }

    /// Pixel as `0xAARRGGBB`.
    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.row(y)[x as usize]
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, argb: u32) {
        self.row_mut(y)[x as usize] = argb;
    }

    pub fn fill(&mut self, argb: u32) {
        self.data.fill(argb);
    }

    /// Copies `src` into `self` at `(dst_x, dst_y)`, clipping to both
    /// buffers. No format conversion is performed.
    pub fn blit_from(&mut self, src: &PixelBuffer, dst_x: u32, dst_y: u32) {
        let w = src.width.min(self.width.saturating_sub(dst_x));
        let h = src.height.min(self.height.saturating_sub(dst_y));
        for y in 0..h {
            let src_start = y as usize * src.width as usize;
            let dst_start = (dst_y + y) as usize * self.width as usize + dst_x as usize;
            self.data[dst_start..dst_start + w as usize]
                .copy_from_slice(&src.data[src_start..src_start + w as usize]);
        }
    }

    /// Extracts `rect` (clamped to the buffer) as a tightly packed copy.
    pub fn copy_rect(&self, rect: SurfaceRect) -> PixelBuffer {
        let rect = match rect.intersection(&self.rect()) {
            Some(r) => r,
            None => return PixelBuffer::new(0, 0, self.format),
        };
        let mut out = PixelBuffer::new(rect.width(), rect.height(), self.format);
        for y in 0..rect.height() {
            let src = &self.row(rect.min.y + y)[rect.min.x as usize..rect.max.x as usize];
            out.row_mut(y).copy_from_slice(src);
        }
        out
    }

    /// Converts to `format`, allocating only when a conversion is
    /// actually needed.
    pub fn convert_to(&self, format: PixelFormat) -> PixelBuffer {
        if self.format == format {
            return self.clone();
        }
        let mut out = self.clone();
        out.format = format;
        for px in &mut out.data {
            *px = convert_pixel(*px, self.format, format);
        }
        out
    }
}

fn convert_pixel(px: u32, from: PixelFormat, to: PixelFormat) -> u32 {
    use PixelFormat::*;
    let straight = match from {
        Argb32 => px,
        Rgb32 => px | 0xFF00_0000,
        Argb32Premultiplied => unpremultiply(px),
    };
    match to {
        Argb32 => straight,
        Rgb32 => straight | 0xFF00_0000,
        Argb32Premultiplied => premultiply(straight),
    }
}

/// Straight to premultiplied, rounding to nearest.
pub fn premultiply(px: u32) -> u32 {
    let a = px >> 24;
    if a == 255 {
        return px;
    }
    let mul = |c: u32| (c * a + 127) / 255;
    (a << 24)
        | (mul((px >> 16) & 0xFF) << 16)
        | (mul((px >> 8) & 0xFF) << 8)
        | mul(px & 0xFF)
}

/// Premultiplied to straight. Zero alpha maps to transparent black.
pub fn unpremultiply(px: u32) -> u32 {
    let a = px >> 24;
    if a == 255 {
        return px;
    }
    if a == 0 {
        return 0;
    }
    let div = |c: u32| ((c * 255 + a / 2) / a).min(255);
    (a << 24)
        | (div((px >> 16) & 0xFF) << 16)
        | (div((px >> 8) & 0xFF) << 8)
        | div(px & 0xFF)
}

/// Packs a float color as premultiplied `0xAARRGGBB`.
pub fn pack_color(color: peniko::Color) -> u32 {
    let [r, g, b, a] = color.components;
    let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u32;
    premultiply((q(a) << 24) | (q(r) << 16) | (q(g) << 8) | q(b))
}
