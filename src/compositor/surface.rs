//! RGBA compositing surface

use super::geometry::{CompositeError, NativeRect};
use crate::capture::Resolution;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 8-bit straight-alpha colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rgba(pub [u8; 4]);

impl Rgba {
    pub const TRANSPARENT: Self = Self([0, 0, 0, 0]);
    pub const BLACK: Self = Self([0, 0, 0, 255]);
    pub const WHITE: Self = Self([255, 255, 255, 255]);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self([r, g, b, 255])
    }

    pub fn alpha(&self) -> u8 {
        self.0[3]
    }

    /// Parse `#rrggbb` or `#rrggbbaa`
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        if !digits.is_ascii() || (digits.len() != 6 && digits.len() != 8) {
            return None;
        }

        let channel = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).ok();
        let alpha = if digits.len() == 8 { channel(6)? } else { 255 };
        Some(Self([channel(0)?, channel(2)?, channel(4)?, alpha]))
    }
}

/// An RGBA pixel buffer
#[derive(Clone, PartialEq, Eq)]
pub struct Surface {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl Surface {
    /// A fully transparent surface
    pub fn new(width: u32, height: u32) -> Self {
        Self::filled(width, height, Rgba::TRANSPARENT)
    }

    pub fn filled(width: u32, height: u32, color: Rgba) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * 4);
        for _ in 0..pixels {
            data.extend_from_slice(&color.0);
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Wrap raw RGBA bytes
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> Result<Self, CompositeError> {
        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(CompositeError::FrameSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    fn index(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgba> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = self.index(x, y);
        Some(Rgba([
            self.data[i],
            self.data[i + 1],
            self.data[i + 2],
            self.data[i + 3],
        ]))
    }

    pub fn fill(&mut self, color: Rgba) {
        for px in self.data.chunks_exact_mut(4) {
            px.copy_from_slice(&color.0);
        }
    }

    /// Source-over blend of a single pixel, ignoring out-of-bounds writes
    pub fn blend_pixel(&mut self, x: u32, y: u32, color: Rgba) {
        if x >= self.width || y >= self.height {
            return;
        }
        let i = self.index(x, y);
        blend_into(&mut self.data[i..i + 4], color.0);
    }

    /// Opaque nearest-neighbour copy of `src` scaled into `dest`
    pub fn draw_scaled(&mut self, src: &Surface, dest: NativeRect) {
        self.scale_with(src, dest, |dst, px| {
            dst[..3].copy_from_slice(&px[..3]);
            dst[3] = 255;
        });
    }

    /// Alpha-blended nearest-neighbour copy of `src` scaled into `dest`
    pub fn blend_scaled(&mut self, src: &Surface, dest: NativeRect) {
        self.scale_with(src, dest, |dst, px| {
            blend_into(dst, [px[0], px[1], px[2], px[3]]);
        });
    }

    fn scale_with<F>(&mut self, src: &Surface, dest: NativeRect, mut write: F)
    where
        F: FnMut(&mut [u8], &[u8]),
    {
        if src.width == 0 || src.height == 0 || !dest.intersects(self.resolution()) {
            return;
        }

        let x0 = dest.x.max(0);
        let y0 = dest.y.max(0);
        let x1 = (dest.x + dest.width as i64).min(self.width as i64);
        let y1 = (dest.y + dest.height as i64).min(self.height as i64);

        for fy in y0..y1 {
            let dy = (fy - dest.y) as u64;
            let sy = (dy * src.height as u64 / dest.height as u64).min(src.height as u64 - 1);

            for fx in x0..x1 {
                let dx = (fx - dest.x) as u64;
                let sx = (dx * src.width as u64 / dest.width as u64).min(src.width as u64 - 1);

                let si = src.index(sx as u32, sy as u32);
                let di = self.index(fx as u32, fy as u32);
                write(&mut self.data[di..di + 4], &src.data[si..si + 4]);
            }
        }
    }

    /// Encode as PNG
    pub fn encode_png(&self) -> Result<Vec<u8>, CompositeError> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, self.width, self.height);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder
                .write_header()
                .map_err(|e| CompositeError::Png(e.to_string()))?;
            writer
                .write_image_data(&self.data)
                .map_err(|e| CompositeError::Png(e.to_string()))?;
        }
        Ok(out)
    }
}

/// Integer source-over blend of `src` onto `dst`
fn blend_into(dst: &mut [u8], src: [u8; 4]) {
    let sa = src[3] as u32;
    if sa == 0 {
        return;
    }
    if sa == 255 {
        dst.copy_from_slice(&src);
        return;
    }

    let da = dst[3] as u32;
    let inv = 255 - sa;
    // Output alpha scaled by 255
    let out_a = sa * 255 + da * inv;
    if out_a == 0 {
        dst.copy_from_slice(&[0, 0, 0, 0]);
        return;
    }

    for c in 0..3 {
        let v = (src[c] as u32 * sa * 255 + dst[c] as u32 * da * inv + out_a / 2) / out_a;
        dst[c] = v.min(255) as u8;
    }
    dst[3] = ((out_a + 127) / 255).min(255) as u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_hex() {
        assert_eq!(Rgba::from_hex("#ff0000"), Some(Rgba::rgb(255, 0, 0)));
        assert_eq!(Rgba::from_hex("00ff0080"), Some(Rgba([0, 255, 0, 128])));
        assert_eq!(Rgba::from_hex("#fff"), None);
        assert_eq!(Rgba::from_hex("#gg0000"), None);
    }

    #[test]
    fn test_from_rgba_size_check() {
        assert!(Surface::from_rgba(2, 2, vec![0; 16]).is_ok());
        assert_eq!(
            Surface::from_rgba(2, 2, vec![0; 15]),
            Err(CompositeError::FrameSize {
                expected: 16,
                actual: 15
            })
        );
    }

    #[test]
    fn test_draw_scaled_upscales_and_clips() {
        let mut frame = Surface::filled(4, 4, Rgba::BLACK);
        let mut src = Surface::filled(2, 1, Rgba::rgb(255, 0, 0));
        src.blend_pixel(1, 0, Rgba::rgb(0, 0, 255));

        frame.draw_scaled(
            &src,
            NativeRect {
                x: 2,
                y: -1,
                width: 4,
                height: 2,
            },
        );

        assert_eq!(frame.pixel(2, 0), Some(Rgba::rgb(255, 0, 0)));
        assert_eq!(frame.pixel(3, 0), Some(Rgba::rgb(255, 0, 0)));
        assert_eq!(frame.pixel(1, 0), Some(Rgba::BLACK));
        assert_eq!(frame.pixel(2, 1), Some(Rgba::BLACK));
    }

    #[test]
    fn test_blend_transparent_is_noop() {
        let mut frame = Surface::filled(2, 2, Rgba::WHITE);
        let overlay = Surface::new(2, 2);
        frame.blend_scaled(&overlay, NativeRect::full(frame.resolution()));
        assert_eq!(frame, Surface::filled(2, 2, Rgba::WHITE));
    }

    #[test]
    fn test_blend_half_alpha_over_opaque() {
        let mut frame = Surface::filled(1, 1, Rgba::BLACK);
        frame.blend_pixel(0, 0, Rgba([255, 255, 255, 128]));
        let px = frame.pixel(0, 0).unwrap();
        assert_eq!(px.alpha(), 255);
        assert_eq!(px.0[0], 128);
    }

    #[test]
    fn test_encode_png_signature() {
        let png = Surface::filled(3, 2, Rgba::rgb(1, 2, 3)).encode_png().unwrap();
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }
}
