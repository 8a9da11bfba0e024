//! Plain raster buffers with explicit row-major layout.
//!
//! Images, masks and height fields are width/height/channel numeric buffers
//! with no dependency on any engine texture type. The `image` crate is used
//! only at the I/O boundary.

use image::DynamicImage;
use ndarray::Array4;

use crate::geometry::BoundingBox;

/// Single-channel f32 raster, row-major. Used for masks and height fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    data: Vec<f32>,
}

impl Raster {
    pub fn filled(width: usize, height: usize, value: f32) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    pub fn zeros(width: usize, height: usize) -> Self {
        Self::filled(width, height, 0.0)
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Option<Self> {
        if data.len() != width * height {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, value: f32) {
        self.data[y * self.width + x] = value;
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    /// Count of pixels at or above `threshold`.
    pub fn count_above(&self, threshold: f32) -> usize {
        self.data.iter().filter(|&&v| v >= threshold).count()
    }

    pub fn clamp_values(&mut self, min: f32, max: f32) {
        for v in &mut self.data {
            *v = v.clamp(min, max);
        }
    }

    /// Bilinear resize. A zero-sized target yields an empty raster.
    pub fn resize(&self, new_w: usize, new_h: usize) -> Raster {
        if new_w == 0 || new_h == 0 || self.is_empty() {
            return Raster::zeros(new_w, new_h);
        }
        let mut out = Raster::zeros(new_w, new_h);
        let sx = self.width as f32 / new_w as f32;
        let sy = self.height as f32 / new_h as f32;
        for y in 0..new_h {
            let fy = ((y as f32 + 0.5) * sy - 0.5).clamp(0.0, (self.height - 1) as f32);
            let y0 = fy.floor() as usize;
            let y1 = (y0 + 1).min(self.height - 1);
            let ty = fy - y0 as f32;
            for x in 0..new_w {
                let fx = ((x as f32 + 0.5) * sx - 0.5).clamp(0.0, (self.width - 1) as f32);
                let x0 = fx.floor() as usize;
                let x1 = (x0 + 1).min(self.width - 1);
                let tx = fx - x0 as f32;

                let top = self.get(x0, y0) * (1.0 - tx) + self.get(x1, y0) * tx;
                let bot = self.get(x0, y1) * (1.0 - tx) + self.get(x1, y1) * tx;
                out.set(x, y, top * (1.0 - ty) + bot * ty);
            }
        }
        out
    }
}

/// Interleaved RGB u8 raster, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct RgbRaster {
    pub width: usize,
    pub height: usize,
    data: Vec<u8>,
}

impl RgbRaster {
    pub fn filled(width: usize, height: usize, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width * height * 3);
        for _ in 0..width * height {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            data,
        }
    }

    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height * 3],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, rgb: [u8; 3]) {
        let i = (y * self.width + x) * 3;
        self.data[i] = rgb[0];
        self.data[i + 1] = rgb[1];
        self.data[i + 2] = rgb[2];
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Crop the region covered by `bbox`, clipped to the raster bounds.
    /// Returns an empty raster when nothing remains.
    pub fn crop(&self, bbox: &BoundingBox) -> RgbRaster {
        let x0 = (bbox.x.max(0.0) as usize).min(self.width);
        let y0 = (bbox.y.max(0.0) as usize).min(self.height);
        let x1 = (bbox.right().max(0.0).ceil() as usize).min(self.width);
        let y1 = (bbox.bottom().max(0.0).ceil() as usize).min(self.height);
        if x1 <= x0 || y1 <= y0 {
            return RgbRaster::zeros(0, 0);
        }
        let mut out = RgbRaster::zeros(x1 - x0, y1 - y0);
        for y in y0..y1 {
            for x in x0..x1 {
                out.set(x - x0, y - y0, self.get(x, y));
            }
        }
        out
    }

    /// Nearest-neighbor resize; crops fed to classifiers are small enough
    /// that bilinear filtering buys nothing.
    pub fn resize(&self, new_w: usize, new_h: usize) -> RgbRaster {
        if new_w == 0 || new_h == 0 || self.is_empty() {
            return RgbRaster::zeros(new_w, new_h);
        }
        let mut out = RgbRaster::zeros(new_w, new_h);
        for y in 0..new_h {
            let sy = (y * self.height / new_h).min(self.height - 1);
            for x in 0..new_w {
                let sx = (x * self.width / new_w).min(self.width - 1);
                out.set(x, y, self.get(sx, sy));
            }
        }
        out
    }

    /// NCHW float tensor in [0, 1], shape (1, 3, h, w).
    pub fn to_tensor(&self) -> Array4<f32> {
        let mut out = Array4::<f32>::zeros((1, 3, self.height, self.width));
        let scale = 1.0 / 255.0;
        for y in 0..self.height {
            for x in 0..self.width {
                let p = self.get(x, y);
                out[[0, 0, y, x]] = p[0] as f32 * scale;
                out[[0, 1, y, x]] = p[1] as f32 * scale;
                out[[0, 2, y, x]] = p[2] as f32 * scale;
            }
        }
        out
    }
}

impl From<&DynamicImage> for RgbRaster {
    fn from(img: &DynamicImage) -> Self {
        let rgb = img.to_rgb8();
        let (w, h) = rgb.dimensions();
        Self {
            width: w as usize,
            height: h as usize,
            data: rgb.into_raw(),
        }
    }
}
