use async_trait::async_trait;
use image::RgbaImage;
use std::sync::Arc;

use super::{CHANNELS, ImageFilter, PixelPool, transform};
use crate::common::model::FilterType;
use crate::errors::Result;

/// Normalized Gaussian kernel centred on an integer offset.
///
/// The 2D weight `exp(-(x²+y²)/(2σ²))` factors into a product of two 1D
/// weights, so blurring runs as a horizontal pass followed by a vertical
/// one. The result equals the normalized 2D convolution.
#[derive(Debug, Clone)]
pub struct GaussKernel {
    radius: usize,
    weights: Vec<f64>,
}

impl GaussKernel {
    pub fn new(sigma: f64) -> Self {
        let mut size = (6.0 * sigma).ceil().max(1.0) as usize;
        if size % 2 == 0 {
            size += 1;
        }
        let radius = size / 2;
        let two_sigma_sq = 2.0 * sigma * sigma;
        let raw: Vec<f64> = (0..size)
            .map(|i| {
                let d = i as f64 - radius as f64;
                (-(d * d) / two_sigma_sq).exp()
            })
            .collect();
        let sum: f64 = raw.iter().sum();
        let weights = raw.into_iter().map(|w| w / sum).collect();
        Self { radius, weights }
    }

    pub fn size(&self) -> usize {
        self.weights.len()
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    /// Weight applied to the sample at offset (dx, dy) from the centre.
    pub fn weight(&self, dx: isize, dy: isize) -> f64 {
        let at = |d: isize| {
            let i = d + self.radius as isize;
            if i < 0 {
                0.0
            } else {
                self.weights.get(i as usize).copied().unwrap_or(0.0)
            }
        };
        at(dx) * at(dy)
    }
}

fn clamp_index(i: isize, len: u32) -> usize {
    i.clamp(0, len as isize - 1) as usize
}

/// Blur `src` on the pool: rows first into an f64 buffer, then columns.
pub fn blur(pool: &PixelPool, src: &RgbaImage, kernel: &GaussKernel) -> RgbaImage {
    let (width, height) = src.dimensions();
    if width == 0 || height == 0 {
        return src.clone();
    }
    let stride = width as usize * CHANNELS;
    let raw = src.as_raw();
    let radius = kernel.radius as isize;

    let horizontal: Vec<f64> = pool.map_rows(width, height, CHANNELS, |y, row: &mut [f64]| {
        let line = &raw[y as usize * stride..(y as usize + 1) * stride];
        for x in 0..width as usize {
            let mut acc = [0.0f64; CHANNELS];
            for (k, w) in kernel.weights.iter().enumerate() {
                let sx = clamp_index(x as isize + k as isize - radius, width);
                let px = &line[sx * CHANNELS..(sx + 1) * CHANNELS];
                for c in 0..CHANNELS {
                    acc[c] += w * px[c] as f64;
                }
            }
            row[x * CHANNELS..(x + 1) * CHANNELS].copy_from_slice(&acc);
        }
    });

    let out: Vec<u8> = pool.map_rows(width, height, CHANNELS, |y, row: &mut [u8]| {
        for x in 0..width as usize {
            let mut acc = [0.0f64; CHANNELS];
            for (k, w) in kernel.weights.iter().enumerate() {
                let sy = clamp_index(y as isize + k as isize - radius, height);
                let base = sy * stride + x * CHANNELS;
                for c in 0..CHANNELS {
                    acc[c] += w * horizontal[base + c];
                }
            }
            for c in 0..CHANNELS {
                row[x * CHANNELS + c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
        }
    });

    RgbaImage::from_raw(width, height, out).unwrap_or_else(|| src.clone())
}

pub struct GaussFilter {
    pool: PixelPool,
    kernel: Arc<GaussKernel>,
}

impl GaussFilter {
    pub fn new(pool: PixelPool, sigma: f64) -> Self {
        Self {
            pool,
            kernel: Arc::new(GaussKernel::new(sigma)),
        }
    }
}

#[async_trait]
impl ImageFilter for GaussFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Gauss
    }

    async fn convert(&self, image: Vec<u8>) -> Result<Vec<u8>> {
        let pool = self.pool.clone();
        let kernel = self.kernel.clone();
        transform(FilterType::Gauss, image, move |src| blur(&pool, src, &kernel)).await
    }
}
