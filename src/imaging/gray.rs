use async_trait::async_trait;

use super::{ImageFilter, PixelPool, transform};
use crate::common::model::FilterType;
use crate::errors::Result;

/// Luma of an RGB triple, truncated.
pub fn luminance(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64) as u8
}

pub struct GrayFilter {
    pool: PixelPool,
}

impl GrayFilter {
    pub fn new(pool: PixelPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageFilter for GrayFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Gray
    }

    async fn convert(&self, image: Vec<u8>) -> Result<Vec<u8>> {
        let pool = self.pool.clone();
        transform(FilterType::Gray, image, move |src| {
            pool.map_pixels(src, |[r, g, b, a]| {
                let y = luminance(r, g, b);
                [y, y, y, a]
            })
        })
        .await
    }
}
