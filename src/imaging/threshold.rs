use async_trait::async_trait;

use super::{ImageFilter, PixelPool, transform};
use crate::common::model::FilterType;
use crate::errors::Result;

const CUTOFF: u8 = 128;

pub fn binarize([r, g, b, a]: [u8; 4]) -> [u8; 4] {
    if r >= CUTOFF || g >= CUTOFF || b >= CUTOFF {
        [255, 255, 255, a]
    } else {
        [0, 0, 0, a]
    }
}

pub struct ThresholdFilter {
    pool: PixelPool,
}

impl ThresholdFilter {
    pub fn new(pool: PixelPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageFilter for ThresholdFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::Threshold
    }

    async fn convert(&self, image: Vec<u8>) -> Result<Vec<u8>> {
        let pool = self.pool.clone();
        transform(FilterType::Threshold, image, move |src| {
            pool.map_pixels(src, binarize)
        })
        .await
    }
}
