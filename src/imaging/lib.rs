//! Stateless image transforms: bytes in, bytes out.

pub mod caption;
pub mod gauss;
pub mod gray;
pub mod recognition;
pub mod split;
pub mod threshold;

pub use gauss::GaussFilter;
pub use gray::GrayFilter;
pub use recognition::RecognitionFilter;
pub use threshold::ThresholdFilter;

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::io::Cursor;
use std::sync::Arc;

use crate::common::model::{Config, FilterType};
use crate::errors::{ConversionError, Error, Result};
use crate::resilience::ResilienceEnvelope;

pub(crate) const CHANNELS: usize = 4;

#[async_trait]
pub trait ImageFilter: Send + Sync {
    fn filter_type(&self) -> FilterType;

    /// Transform an encoded image, returning it re-encoded in the same format.
    /// Every failure carries the conversion error kind.
    async fn convert(&self, image: Vec<u8>) -> Result<Vec<u8>>;
}

/// A decoded image and the container format it came in.
pub(crate) struct Raster {
    pub image: RgbaImage,
    pub format: ImageFormat,
}

pub(crate) fn decode(bytes: &[u8]) -> Result<Raster> {
    let format = image::guess_format(bytes).map_err(|_| ConversionError::UnknownFormat)?;
    let image = image::load_from_memory_with_format(bytes, format)?.to_rgba8();
    Ok(Raster { image, format })
}

pub(crate) fn encode(image: RgbaImage, format: ImageFormat) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    let image = DynamicImage::ImageRgba8(image);
    match format {
        // no alpha channel in JPEG
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut out, format)?,
        _ => image.write_to(&mut out, format)?,
    }
    Ok(out.into_inner())
}

/// Run CPU-bound work off the async executor.
pub(crate) async fn run_blocking<T, F>(filter: FilterType, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::conversion_failed(filter, e.to_string()))?
}

/// Bounded rayon pool running divide-and-conquer pixel work.
#[derive(Clone)]
pub struct PixelPool {
    pool: Arc<rayon::ThreadPool>,
    split_threshold: usize,
}

impl PixelPool {
    pub fn new(workers: usize, split_threshold: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("pixel-worker-{}", i))
            .build()
            .map_err(|e| Error::conversion_failed("pool", e.to_string()))?;
        Ok(Self {
            pool: Arc::new(pool),
            split_threshold: split_threshold.max(1),
        })
    }

    pub fn split_threshold(&self) -> usize {
        self.split_threshold
    }

    /// Fill a `width x height` buffer of `channels`-sized pixels, one row per kernel call.
    pub fn map_rows<T, K>(&self, width: u32, height: u32, channels: usize, kernel: K) -> Vec<T>
    where
        T: Default + Clone + Send,
        K: Fn(u32, &mut [T]) + Sync,
    {
        let stride = width as usize * channels;
        let mut out = vec![T::default(); stride * height as usize];
        let threshold = self.split_threshold;
        self.pool.install(|| {
            split::fork_join(&mut out, stride, 0, width, threshold, &kernel);
        });
        out
    }

    /// Apply `kernel` to every pixel of `src`, producing a new image of the same size.
    pub fn map_pixels<K>(&self, src: &RgbaImage, kernel: K) -> RgbaImage
    where
        K: Fn([u8; 4]) -> [u8; 4] + Sync,
    {
        let (width, height) = src.dimensions();
        let stride = width as usize * CHANNELS;
        let raw = src.as_raw();
        let out = self.map_rows(width, height, CHANNELS, |y, row: &mut [u8]| {
            let start = y as usize * stride;
            let source = &raw[start..start + stride];
            for (dst, px) in row
                .chunks_exact_mut(CHANNELS)
                .zip(source.chunks_exact(CHANNELS))
            {
                dst.copy_from_slice(&kernel([px[0], px[1], px[2], px[3]]));
            }
        });
        RgbaImage::from_raw(width, height, out).unwrap_or_else(|| RgbaImage::new(width, height))
    }
}

/// Decode, run a per-image transform on the pixel pool, re-encode.
pub(crate) async fn transform<F>(filter: FilterType, bytes: Vec<u8>, f: F) -> Result<Vec<u8>>
where
    F: FnOnce(&RgbaImage) -> RgbaImage + Send + 'static,
{
    run_blocking(filter, move || {
        let raster = decode(&bytes)?;
        let image = f(&raster.image);
        encode(image, raster.format)
    })
    .await
    .map_err(|e| {
        if e.is_conversion() {
            e
        } else {
            Error::conversion_failed(filter, e.to_string())
        }
    })
}

/// Build the filter a stage applies.
pub fn build_filter(config: &Config) -> Result<Arc<dyn ImageFilter>> {
    let pool = PixelPool::new(config.filter.workers, config.filter.split_threshold)?;
    let filter: Arc<dyn ImageFilter> = match config.stage.filter {
        FilterType::Gray => Arc::new(GrayFilter::new(pool)),
        FilterType::Gauss => Arc::new(GaussFilter::new(pool, config.filter.sigma)),
        FilterType::Threshold => Arc::new(ThresholdFilter::new(pool)),
        FilterType::Recognition => {
            let envelope = Arc::new(ResilienceEnvelope::from_config(&config.integration));
            let font = caption::load_font(config.filter.font_path.as_deref());
            Arc::new(RecognitionFilter::new(
                &config.integration,
                envelope,
                config.filter.tags_limit,
                font,
            )?)
        }
    };
    Ok(filter)
}
