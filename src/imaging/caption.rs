use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use image::{Rgba, RgbaImage};
use imageproc::drawing::draw_text_mut;
use log::{debug, info, warn};
use std::path::Path;

const TEXT_COLOR: Rgba<u8> = Rgba([0, 0, 0, 255]);
const INITIAL_SIZE_RATIO: f32 = 0.05;
const SHRINK_FACTOR: f32 = 0.95;
const MAX_WIDTH_RATIO: f32 = 0.96;
const MARGIN_RATIO: f32 = 0.02;
const MIN_FONT_SIZE: f32 = 1.0;

const SYSTEM_FONTS: [&str; 5] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Load the configured font, falling back to common system locations.
pub fn load_font(path: Option<&Path>) -> Option<FontVec> {
    if let Some(path) = path {
        match std::fs::read(path).map(FontVec::try_from_vec) {
            Ok(Ok(font)) => {
                info!("Loaded caption font: {}", path.display());
                return Some(font);
            }
            Ok(Err(_)) => warn!("Failed to parse font file: {}", path.display()),
            Err(e) => warn!("Failed to read font file {}: {}", path.display(), e),
        }
    }

    for path in &SYSTEM_FONTS {
        if let Ok(font_data) = std::fs::read(path)
            && let Ok(font) = FontVec::try_from_vec(font_data)
        {
            info!("Loaded system font: {}", path);
            return Some(font);
        }
    }

    warn!("No font found, captions will be skipped");
    None
}

pub fn measure_text_width(text: &str, font: &FontVec, size: f32) -> f32 {
    let scaled_font = font.as_scaled(PxScale::from(size));
    text.chars()
        .map(|ch| scaled_font.h_advance(scaled_font.scaled_glyph(ch).id))
        .sum()
}

/// Largest size, starting at 5% of the width and shrinking by 5% a step,
/// whose rendered width fits in 96% of the image.
pub fn fit_font_size(image_width: u32, measure: impl Fn(f32) -> f32) -> f32 {
    let max_width = image_width as f32 * MAX_WIDTH_RATIO;
    let mut size = image_width as f32 * INITIAL_SIZE_RATIO;
    while size > MIN_FONT_SIZE && measure(size) > max_width {
        size *= SHRINK_FACTOR;
    }
    size
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptionLayout {
    pub size: f32,
    pub x: i32,
    /// Top of the text box, as `draw_text_mut` expects.
    pub y: i32,
    pub baseline: f32,
}

pub fn layout(image: &RgbaImage, text: &str, font: &FontVec) -> CaptionLayout {
    let (width, height) = image.dimensions();
    let size = fit_font_size(width, |s| measure_text_width(text, font, s));
    let scaled_font = font.as_scaled(PxScale::from(size));
    // ab_glyph reports descent as a negative offset below the baseline
    let descent = scaled_font.descent().abs();
    let baseline = height as f32 - descent - height as f32 * MARGIN_RATIO;
    CaptionLayout {
        size,
        x: (width as f32 * MARGIN_RATIO) as i32,
        y: (baseline - scaled_font.ascent()).round() as i32,
        baseline,
    }
}

/// Draw `text` left-aligned near the bottom edge.
pub fn draw_caption(image: &mut RgbaImage, text: &str, font: &FontVec) {
    if text.is_empty() || image.width() == 0 || image.height() == 0 {
        return;
    }
    let layout = layout(image, text, font);
    debug!(
        "Drawing caption at ({}, {}) size {:.1}: {}",
        layout.x, layout.y, layout.size, text
    );
    draw_text_mut(
        image,
        TEXT_COLOR,
        layout.x,
        layout.y,
        PxScale::from(layout.size),
        font,
        text,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_font_size_starts_at_five_percent() {
        let size = fit_font_size(1000, |_| 10.0);
        assert!((size - 50.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_font_size_shrinks_until_it_fits() {
        // width grows linearly with size: 40 glyphs at 0.6em each
        let measure = |s: f32| s * 0.6 * 40.0;
        let size = fit_font_size(1000, measure);
        assert!(measure(size) <= 960.0);
        assert!(measure(size / SHRINK_FACTOR) > 960.0);
    }

    #[test]
    fn test_layout_with_system_font() {
        let Some(font) = load_font(None) else {
            return;
        };
        let image = RgbaImage::from_pixel(400, 300, Rgba([255, 255, 255, 255]));
        let text = "dog, animal, pet";
        let layout = layout(&image, text, &font);
        assert_eq!(layout.x, 8);
        assert!(layout.baseline < 300.0 - 6.0);
        assert!(measure_text_width(text, &font, layout.size) <= 400.0 * MAX_WIDTH_RATIO);

        let mut canvas = image.clone();
        draw_caption(&mut canvas, text, &font);
        assert!(canvas.pixels().any(|p| p.0[0] < 128));
    }
}
