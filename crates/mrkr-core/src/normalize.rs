//! Pixel to percentage conversion for OCR bounding boxes.
//!
//! Stored blocks never carry raw pixels. Every coordinate is a percentage of
//! its page's width or height, rounded to five decimals, so labels placed on
//! a block survive re-rendering at a different resolution.

use anyhow::{bail, Result};

use crate::models::{Block, BlockKind, Page, RecognizedRegion};

const PRECISION: f64 = 100_000.0;

fn round5(value: f64) -> f64 {
    (value * PRECISION).round() / PRECISION
}

/// `value` as a percentage of `extent`, rounded to five decimals.
pub fn to_percent(value: f64, extent: u32) -> f64 {
    round5(value / extent as f64 * 100.0)
}

/// Convert a pixel-space region into a stored block.
pub fn normalize_region(region: &RecognizedRegion, width: u32, height: u32) -> Result<Block> {
    if width == 0 || height == 0 {
        bail!("cannot normalize against a {}x{} page", width, height);
    }
    Ok(Block {
        kind: BlockKind::Word,
        content: region.content.clone(),
        confidence: region.confidence,
        left: to_percent(region.left_px, width),
        top: to_percent(region.top_px, height),
        width: to_percent(region.width_px, width),
        height: to_percent(region.height_px, height),
    })
}

/// Build a page from an image's dimensions and its recognized regions.
pub fn build_page(index: u32, width: u32, height: u32, regions: &[RecognizedRegion]) -> Result<Page> {
    let blocks = regions
        .iter()
        .map(|r| normalize_region(r, width, height))
        .collect::<Result<Vec<_>>>()?;
    Ok(Page {
        index,
        width,
        height,
        blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(left: f64, top: f64, width: f64, height: f64) -> RecognizedRegion {
        RecognizedRegion {
            content: "total".to_string(),
            confidence: Some(0.93),
            left_px: left,
            top_px: top,
            width_px: width,
            height_px: height,
        }
    }

    #[test]
    fn converts_to_percentages() {
        let block = normalize_region(&region(100.0, 50.0, 200.0, 25.0), 1000, 500).unwrap();
        assert_eq!(block.left, 10.0);
        assert_eq!(block.top, 10.0);
        assert_eq!(block.width, 20.0);
        assert_eq!(block.height, 5.0);
        assert_eq!(block.kind, BlockKind::Word);
        assert_eq!(block.confidence, Some(0.93));
    }

    #[test]
    fn rounds_to_five_decimals() {
        let block = normalize_region(&region(1.0, 1.0, 1.0, 1.0), 3, 7).unwrap();
        assert_eq!(block.left, 33.33333);
        assert_eq!(block.top, 14.28571);
    }

    #[test]
    fn percentages_reproduce_pixels() {
        let (w, h) = (2481_u32, 3508_u32);
        let original = region(317.0, 1299.0, 842.0, 61.0);
        let block = normalize_region(&original, w, h).unwrap();

        let back = |pct: f64, extent: u32| pct / 100.0 * extent as f64;
        // Five decimals of a percentage is 1e-7 of the extent.
        let tolerance = 1e-7 * w.max(h) as f64;
        assert!((back(block.left, w) - original.left_px).abs() <= tolerance);
        assert!((back(block.top, h) - original.top_px).abs() <= tolerance);
        assert!((back(block.width, w) - original.width_px).abs() <= tolerance);
        assert!((back(block.height, h) - original.height_px).abs() <= tolerance);
    }

    #[test]
    fn zero_sized_page_is_rejected() {
        assert!(normalize_region(&region(0.0, 0.0, 1.0, 1.0), 0, 10).is_err());
    }

    #[test]
    fn build_page_keeps_region_order() {
        let regions = vec![region(0.0, 0.0, 10.0, 10.0), region(50.0, 0.0, 10.0, 10.0)];
        let page = build_page(2, 100, 100, &regions).unwrap();
        assert_eq!(page.index, 2);
        assert_eq!(page.blocks.len(), 2);
        assert_eq!(page.blocks[1].left, 50.0);
    }
}
