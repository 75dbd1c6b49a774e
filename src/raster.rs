//! Turn a source file into page images.
//!
//! PDFs are rasterized with Poppler's `pdftocairo`, one PNG per page. Any
//! other file is treated as a single-page image and decoded only to learn
//! its pixel dimensions; the original bytes are handed to the recognizer.

use std::io::Cursor;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use image::ImageFormat;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::config::OcrConfig;

/// One rasterized page, ready for recognition.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub width: u32,
    pub height: u32,
    /// Encoded image bytes.
    pub data: Vec<u8>,
    /// File extension matching `data`, used when writing it to disk.
    pub extension: String,
}

impl PageImage {
    /// Decode `data` far enough to read its dimensions.
    ///
    /// PNG and JPEG bytes are passed on untouched. Anything else (TIFF, BMP,
    /// ...) is re-encoded as PNG from its first frame, so the recognizer
    /// always sees exactly the one page these dimensions describe.
    pub fn from_encoded(data: Vec<u8>, extension: &str) -> Result<Self> {
        let image = image::load_from_memory(&data).context("cannot decode image")?;
        let (width, height) = (image.width(), image.height());
        if matches!(extension, "png" | "jpg" | "jpeg") {
            return Ok(Self {
                width,
                height,
                data,
                extension: extension.to_string(),
            });
        }

        let mut png = Cursor::new(Vec::new());
        image
            .write_to(&mut png, ImageFormat::Png)
            .context("cannot re-encode image as PNG")?;
        Ok(Self {
            width,
            height,
            data: png.into_inner(),
            extension: "png".to_string(),
        })
    }
}

/// Rasterization settings shared by every content source.
#[derive(Debug, Clone)]
pub struct Rasterizer {
    pub dpi: u32,
    pub pdftocairo_bin: String,
}

impl Rasterizer {
    pub fn from_config(config: &OcrConfig) -> Self {
        Self {
            dpi: config.dpi,
            pdftocairo_bin: config.pdftocairo_bin.clone(),
        }
    }

    /// Rasterize `data`, choosing the strategy from the extension of `uri`.
    #[instrument(level = "debug", skip_all, fields(uri = %uri))]
    pub async fn rasterize(&self, uri: &str, data: Vec<u8>) -> Result<Vec<PageImage>> {
        let extension = extension_of(uri);
        match extension.as_str() {
            "pdf" => self.rasterize_pdf(data).await,
            "" => bail!("cannot determine file type of '{}'", uri),
            ext => Ok(vec![PageImage::from_encoded(data, ext)
                .with_context(|| format!("cannot read image '{}'", uri))?]),
        }
    }

    async fn rasterize_pdf(&self, data: Vec<u8>) -> Result<Vec<PageImage>> {
        let tmpdir = tempfile::TempDir::with_prefix("mrkr-pages")?;
        let input_path = tmpdir.path().join("input.pdf");
        tokio::fs::write(&input_path, &data)
            .await
            .context("cannot write pdftocairo input file")?;

        let out_dir = tmpdir.path().join("pages");
        tokio::fs::create_dir(&out_dir).await?;

        // pdftocairo appends a zero-padded page number to this prefix.
        let output = Command::new(&self.pdftocairo_bin)
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(&input_path)
            .arg(out_dir.join("page"))
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.pdftocairo_bin))?;
        check_for_command_failure("pdftocairo", &output)?;

        let mut paths = std::fs::read_dir(&out_dir)
            .with_context(|| format!("failed to read {}", out_dir.display()))?
            .map(|entry| Ok(entry?.path()))
            .collect::<Result<Vec<_>>>()?;
        paths.sort();

        if paths.is_empty() {
            bail!("pdftocairo produced no pages");
        }

        let mut pages = Vec::with_capacity(paths.len());
        for path in &paths {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("cannot read page {}", path.display()))?;
            pages.push(PageImage::from_encoded(bytes, "png")?);
        }
        debug!(pages = pages.len(), "Rasterized PDF");
        Ok(pages)
    }
}

/// Lowercased extension of the last path segment of `uri`.
pub fn extension_of(uri: &str) -> String {
    Path::new(uri.rsplit('/').next().unwrap_or(uri))
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Fail with the command's stderr if it exited unsuccessfully.
pub fn check_for_command_failure(command_name: &str, output: &std::process::Output) -> Result<()> {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if output.status.success() {
        if !stderr.trim().is_empty() {
            warn!(command_name, output = %stderr.trim(), "Command wrote to stderr");
        }
        Ok(())
    } else {
        Err(anyhow!(
            "{} failed with {}:\n{}",
            command_name,
            output.status,
            stderr.trim()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let image = image::RgbImage::new(width, height);
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), format).unwrap();
        bytes
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        encode(width, height, ImageFormat::Png)
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of("scans/Invoice.PDF"), "pdf");
        assert_eq!(extension_of("s3://bucket/a/b.png"), "png");
        assert_eq!(extension_of("README"), "");
    }

    #[tokio::test]
    async fn single_image_keeps_bytes_and_reads_dimensions() {
        let rasterizer = Rasterizer {
            dpi: 200,
            pdftocairo_bin: "pdftocairo".to_string(),
        };
        let data = png(40, 30);
        let pages = rasterizer.rasterize("a/page.png", data.clone()).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!((pages[0].width, pages[0].height), (40, 30));
        assert_eq!(pages[0].data, data);
        assert_eq!(pages[0].extension, "png");
    }

    #[tokio::test]
    async fn garbage_image_is_an_error() {
        let rasterizer = Rasterizer {
            dpi: 200,
            pdftocairo_bin: "pdftocairo".to_string(),
        };
        assert!(rasterizer
            .rasterize("a/page.png", b"not a png".to_vec())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn tiff_becomes_a_single_png_page() {
        let rasterizer = Rasterizer {
            dpi: 200,
            pdftocairo_bin: "pdftocairo".to_string(),
        };
        let tiff = encode(64, 48, ImageFormat::Tiff);
        let pages = rasterizer.rasterize("scans/fax.TIFF", tiff).await.unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!((pages[0].width, pages[0].height), (64, 48));
        assert_eq!(pages[0].extension, "png");
        assert!(pages[0].data.starts_with(b"\x89PNG"));
    }
}
