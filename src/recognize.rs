//! Recognition adapters.
//!
//! A [`Recognizer`] turns one page image into pixel-space text regions. It
//! does no normalization; the OCR pipeline converts regions to percentages.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::instrument;

use mrkr_core::models::RecognizedRegion;

use crate::config::OcrConfig;
use crate::raster::{check_for_command_failure, PageImage};

#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Identifier stored on every result this recognizer produces.
    fn provider(&self) -> &str;

    async fn recognize(&self, image: &PageImage) -> Result<Vec<RecognizedRegion>>;
}

/// Build the recognizer named by `[ocr] provider`.
pub fn recognizer_from_config(config: &OcrConfig) -> Result<Arc<dyn Recognizer>> {
    match config.provider.as_str() {
        "tesseract" => Ok(Arc::new(TesseractRecognizer::new(
            config.tesseract_bin.clone(),
            config.language.clone(),
        ))),
        other => bail!("Unknown OCR provider: '{}'. Must be tesseract.", other),
    }
}

/// Wraps the `tesseract` CLI, reading its TSV output.
pub struct TesseractRecognizer {
    bin: String,
    language: String,
}

impl TesseractRecognizer {
    pub fn new(bin: String, language: String) -> Self {
        Self { bin, language }
    }
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    fn provider(&self) -> &str {
        "tesseract"
    }

    #[instrument(level = "debug", skip_all, fields(width = image.width, height = image.height))]
    async fn recognize(&self, image: &PageImage) -> Result<Vec<RecognizedRegion>> {
        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join(format!("input.{}", image.extension));
        let output_base = tmpdir.path().join("output");
        tokio::fs::write(&input_path, &image.data)
            .await
            .context("cannot write tesseract input file")?;

        let output = Command::new(&self.bin)
            .arg(&input_path)
            .arg(&output_base)
            .arg("-l")
            .arg(&self.language)
            .arg("tsv")
            .output()
            .await
            .with_context(|| format!("cannot run {}", self.bin))?;
        check_for_command_failure("tesseract", &output)?;

        let tsv = tokio::fs::read_to_string(output_base.with_extension("tsv"))
            .await
            .context("cannot read tesseract output file")?;
        parse_tsv(&tsv)
    }
}

/// Tesseract's word level in TSV output.
const WORD_LEVEL: &str = "5";
/// Every [`PageImage`] is one page; rows from further frames are ignored.
const FIRST_PAGE: &str = "1";

/// Extract word regions from tesseract TSV.
///
/// Columns: level, page_num, block_num, par_num, line_num, word_num, left,
/// top, width, height, conf, text. Only words on the first page are kept.
/// Rows with empty text are skipped; a negative confidence means "not
/// reported".
pub fn parse_tsv(tsv: &str) -> Result<Vec<RecognizedRegion>> {
    let mut regions = Vec::new();
    for (line_no, line) in tsv.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.splitn(12, '\t').collect();
        if fields.len() < 11 {
            bail!("malformed tesseract TSV at line {}: {:?}", line_no + 1, line);
        }
        if fields[0] != WORD_LEVEL || fields[1].trim() != FIRST_PAGE {
            continue;
        }
        let text = fields.get(11).map(|t| t.trim()).unwrap_or_default();
        if text.is_empty() {
            continue;
        }

        let number = |idx: usize| -> Result<f64> {
            fields[idx]
                .trim()
                .parse::<f64>()
                .with_context(|| format!("bad number at line {}, column {}", line_no + 1, idx + 1))
        };
        let conf = number(10)?;
        regions.push(RecognizedRegion {
            content: text.to_string(),
            confidence: (conf >= 0.0).then(|| conf / 100.0),
            left_px: number(6)?,
            top_px: number(7)?,
            width_px: number(8)?,
            height_px: number(9)?,
        });
    }
    Ok(regions)
}
