use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    /// Seconds before a pending/running entity may be re-entered.
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: i64,
    /// Queue OCR for every eligible task once a scan completes.
    #[serde(default = "default_auto_ocr")]
    pub auto_ocr: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            staleness_secs: default_staleness_secs(),
            auto_ocr: default_auto_ocr(),
        }
    }
}

impl ScanConfig {
    pub fn staleness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.staleness_secs)
    }
}

fn default_staleness_secs() -> i64 {
    mrkr_core::status::DEFAULT_STALENESS_SECS
}
fn default_auto_ocr() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    #[serde(default = "default_ocr_provider")]
    pub provider: String,
    #[serde(default = "default_language")]
    pub language: String,
    /// Rasterization resolution for PDF pages.
    #[serde(default = "default_dpi")]
    pub dpi: u32,
    #[serde(default = "default_tesseract_bin")]
    pub tesseract_bin: String,
    #[serde(default = "default_pdftocairo_bin")]
    pub pdftocairo_bin: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: default_ocr_provider(),
            language: default_language(),
            dpi: default_dpi(),
            tesseract_bin: default_tesseract_bin(),
            pdftocairo_bin: default_pdftocairo_bin(),
        }
    }
}

fn default_ocr_provider() -> String {
    "tesseract".to_string()
}
fn default_language() -> String {
    "eng".to_string()
}
fn default_dpi() -> u32 {
    200
}
fn default_tesseract_bin() -> String {
    "tesseract".to_string()
}
fn default_pdftocairo_bin() -> String {
    "pdftocairo".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    pub local: Option<LocalSourceConfig>,
    pub s3: Option<S3SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalSourceConfig {
    /// Relative project patterns are resolved against this directory.
    pub root: PathBuf,
    #[serde(default)]
    pub follow_symlinks: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct S3SourceConfig {
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.scan.staleness_secs < 0 {
        anyhow::bail!("scan.staleness_secs must be >= 0");
    }

    if config.ocr.dpi == 0 {
        anyhow::bail!("ocr.dpi must be > 0");
    }

    if config.ocr.language.trim().is_empty() {
        anyhow::bail!("ocr.language must not be empty");
    }

    match config.ocr.provider.as_str() {
        "tesseract" => {}
        other => anyhow::bail!("Unknown OCR provider: '{}'. Must be tesseract.", other),
    }

    Ok(config)
}
