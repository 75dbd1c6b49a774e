//! Local filesystem source.
//!
//! Project patterns are globs relative to `[sources.local] root`, for example
//! `invoices/**/*.pdf`. Absolute patterns are matched as-is. URIs of listed
//! files are relative to the root, with `/` separators, unless the pattern
//! was absolute.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{GlobBuilder, GlobMatcher};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use walkdir::WalkDir;

use mrkr_core::error::SourceError;
use mrkr_core::models::{ProviderKind, SourceFile};

use crate::config::LocalSourceConfig;
use crate::raster::{PageImage, Rasterizer};
use crate::source::{rasterize_uri, SourceProvider};

pub struct LocalProvider {
    config: LocalSourceConfig,
    raster: Rasterizer,
}

impl LocalProvider {
    pub fn new(config: LocalSourceConfig, raster: Rasterizer) -> Self {
        Self { config, raster }
    }

    fn resolve(&self, uri: &str) -> PathBuf {
        let path = Path::new(uri);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.root.join(path)
        }
    }
}

/// The leading path segments of `pattern` that contain no glob syntax.
pub(crate) fn literal_prefix(pattern: &str) -> &str {
    let end = pattern
        .find(|c| matches!(c, '*' | '?' | '[' | '{'))
        .unwrap_or(pattern.len());
    match pattern[..end].rfind('/') {
        Some(slash) => &pattern[..=slash],
        None if end == pattern.len() => pattern,
        None => "",
    }
}

pub(crate) fn build_matcher(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .with_context(|| format!("invalid glob pattern: {}", pattern))?;
    Ok(glob.compile_matcher())
}

fn file_checksum(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn to_uri(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
        .replacen("//", "/", 1)
}

#[async_trait]
impl SourceProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    #[instrument(level = "debug", skip(self))]
    async fn list_files(&self, pattern: &str) -> Result<Vec<SourceFile>> {
        let root = &self.config.root;
        if !root.exists() {
            bail!("Local source root does not exist: {}", root.display());
        }

        let absolute = Path::new(pattern).is_absolute();
        let matcher = build_matcher(pattern)?;
        let walk_from = self.resolve(literal_prefix(pattern));
        if !walk_from.exists() {
            debug!(path = %walk_from.display(), "Pattern base does not exist");
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&walk_from).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let uri = if absolute {
                to_uri(path)
            } else {
                to_uri(path.strip_prefix(root).unwrap_or(path))
            };
            if !matcher.is_match(&uri) {
                continue;
            }

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            files.push(SourceFile {
                name,
                etag: file_checksum(path)
                    .with_context(|| format!("cannot checksum {}", path.display()))?,
                uri,
            });
        }

        // Sort for deterministic ordering
        files.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(files)
    }

    async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.resolve(uri);
        if !path.is_file() {
            return Err(SourceError::NotFound {
                uri: uri.to_string(),
            }
            .into());
        }
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))
    }

    async fn checksum(&self, uri: &str) -> Result<String> {
        let path = self.resolve(uri);
        if !path.is_file() {
            return Err(SourceError::NotFound {
                uri: uri.to_string(),
            }
            .into());
        }
        file_checksum(&path).with_context(|| format!("cannot checksum {}", path.display()))
    }

    async fn to_images(&self, uri: &str) -> Result<Vec<PageImage>> {
        rasterize_uri(self, &self.raster, uri).await
    }
}
