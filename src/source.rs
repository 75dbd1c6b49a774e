//! Content source adapters.
//!
//! A [`SourceProvider`] lists the files behind a project's URI pattern and
//! serves their bytes. Projects name their provider by [`ProviderKind`];
//! [`Sources`] maps each kind to the configured adapter.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use mrkr_core::checksum::content_checksum;
use mrkr_core::models::{ProviderKind, SourceFile};

use crate::config::Config;
use crate::raster::{PageImage, Rasterizer};
use crate::source_fs::LocalProvider;
use crate::source_s3::S3Provider;

/// A place source files come from.
///
/// `read` fails with [`mrkr_core::error::SourceError::NotFound`] when the URI
/// no longer resolves.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Files matching `pattern`, sorted by URI.
    async fn list_files(&self, pattern: &str) -> Result<Vec<SourceFile>>;

    async fn read(&self, uri: &str) -> Result<Vec<u8>>;

    /// SHA-256 of the full content; the OCR cache key.
    async fn checksum(&self, uri: &str) -> Result<String> {
        let bytes = self.read(uri).await?;
        Ok(content_checksum(&bytes))
    }

    /// One image per page.
    async fn to_images(&self, uri: &str) -> Result<Vec<PageImage>>;
}

/// Helper shared by the adapters: read, then rasterize by extension.
pub(crate) async fn rasterize_uri<P>(
    provider: &P,
    raster: &Rasterizer,
    uri: &str,
) -> Result<Vec<PageImage>>
where
    P: SourceProvider + ?Sized,
{
    let bytes = provider.read(uri).await?;
    raster.rasterize(uri, bytes).await
}

/// The configured adapters, by kind.
#[derive(Clone, Default)]
pub struct Sources {
    providers: HashMap<ProviderKind, Arc<dyn SourceProvider>>,
}

impl Sources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every adapter that has a `[sources.*]` section.
    pub fn from_config(config: &Config) -> Self {
        let raster = Rasterizer::from_config(&config.ocr);
        let mut sources = Self::new();
        if let Some(local) = &config.sources.local {
            sources = sources.with(Arc::new(LocalProvider::new(local.clone(), raster.clone())));
        }
        if let Some(s3) = &config.sources.s3 {
            sources = sources.with(Arc::new(S3Provider::new(s3.clone(), raster)));
        }
        sources
    }

    /// Register `provider` under its own kind, replacing any previous one.
    pub fn with(mut self, provider: Arc<dyn SourceProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn SourceProvider>> {
        self.providers.get(&kind).cloned().ok_or_else(|| {
            anyhow!(
                "source provider '{}' is not configured (add a [sources.{}] section)",
                kind,
                kind
            )
        })
    }
}
