use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use url::Url;

/// Files of a fetched package, keyed by path relative to the package root
#[derive(Debug, Clone, Default)]
pub struct FetchedPackage {
    pub version: String,
    pub files: HashMap<String, String>,
}

/// On-demand dependency source, used when a request hits a dependency the
/// virtual FS does not have yet
#[async_trait]
pub trait DependencyFetcher: Send + Sync {
    async fn fetch_package(&self, name: &str, version: &str) -> Result<FetchedPackage>;
}

/// Minimal package.json shape read off the CDN
#[derive(Debug, Deserialize)]
struct CdnPackageJson {
    version: Option<String>,
    main: Option<String>,
    module: Option<String>,
}

/// Fetches flat module files from a CDN-style registry endpoint
/// (`{base}/{name}@{version}/{file}`)
pub struct CdnFetcher {
    client: reqwest::Client,
    base_url: Url,

    /// Fetch dedup cache, keyed by `name@version`
    cache: DashMap<String, FetchedPackage>,
}

impl CdnFetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        // A trailing slash keeps Url::join from replacing the last path
        // segment
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: Url::parse(&base)?,
            cache: DashMap::new(),
        })
    }

    fn file_url(&self, name: &str, version: &str, file: &str) -> Result<Url> {
        Ok(self
            .base_url
            .join(&format!("{}@{}/{}", name, version, file))?)
    }

    async fn fetch_file(&self, name: &str, version: &str, file: &str) -> Result<String> {
        let url = self.file_url(name, version, file)?;
        tracing::debug!("Fetching dependency file: {}", url);

        let response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("Registry returned {} for {}", response.status(), url);
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl DependencyFetcher for CdnFetcher {
    async fn fetch_package(&self, name: &str, version: &str) -> Result<FetchedPackage> {
        let cache_key = format!("{}@{}", name, version);
        if let Some(cached) = self.cache.get(&cache_key) {
            tracing::debug!("Using cached package: {}", cache_key);
            return Ok(cached.clone());
        }

        let manifest_text = self.fetch_file(name, version, "package.json").await?;
        let manifest: CdnPackageJson = serde_json::from_str(&manifest_text)?;

        // Ranges are resolved by the CDN; pin the reported version so the
        // dedup key is exact on the next lookup.
        let resolved = match &manifest.version {
            Some(reported) if semver::Version::parse(version).is_err() => reported.clone(),
            _ => version.to_string(),
        };

        let mut files = HashMap::new();
        files.insert("package.json".to_string(), manifest_text);

        let entry = manifest
            .module
            .or(manifest.main)
            .unwrap_or_else(|| "index.js".to_string());
        let entry = entry.trim_start_matches("./").to_string();

        let entry_code = self.fetch_file(name, &resolved, &entry).await?;
        files.insert(entry, entry_code);

        let package = FetchedPackage {
            version: resolved,
            files,
        };
        self.cache.insert(cache_key, package.clone());

        tracing::info!("Fetched {}@{} ({} files)", name, package.version, package.files.len());
        Ok(package)
    }
}
