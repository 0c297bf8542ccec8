//! Release metadata lookup and platform asset selection

use crate::error::ProvisionError;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// User agent sent on every request; GitHub rejects requests without one
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Latest release as published by the metadata endpoint
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Release {
    /// Tag such as `v0.53.0`
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

impl Release {
    /// Tag without its leading `v`
    pub fn version(&self) -> &str {
        self.tag_name.strip_prefix('v').unwrap_or(&self.tag_name)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ReleaseAsset {
    pub name: String,
    #[serde(rename = "browser_download_url")]
    pub download_url: String,
}

/// Operating system and architecture in the release naming convention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatform {
    pub os: String,
    pub arch: String,
}

impl HostPlatform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// The platform this binary was compiled for
    pub fn current() -> Self {
        Self::from_rust_target(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Translate Rust target names into the names used by frp release assets
    pub fn from_rust_target(os: &str, arch: &str) -> Self {
        let os = match os {
            "macos" => "darwin",
            other => other,
        };
        let arch = match arch {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "loongarch64" => "loong64",
            other => other,
        };
        Self::new(os, arch)
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }
}

/// Expected asset name: `frp_{version}_{os}_{arch}.{zip|tar.gz}`
pub fn asset_name(tag: &str, platform: &HostPlatform) -> String {
    let version = tag.strip_prefix('v').unwrap_or(tag);
    let ext = if platform.is_windows() { "zip" } else { "tar.gz" };
    format!("frp_{}_{}_{}.{}", version, platform.os, platform.arch, ext)
}

/// Pick the asset whose name is exactly the expected name for `platform`
pub fn select_platform_asset<'a>(
    release: &'a Release,
    platform: &HostPlatform,
) -> Result<&'a ReleaseAsset, ProvisionError> {
    let expected = asset_name(&release.tag_name, platform);
    release
        .assets
        .iter()
        .find(|asset| asset.name == expected)
        .ok_or_else(|| ProvisionError::AssetNotFound {
            os: platform.os.clone(),
            arch: platform.arch.clone(),
            expected,
        })
}

/// Fetches release descriptors from a fixed metadata endpoint
#[derive(Debug, Clone)]
pub struct ReleaseResolver {
    client: reqwest::Client,
    endpoint: String,
}

impl ReleaseResolver {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ProvisionError> {
        let endpoint = endpoint.into();
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|source| ProvisionError::Transport {
                url: endpoint.clone(),
                source,
            })?;
        Ok(Self { client, endpoint })
    }

    /// Single unauthenticated GET of the metadata endpoint
    pub async fn fetch_latest_release(&self) -> Result<Release, ProvisionError> {
        debug!(endpoint = %self.endpoint, "Fetching latest release");

        let transport = |source| ProvisionError::Transport {
            url: self.endpoint.clone(),
            source,
        };
        let response = self
            .client
            .get(&self.endpoint)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(ProvisionError::HttpStatus {
                url: self.endpoint.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        let release: Release = serde_json::from_slice(&body).map_err(ProvisionError::Decode)?;

        debug!(tag = %release.tag_name, assets = release.assets.len(), "Latest release resolved");
        Ok(release)
    }
}
