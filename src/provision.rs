//! Installs and updates the frpc binary.
//!
//! The file at [`DataLayout::binary_path`] is the only installation state: its
//! existence means "installed" and its `--version` output is the version.
//! Install operations are serialised by an internal mutex so concurrent
//! callers cannot interleave writes to the scratch or install paths.

use crate::archive::extract_binary;
use crate::config::{frpc_binary_name, DataLayout, ReleaseConfig};
use crate::error::ProvisionError;
use crate::release::{select_platform_asset, HostPlatform, Release, ReleaseResolver, USER_AGENT};
use reqwest::StatusCode;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// How long `frpc --version` may take before it is considered broken
const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Provisioner {
    layout: DataLayout,
    resolver: ReleaseResolver,
    download_client: reqwest::Client,
    platform: HostPlatform,
    install_lock: Mutex<()>,
}

impl Provisioner {
    pub fn new(layout: DataLayout, release: &ReleaseConfig) -> Result<Self, ProvisionError> {
        let resolver = ReleaseResolver::new(&release.endpoint, release.metadata_timeout())?;
        let download_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(release.download_timeout())
            .build()
            .map_err(|source| ProvisionError::Transport {
                url: release.endpoint.clone(),
                source,
            })?;

        Ok(Self {
            layout,
            resolver,
            download_client,
            platform: HostPlatform::current(),
            install_lock: Mutex::new(()),
        })
    }

    /// Override the platform used to pick release assets (builder pattern)
    pub fn with_platform(mut self, platform: HostPlatform) -> Self {
        self.platform = platform;
        self
    }

    pub fn binary_path(&self) -> PathBuf {
        self.layout.binary_path()
    }

    /// Whether the binary file exists; says nothing about whether it runs
    pub fn is_installed(&self) -> bool {
        self.binary_path().exists()
    }

    /// Run the installed binary with `--version` and return its trimmed output
    pub async fn current_version(&self) -> Result<String, ProvisionError> {
        let path = self.binary_path();
        if !path.exists() {
            return Err(ProvisionError::NotInstalled);
        }

        let mut cmd = Command::new(&path);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(VERSION_QUERY_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ProvisionError::VersionQuery(e.to_string())),
            Err(_) => {
                return Err(ProvisionError::VersionQuery(format!(
                    "no answer within {}s",
                    VERSION_QUERY_TIMEOUT.as_secs()
                )))
            }
        };

        if !output.status.success() {
            return Err(ProvisionError::VersionQuery(format!(
                "{} --version exited with {}",
                path.display(),
                output.status
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Latest release descriptor from the metadata endpoint
    pub async fn fetch_latest_release(&self) -> Result<Release, ProvisionError> {
        self.resolver.fetch_latest_release().await
    }

    /// Tag of the latest published release, e.g. `v0.53.0`
    pub async fn latest_version(&self) -> Result<String, ProvisionError> {
        Ok(self.fetch_latest_release().await?.tag_name)
    }

    /// Download the latest release for this host and install its frpc binary.
    /// Returns the version reported by the freshly installed binary.
    pub async fn install_from_network(&self) -> Result<String, ProvisionError> {
        let _guard = self.install_lock.lock().await;

        let release = self.resolver.fetch_latest_release().await?;
        let asset = select_platform_asset(&release, &self.platform)?;
        info!(
            tag = %release.tag_name,
            asset = %asset.name,
            url = %asset.download_url,
            "Downloading frpc"
        );

        let scratch = self.layout.download_scratch_path(&asset.name);
        let result = match self.download(&asset.download_url, &scratch).await {
            Ok(()) => self.extract(&scratch).await,
            Err(e) => Err(e),
        };
        remove_scratch(&scratch).await;
        result?;

        let version = self.current_version().await?;
        info!(%version, "frpc installed successfully");
        Ok(version)
    }

    /// Install from an archive supplied by the caller. The format is detected
    /// from the content, not from any file name.
    pub async fn install_from_blob<R>(&self, mut reader: R) -> Result<String, ProvisionError>
    where
        R: AsyncRead + Unpin,
    {
        let _guard = self.install_lock.lock().await;

        let scratch = self.layout.upload_scratch_path();
        let result = match write_scratch(&mut reader, &scratch).await {
            Ok(bytes) => {
                debug!(bytes, path = %scratch.display(), "Archive received");
                self.extract(&scratch).await
            }
            Err(e) => Err(e),
        };
        remove_scratch(&scratch).await;
        result?;

        let version = self.current_version().await?;
        info!(%version, "frpc installed from upload");
        Ok(version)
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), ProvisionError> {
        let transport = |source| ProvisionError::Transport {
            url: url.to_string(),
            source,
        };

        let mut response = self.download_client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ProvisionError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        ensure_parent(dest).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(bytes = written, path = %dest.display(), "Download complete");
        Ok(())
    }

    async fn extract(&self, archive: &Path) -> Result<(), ProvisionError> {
        let archive = archive.to_path_buf();
        let install = self.binary_path();

        tokio::task::spawn_blocking(move || extract_binary(&archive, frpc_binary_name(), &install))
            .await
            .map_err(|e| ProvisionError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(())
    }
}

async fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => tokio::fs::create_dir_all(dir).await,
        _ => Ok(()),
    }
}

async fn write_scratch<R>(reader: &mut R, dest: &Path) -> Result<u64, ProvisionError>
where
    R: AsyncRead + Unpin,
{
    ensure_parent(dest).await?;
    let mut file = tokio::fs::File::create(dest).await?;
    let bytes = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    Ok(bytes)
}

/// Cleanup never changes the outcome of the install
async fn remove_scratch(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
    }
}
