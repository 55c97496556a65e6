use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use crate::{downloader::error::*, FluxSourceArtefact};
use flate2::read::GzDecoder;
use reqwest_middleware::ClientWithMiddleware;
use sha2::{Digest, Sha256};
use snafu::{ensure, ResultExt};
use tar::Archive;
use tempfile::TempDir;
use tracing::{debug, info};
use url::Url;

pub mod error;

type Result<T, E = FetcherError> = std::result::Result<T, E>;

/// An unpacked source artifact in a scratch directory.
///
/// The backing directory is removed when the guard is dropped, on every exit
/// path including panics at the worker boundary.
pub struct ArtifactRoot {
    scratch: TempDir,
}

impl ArtifactRoot {
    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    /// Resolves a relative sub-path ("./app/overlays") inside the artifact.
    pub fn join(&self, sub_path: &str) -> PathBuf {
        self.scratch
            .path()
            .join(sub_path.trim_start_matches("./").trim_start_matches('/'))
    }
}

/// Fetches source artifacts over HTTPS and unpacks them into per-call
/// scratch directories.
pub struct ArtifactFetcher {
    client: ClientWithMiddleware,
    host: Option<String>,
    scratch_root: Option<PathBuf>,
}

impl ArtifactFetcher {
    /// `host` rewrites artifact URLs to a different endpoint, used when the
    /// source service is reached through a port-forward or proxy.
    pub fn new(
        client: ClientWithMiddleware,
        host: Option<String>,
        scratch_root: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            host,
            scratch_root,
        }
    }

    /// Downloads the artifact, verifies its digest byte-exactly and unpacks
    /// the tarball into a fresh scratch directory.
    ///
    /// # Errors:
    /// Returns a FetcherError in the following cases:
    /// - If the artifact cannot be downloaded or does not exist
    /// - If the digest advertised by the source does not match the bytes
    /// - If the tar.gz archive cannot be unpacked
    /// - If the URL is invalid
    pub async fn fetch(&self, artefact: &FluxSourceArtefact) -> Result<ArtifactRoot> {
        let url = build_url(&artefact.url(), self.host.clone())?;

        info!("Downloading artifact from {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .context(CannotDownloadSnafu)?
            .error_for_status()
            .context(ArtifactNotFoundSnafu {
                url: url.to_string(),
            })?;

        let body = response.bytes().await.context(CannotGetBodySnafu)?;

        // The digest must match before anything is unpacked.
        if let Some(expected) = artefact.digest() {
            let actual = hex_digest(&body);
            ensure!(
                digest_value(&expected) == actual,
                ChecksumMismatchSnafu {
                    url: url.to_string(),
                    expected,
                    actual,
                }
            );
            debug!("Verified artifact digest sha256:{}", actual);
        }

        let scratch = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root).context(CannotCreateScratchDirSnafu)?;
                TempDir::new_in(root)
            }
            None => TempDir::new(),
        }
        .context(CannotCreateScratchDirSnafu)?;

        info!("Extracting artifact to {}", scratch.path().display());
        let mut archive = Archive::new(GzDecoder::new(Cursor::new(body)));
        archive.unpack(scratch.path()).context(CannotUnpackSnafu)?;

        Ok(ArtifactRoot { scratch })
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Strips the `<algo>:` prefix of a digest, if present.
fn digest_value(digest: &str) -> &str {
    digest.rsplit(':').next().unwrap_or(digest)
}

pub(crate) fn build_url(url: &str, override_host: Option<String>) -> Result<Url> {
    let parsed_url = url::Url::parse(url).context(InvalidParseUrlSnafu)?;
    if let Some(host) = override_host {
        debug!("Rewriting artifact url {} onto host {}", url, host);
        let mut override_parsed = url::Url::parse(host.as_str()).context(InvalidParseUrlSnafu)?;
        override_parsed.set_path(parsed_url.path());
        override_parsed.set_query(parsed_url.query());
        Ok(override_parsed)
    } else {
        Ok(parsed_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_no_override() -> Result<()> {
        let url = "http://example.com/path";
        let result = build_url(url, None)?;
        assert_eq!(result.to_string(), url);
        Ok(())
    }

    #[test]
    fn test_build_url_with_override() -> Result<()> {
        let url = "http://source-controller.flux-system.svc.cluster.local./gitrepository/flux-system/podinfo/6b7aab8a10d6ee8b895b0a5048f4ab0966ed29ff.tar.gz";
        let override_host = Some("http://127.0.0.1:8080".to_string());
        let result = build_url(url, override_host)?;
        assert_eq!(result.to_string(), "http://127.0.0.1:8080/gitrepository/flux-system/podinfo/6b7aab8a10d6ee8b895b0a5048f4ab0966ed29ff.tar.gz");
        Ok(())
    }

    #[test]
    fn test_build_url_invalid_url() {
        let url = "not a url";
        let result = build_url(url, None);
        assert!(result.is_err());
    }

    #[test]
    fn test_build_url_invalid_override() {
        let url = "http://example.com/path";
        let override_host = Some("not a url".to_string());
        let result = build_url(url, override_host);
        assert!(result.is_err());
    }

    #[test]
    fn digest_prefix_is_stripped() {
        assert_eq!(digest_value("sha256:abc123"), "abc123");
        assert_eq!(digest_value("abc123"), "abc123");
    }

    #[test]
    fn digest_of_known_bytes() {
        // sha256 of the empty string.
        assert_eq!(
            hex_digest(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let root = {
            let scratch = TempDir::new().unwrap();
            let root = ArtifactRoot { scratch };
            assert!(root.path().exists());
            root.path().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn sub_path_resolution() {
        let scratch = TempDir::new().unwrap();
        let base = scratch.path().to_path_buf();
        let root = ArtifactRoot { scratch };
        assert_eq!(root.join("./webapp/backend"), base.join("webapp/backend"));
        assert_eq!(root.join("./"), base);
    }
}
