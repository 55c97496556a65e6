use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::{debug, info};
use walkdir::WalkDir;

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("Failed to read {}: {}", path.display(), source))]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write plaintext to {}: {}", path.display(), source))]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to walk {}: {}", path.display(), source))]
    WalkTree {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Failed to spawn decrypter process: {}", source))]
    SpawnDecrypter { source: std::io::Error },

    #[snafu(display("Decryption of {} failed: {}", path.display(), stderr))]
    DecryptFailed { path: PathBuf, stderr: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Turns an encrypted envelope back into plaintext manifest bytes.
///
/// The trait is the seam to the SOPS-compatible decrypter; the controller
/// does not know anything about key formats beyond handing the candidate
/// private keys over.
#[async_trait]
pub trait Decrypter: Send + Sync {
    async fn decrypt(&self, path: &Path, keys: &[String]) -> Result<Vec<u8>>;
}

/// Production decrypter shelling out to the `sops` binary.
///
/// Keys are passed through the process environment so plaintext key material
/// never touches the filesystem.
pub struct SopsCli {
    binary: PathBuf,
}

impl Default for SopsCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("sops"),
        }
    }
}

impl SopsCli {
    pub fn new<P: Into<PathBuf>>(binary: P) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl Decrypter for SopsCli {
    async fn decrypt(&self, path: &Path, keys: &[String]) -> Result<Vec<u8>> {
        let output = tokio::process::Command::new(&self.binary)
            .arg("--decrypt")
            .arg(path)
            .env("SOPS_AGE_KEY", keys.join("\n"))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context(SpawnDecrypterSnafu)?;

        if !output.status.success() {
            return DecryptFailedSnafu {
                path: path.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .fail();
        }
        Ok(output.stdout)
    }
}

/// Walks `root` and decrypts every recognized envelope in place. Returns the
/// number of files rewritten. A single failing envelope fails the walk; an
/// envelope whose key is absent surfaces through the decrypter error.
pub async fn decrypt_tree(
    decrypter: &dyn Decrypter,
    root: &Path,
    keys: &[String],
) -> Result<usize> {
    let mut decrypted = 0;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.context(WalkTreeSnafu {
            path: root.to_path_buf(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if !matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml") | Some("json")
        ) {
            continue;
        }

        let raw = std::fs::read_to_string(&path).context(ReadFileSnafu { path: path.clone() })?;
        if !is_envelope(&raw) {
            continue;
        }

        debug!("Decrypting envelope {}", path.display());
        let plaintext = decrypter.decrypt(&path, keys).await?;
        std::fs::write(&path, plaintext).context(WriteFileSnafu { path: path.clone() })?;
        decrypted += 1;
    }
    if decrypted > 0 {
        info!("Decrypted {} envelopes under {}", decrypted, root.display());
    }
    Ok(decrypted)
}

/// An envelope carries the SOPS metadata block as a top-level `sops` key in
/// every document.
fn is_envelope(raw: &str) -> bool {
    use serde::Deserialize;
    for de in serde_yaml::Deserializer::from_str(raw) {
        let Ok(value) = serde_yaml::Value::deserialize(de) else {
            return false;
        };
        if value.is_null() {
            continue;
        }
        let has_metadata = value
            .as_mapping()
            .map(|m| m.contains_key(&serde_yaml::Value::from("sops")))
            .unwrap_or(false);
        if has_metadata {
            return true;
        }
    }
    false
}
