//! Published agent executables.
//!
//! Binaries are named `{prefix}-{os}-{arch}` (`.exe` on windows) and a
//! `version.txt` sidecar holds the published version. Directories are
//! searched in order and the first hit wins, so a container image can ship
//! binaries in one place while local development falls back to another.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

const VERSION_FILE: &str = "version.txt";

/// A downloadable agent build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub filename: String,
}

/// Bytes of one agent binary.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub filename: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dirs: Vec<PathBuf>,
    prefix: String,
}

impl ArtifactStore {
    pub fn new(dirs: Vec<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dirs,
            prefix: prefix.into(),
        }
    }

    /// Published version, or an empty string when nothing is published.
    pub async fn latest_version(&self) -> String {
        for dir in &self.dirs {
            if let Ok(content) = tokio::fs::read_to_string(dir.join(VERSION_FILE)).await {
                return content.trim().to_string();
            }
        }
        String::new()
    }

    /// Platforms present in the first readable directory.
    pub async fn available_platforms(&self) -> Vec<Platform> {
        for dir in &self.dirs {
            let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
                continue;
            };

            let mut platforms = Vec::new();
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if let Some(platform) = self.parse_filename(&name) {
                            platforms.push(platform);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(dir = %dir.display(), "Failed to list artifacts: {}", e);
                        break;
                    }
                }
            }
            platforms.sort_by(|a, b| a.filename.cmp(&b.filename));
            return platforms;
        }
        Vec::new()
    }

    /// Read the binary for one platform.
    pub async fn binary(&self, os: &str, arch: &str) -> Result<Artifact> {
        if !is_component(os) || !is_component(arch) {
            return Err(DispatchError::Validation(format!(
                "invalid platform {}/{}",
                os, arch
            )));
        }

        let filename = self.filename_for(os, arch);
        for dir in &self.dirs {
            match tokio::fs::read(dir.join(&filename)).await {
                Ok(data) => return Ok(Artifact { filename, data }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DispatchError::NotFound(format!(
            "Agent binary for {}/{}",
            os, arch
        )))
    }

    fn filename_for(&self, os: &str, arch: &str) -> String {
        let mut name = format!("{}-{}-{}", self.prefix, os, arch);
        if os == "windows" {
            name.push_str(".exe");
        }
        name
    }

    fn parse_filename(&self, name: &str) -> Option<Platform> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('-')?;
        let rest = rest.strip_suffix(".exe").unwrap_or(rest);
        let mut parts = rest.split('-');
        let os = parts.next().filter(|s| !s.is_empty())?;
        let arch = parts.next().filter(|s| !s.is_empty())?;
        Some(Platform {
            os: os.to_string(),
            arch: arch.to_string(),
            filename: name.to_string(),
        })
    }
}

/// Platform names end up in a file path; keep them to a safe alphabet.
fn is_component(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
