//! Handing a reconstructed key to the storage layer.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::error::{TrustError, TrustResult};

/// Something that can be unlocked with a disk key.
#[async_trait]
pub trait StorageUnlocker: Send + Sync {
    /// Human-readable target, for logs.
    fn describe(&self) -> String;

    async fn unlock(&self, key: &[u8]) -> TrustResult<()>;
}

/// A LUKS volume opened with `cryptsetup`. The key is passed on stdin.
#[derive(Debug, Clone)]
pub struct CryptsetupVolume {
    pub device: String,
    pub mapper_name: String,
    pub cryptsetup_path: String,
}

impl CryptsetupVolume {
    pub fn new(device: impl Into<String>, mapper_name: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            mapper_name: mapper_name.into(),
            cryptsetup_path: "cryptsetup".to_string(),
        }
    }
}

#[async_trait]
impl StorageUnlocker for CryptsetupVolume {
    fn describe(&self) -> String {
        format!("{} as /dev/mapper/{}", self.device, self.mapper_name)
    }

    async fn unlock(&self, key: &[u8]) -> TrustResult<()> {
        let mut child = Command::new(&self.cryptsetup_path)
            .arg("open")
            .arg(&self.device)
            .arg(&self.mapper_name)
            .arg("--key-file=-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TrustError::Storage(format!("failed to run cryptsetup: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TrustError::Storage("cryptsetup stdin unavailable".to_string()))?;
        stdin
            .write_all(key)
            .await
            .map_err(|e| TrustError::Storage(format!("failed to pass key: {}", e)))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| TrustError::Storage(format!("cryptsetup did not finish: {}", e)))?;
        if !output.status.success() {
            return Err(TrustError::Storage(format!(
                "cryptsetup exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(device = %self.device, mapper = %self.mapper_name, "Unlocked volume");
        Ok(())
    }
}
