//! Public key of the data-copy job in the host's `authorized_keys`

use crate::error::Result;
use crate::utils::touch_file;
use std::path::Path;
use tracing::info;

/// Create the key file when missing
pub fn ensure_authorized_keys(path: &Path) -> Result<()> {
    touch_file(path)
}

/// Append `key` unless an identical line is already present
pub async fn add_public_key(path: &Path, key: &str) -> Result<bool> {
    let key = key.trim();
    let content = read_or_empty(path).await?;
    if key.is_empty() || content.lines().any(|l| l.trim() == key) {
        return Ok(false);
    }

    let mut updated = content;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(key);
    updated.push('\n');
    tokio::fs::write(path, updated).await?;
    info!(file = %path.display(), "Added data-copy public key");
    Ok(true)
}

/// Drop every line equal to `key`
pub async fn remove_public_key(path: &Path, key: &str) -> Result<bool> {
    let key = key.trim();
    let content = read_or_empty(path).await?;
    let kept: Vec<&str> = content.lines().filter(|l| l.trim() != key).collect();
    if kept.len() == content.lines().count() {
        return Ok(false);
    }

    let mut updated = kept.join("\n");
    if !updated.is_empty() {
        updated.push('\n');
    }
    tokio::fs::write(path, updated).await?;
    info!(file = %path.display(), "Removed data-copy public key");
    Ok(true)
}

async fn read_or_empty(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY: &str = "ssh-rsa AAAAB3NzaC1yc2E datacopy@hwameistor";

    #[tokio::test]
    async fn test_add_and_remove_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".ssh/authorized_keys");
        ensure_authorized_keys(&path).unwrap();
        assert!(path.exists());
        std::fs::write(&path, "ssh-ed25519 AAAAC3 admin@host").unwrap();

        assert!(add_public_key(&path, &format!("{}\n", KEY)).await.unwrap());
        assert!(!add_public_key(&path, KEY).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            format!("ssh-ed25519 AAAAC3 admin@host\n{}\n", KEY)
        );

        assert!(remove_public_key(&path, KEY).await.unwrap());
        assert!(!remove_public_key(&path, KEY).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "ssh-ed25519 AAAAC3 admin@host\n"
        );
    }

    #[tokio::test]
    async fn test_empty_key_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("authorized_keys");
        assert!(!add_public_key(&path, "  ").await.unwrap());
        assert!(!path.exists());
    }
}
