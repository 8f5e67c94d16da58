//! Fetching granted files into the destination directory.

use crate::error::{FerryError, Result};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch `uri` into `destination`, returning the local path.
    async fn fetch(&self, uri: &str, destination: &Path, login: Option<&str>) -> Result<PathBuf>;
}

/// Copies files reachable through the local filesystem (`file://` URLs or
/// plain paths, e.g. on a shared mount).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFetcher;

/// Resolve a `file://` URL or plain absolute path to a local path.
fn local_source(uri: &str) -> Result<PathBuf> {
    let path = match uri.strip_prefix("file://") {
        Some(rest) => rest,
        None if uri.contains("://") => return Err(FerryError::UnsupportedUri(uri.to_string())),
        None => uri,
    };
    if path.is_empty() {
        return Err(FerryError::UnsupportedUri(uri.to_string()));
    }
    Ok(PathBuf::from(path))
}

/// The file name the fetched copy will get. Must be a single normal component.
fn target_name(source: &Path, uri: &str) -> Result<PathBuf> {
    match source.components().next_back() {
        Some(Component::Normal(name)) => Ok(PathBuf::from(name)),
        _ => Err(FerryError::UnsupportedUri(uri.to_string())),
    }
}

#[async_trait]
impl Fetcher for LocalFetcher {
    async fn fetch(&self, uri: &str, destination: &Path, login: Option<&str>) -> Result<PathBuf> {
        let source = local_source(uri)?;
        let target = destination.join(target_name(&source, uri)?);
        if login.is_some() {
            debug!(%uri, "Ignoring login for local copy");
        }

        tokio::fs::create_dir_all(destination).await?;

        // Copy into a temp file next to the target and rename, so readers
        // never see a partially written file.
        let temp = tempfile::Builder::new()
            .prefix(".ferry-")
            .suffix(".part")
            .tempfile_in(destination)?
            .into_temp_path();
        tokio::fs::copy(&source, &temp).await?;
        temp.persist(&target).map_err(|e| FerryError::Io(e.error))?;

        debug!(source = %source.display(), target = %target.display(), "Copied file");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_local_source() {
        assert_eq!(local_source("file:///data/f1").unwrap(), PathBuf::from("/data/f1"));
        assert_eq!(local_source("/data/f1").unwrap(), PathBuf::from("/data/f1"));
        assert!(matches!(
            local_source("ftp://host/data/f1"),
            Err(FerryError::UnsupportedUri(_))
        ));
        assert!(local_source("file://").is_err());
    }

    #[test]
    fn test_target_name_rejects_parent() {
        assert!(target_name(Path::new("/data/.."), "/data/..").is_err());
        assert_eq!(
            target_name(Path::new("/data/f1.bin"), "/data/f1.bin").unwrap(),
            PathBuf::from("f1.bin")
        );
    }

    #[tokio::test]
    async fn test_fetch_copies_into_destination() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("outgoing");
        let dest = tmp.path().join("incoming");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("scene.h5"), "payload").unwrap();

        let uri = format!("file://{}", source.join("scene.h5").display());
        let local = LocalFetcher.fetch(&uri, &dest, Some("user")).await.unwrap();

        assert_eq!(local, dest.join("scene.h5"));
        assert_eq!(fs::read_to_string(&local).unwrap(), "payload");

        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(&dest)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_missing_source_fails_cleanly() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("incoming");

        let result = LocalFetcher
            .fetch("/nonexistent/ferry/file", &dest, None)
            .await;
        assert!(matches!(result, Err(FerryError::Io(_))));
        assert_eq!(fs::read_dir(&dest).unwrap().count(), 0);
    }
}
