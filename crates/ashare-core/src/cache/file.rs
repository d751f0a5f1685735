use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::{CacheBackend, CacheError};
use crate::data_source::BoxFuture;

const EXTENSION: &str = "json";

/// One JSON document per key inside a directory.
///
/// Keys are percent-encoded into file names; writes go through a temporary
/// file and a rename so readers never see a half-written document.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{EXTENSION}", urlencoding::encode(key)))
    }
}

fn key_from_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(&format!(".{EXTENSION}"))?;
    urlencoding::decode(stem).ok().map(|key| key.into_owned())
}

impl CacheBackend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, CacheError>> {
        Box::pin(async move {
            match tokio::fs::read_to_string(self.path_for(key)).await {
                Ok(value) => Ok(Some(value)),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
                Err(error) => Err(error.into()),
            }
        })
    }

    fn store<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            let path = self.path_for(key);
            let staging = path.with_extension(format!("{EXTENSION}.tmp"));
            tokio::fs::write(&staging, value).await?;
            tokio::fs::rename(&staging, &path).await?;
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<bool, CacheError>> {
        Box::pin(async move {
            match tokio::fs::remove_file(self.path_for(key)).await {
                Ok(()) => Ok(true),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
                Err(error) => Err(error.into()),
            }
        })
    }

    fn keys<'a>(&'a self) -> BoxFuture<'a, Result<Vec<String>, CacheError>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let mut entries = tokio::fs::read_dir(&self.dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(key) = entry.file_name().to_str().and_then(key_from_file_name) {
                    keys.push(key);
                }
            }
            keys.sort();
            Ok(keys)
        })
    }

    fn clear<'a>(&'a self) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            for key in self.keys().await? {
                self.remove(&key).await?;
            }
            Ok(())
        })
    }
}
