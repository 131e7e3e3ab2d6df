//! Certificate cache in a local directory
//!
//! One file per name. Writes go to a temporary file that is renamed into
//! place, so readers never see a partial bundle. Like [`ObjectCache`],
//! file operations outlive a cancelled caller and are capped in number.
//!
//! [`ObjectCache`]: super::ObjectCache

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{detach_bounded, CacheError, CertCache, Context, DEFAULT_MAX_IN_FLIGHT};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// [`CertCache`] storing each entry as a file under a directory
#[derive(Debug, Clone)]
pub struct DirCache {
    dir: PathBuf,
    in_flight: Arc<Semaphore>,
}

impl DirCache {
    /// The directory is created on first store
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            in_flight: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
        }
    }

    /// Limit the number of file operations that may run at once
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.in_flight = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> Result<PathBuf, CacheError> {
        let invalid = name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\'])
            || name.contains('\0');
        if invalid {
            return Err(CacheError::InvalidKey(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl CertCache for DirCache {
    async fn fetch(&self, ctx: &Context, name: &str) -> Result<Vec<u8>, CacheError> {
        let path = self.path(name)?;

        detach_bounded(ctx, &self.in_flight, async move {
            match tokio::fs::read(&path).await {
                Ok(data) => Ok(data),
                Err(err) if err.kind() == ErrorKind::NotFound => Err(CacheError::Miss),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn store(&self, ctx: &Context, name: &str, data: &[u8]) -> Result<(), CacheError> {
        let path = self.path(name)?;
        let dir = self.dir.clone();
        let data = data.to_vec();

        detach_bounded(ctx, &self.in_flight, async move {
            tokio::fs::create_dir_all(&dir).await?;

            let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
            let mut tmp = path.clone().into_os_string();
            tmp.push(format!(".tmp-{}-{}", std::process::id(), n));
            let tmp = PathBuf::from(tmp);
            if let Err(err) = tokio::fs::write(&tmp, &data).await {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(err.into());
            }
            tokio::fs::rename(&tmp, &path).await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, ctx: &Context, name: &str) -> Result<(), CacheError> {
        let path = self.path(name)?;

        detach_bounded(ctx, &self.in_flight, async move {
            match tokio::fs::remove_file(&path).await {
                Err(err) if err.kind() != ErrorKind::NotFound => Err(err.into()),
                _ => Ok(()),
            }
        })
        .await
    }
}
