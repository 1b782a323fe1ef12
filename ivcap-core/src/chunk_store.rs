//! Server-side fragment persistence keyed by `(session, index)`.

use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info};

use crate::fragment::FragmentAck;

const FRAGMENTS_DIR: &str = "fragments";
const FRAGMENT_EXTENSION: &str = "part";

pub type ChunkStoreResult<T> = Result<T, ChunkStoreError>;

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("empty payload for fragment {index} of session {session_id}")]
    EmptyPayload { session_id: String, index: u64 },
    #[error("fragment {index} is {size} bytes, above the {limit} byte limit")]
    TooLarge { index: u64, size: usize, limit: usize },
    #[error("invalid session id {0:?}")]
    InvalidSession(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ChunkStoreError {
    /// Whether the sender should deliver the same fragment again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChunkStoreError::EmptyPayload { .. } | ChunkStoreError::Io { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFragment {
    pub index: u64,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    root: PathBuf,
    max_fragment_bytes: Option<usize>,
}

/// Session ids become directory names, so only a conservative alphabet is
/// accepted.
pub fn validate_session_id(session_id: &str) -> ChunkStoreResult<()> {
    let valid = !session_id.is_empty()
        && session_id.len() <= 128
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        && !session_id.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(ChunkStoreError::InvalidSession(session_id.to_string()))
    }
}

impl ChunkStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_fragment_bytes: None,
        }
    }

    pub fn with_max_fragment_bytes(mut self, limit: Option<usize>) -> Self {
        self.max_fragment_bytes = limit;
        self
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn fragments_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join(FRAGMENTS_DIR)
    }

    pub fn fragment_path(&self, session_id: &str, index: u64) -> PathBuf {
        self.fragments_dir(session_id)
            .join(format!("{index}.{FRAGMENT_EXTENSION}"))
    }

    /// Durably stores one fragment. Re-delivery of the same index replaces
    /// the earlier copy.
    pub async fn put(
        &self,
        session_id: &str,
        index: u64,
        payload: Bytes,
    ) -> ChunkStoreResult<FragmentAck> {
        let store = self.clone();
        let owned_id = session_id.to_string();
        tokio::task::spawn_blocking(move || store.put_blocking(&owned_id, index, &payload)).await?
    }

    /// Blocking form of [`ChunkStore::put`], for callers already off the
    /// async runtime.
    pub fn put_blocking(
        &self,
        session_id: &str,
        index: u64,
        payload: &Bytes,
    ) -> ChunkStoreResult<FragmentAck> {
        validate_session_id(session_id)?;
        if payload.is_empty() {
            return Err(ChunkStoreError::EmptyPayload {
                session_id: session_id.to_string(),
                index,
            });
        }
        if let Some(limit) = self.max_fragment_bytes {
            if payload.len() > limit {
                return Err(ChunkStoreError::TooLarge {
                    index,
                    size: payload.len(),
                    limit,
                });
            }
        }

        let dir = self.fragments_dir(session_id);
        let target = self.fragment_path(session_id, index);
        let bytes = payload.len() as u64;
        let replaced = write_atomically(&dir, &target, payload)?;
        debug!(session_id, index, bytes, replaced, "fragment stored");
        Ok(FragmentAck {
            session_id: session_id.to_string(),
            index,
            bytes,
            replaced,
        })
    }

    /// Stored fragments sorted by numeric index (so `10` follows `9`).
    pub async fn list(&self, session_id: &str) -> ChunkStoreResult<Vec<StoredFragment>> {
        validate_session_id(session_id)?;
        let dir = self.fragments_dir(session_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(ChunkStoreError::Io { path: dir, source }),
        };
        let mut fragments = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => return Err(ChunkStoreError::Io { path: dir, source }),
            };
            let path = entry.path();
            let Some(index) = parse_fragment_name(&path) else {
                continue;
            };
            let metadata = entry.metadata().await.map_err(|source| ChunkStoreError::Io {
                path: path.clone(),
                source,
            })?;
            fragments.push(StoredFragment {
                index,
                path,
                size: metadata.len(),
            });
        }
        fragments.sort_by_key(|fragment| fragment.index);
        Ok(fragments)
    }

    pub async fn remove_session(&self, session_id: &str) -> ChunkStoreResult<()> {
        validate_session_id(session_id)?;
        remove_dir(&self.session_dir(session_id)).await?;
        info!(session_id, "staging removed");
        Ok(())
    }
}

async fn remove_dir(dir: &Path) -> ChunkStoreResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ChunkStoreError::Io {
            path: dir.to_path_buf(),
            source,
        }),
    }
}

fn write_atomically(dir: &Path, target: &Path, payload: &[u8]) -> ChunkStoreResult<bool> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ChunkStoreError::Io { path, source }
    };
    std::fs::create_dir_all(dir).map_err(io(dir))?;
    let replaced = target.exists();
    let mut temp = NamedTempFile::new_in(dir).map_err(io(dir))?;
    temp.write_all(payload).map_err(io(temp.path()))?;
    temp.as_file().sync_all().map_err(io(target))?;
    temp.persist(target)
        .map_err(|err| ChunkStoreError::Io {
            path: target.to_path_buf(),
            source: err.error,
        })?;
    Ok(replaced)
}

/// Only the canonical `<index>.part` spelling counts, so `007.part` never
/// aliases fragment 7.
fn parse_fragment_name(path: &Path) -> Option<u64> {
    if path.extension()? != FRAGMENT_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let index: u64 = stem.parse().ok()?;
    (stem == index.to_string()).then_some(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn redelivery_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let first = store.put("s1", 0, Bytes::from_static(b"one")).await.unwrap();
        assert!(!first.replaced);
        let second = store.put("s1", 0, Bytes::from_static(b"uno")).await.unwrap();
        assert!(second.replaced);

        let listed = store.list("s1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(std::fs::read(&listed[0].path).unwrap(), b"uno");
    }

    #[tokio::test]
    async fn empty_payload_is_retryable() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        let err = store.put("s1", 3, Bytes::new()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.list("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_sorts_numerically() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        for index in [10u64, 2, 0, 1, 11, 9] {
            store
                .put("s1", index, Bytes::from(vec![index as u8]))
                .await
                .unwrap();
        }
        std::fs::write(store.fragments_dir("s1").join("notes.txt"), b"x").unwrap();
        let order: Vec<u64> = store.list("s1").await.unwrap().iter().map(|f| f.index).collect();
        assert_eq!(order, vec![0, 1, 2, 9, 10, 11]);
    }

    #[tokio::test]
    async fn rejects_path_like_session_ids() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        for bad in ["", "../escape", "a/b", "-flag"] {
            let err = store.put(bad, 0, Bytes::from_static(b"x")).await.unwrap_err();
            assert!(matches!(err, ChunkStoreError::InvalidSession(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn enforces_size_limit() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path()).with_max_fragment_bytes(Some(4));
        let err = store
            .put("s1", 0, Bytes::from_static(b"too long"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkStoreError::TooLarge { limit: 4, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn removing_session_clears_staging_and_tolerates_repeats() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        store.put("s1", 0, Bytes::from_static(b"a")).await.unwrap();
        std::fs::write(store.session_dir("s1").join("merged.webm"), b"a").unwrap();
        store.remove_session("s1").await.unwrap();
        assert!(!store.session_dir("s1").exists());
        store.remove_session("s1").await.unwrap();
    }

    #[tokio::test]
    async fn padded_fragment_names_are_ignored() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path());
        store.put("s1", 7, Bytes::from_static(b"real")).await.unwrap();
        let fragments_dir = store.fragments_dir("s1");
        std::fs::write(fragments_dir.join("007.part"), b"stray").unwrap();
        std::fs::write(fragments_dir.join("+8.part"), b"stray").unwrap();

        let listed = store.list("s1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].index, 7);
        assert_eq!(std::fs::read(&listed[0].path).unwrap(), b"real");
    }
}
