//! Local directory backend.
//!
//! Compressed objects carry their encoding as a file suffix (`key.gz`,
//! `key.br`), so a plain directory listing still shows what each file holds.
//! The suffixes are reserved: a key whose last component ends in one of them
//! is rejected, so every file maps back to exactly one key.

use std::collections::{BTreeSet, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use tokio::sync::Mutex;
use tokio::{fs, io::AsyncWriteExt};

use crate::adapter::{ObjectAttrs, ObjectBackend, RawObject};
use crate::codec::Encoding;
use crate::error::{Result, StorageError};
use crate::target::{BackendKind, is_direct_child};

/// Suffix probe order on read.
const VARIANTS: [Encoding; 3] = [Encoding::Gzip, Encoding::Brotli, Encoding::Identity];
const RESERVED_SUFFIXES: [&str; 2] = [".gz", ".br"];
const TMP_MARKER: &str = ".objstore-tmp-";
const WRITE_LOCKS: usize = 64;

pub struct LocalFsBackend {
    root: PathBuf,
    /// Striped by key path. Writers to one key hold its stripe from the
    /// rename until every other variant is gone.
    write_locks: Vec<Mutex<()>>,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            write_locks: (0..WRITE_LOCKS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target(&self) -> String {
        self.root.display().to_string()
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let invalid = |reason| StorageError::InvalidKey {
            key: key.to_owned(),
            reason,
        };
        if key.is_empty() {
            return Err(invalid("key is empty"));
        }
        if key.contains(TMP_MARKER) {
            return Err(invalid("key contains a reserved temporary-file marker"));
        }
        if RESERVED_SUFFIXES.iter().any(|ext| key.ends_with(ext)) {
            return Err(invalid("`.gz` and `.br` suffixes are reserved for stored encodings"));
        }
        self.resolve(key, key)
    }

    /// Joins the `/`-separated `rel` onto the root, refusing anything that
    /// could step outside it. `key` only names the offender in errors.
    fn resolve(&self, key: &str, rel: &str) -> Result<PathBuf> {
        let invalid = |reason| StorageError::InvalidKey {
            key: key.to_owned(),
            reason,
        };
        if rel.starts_with('/') {
            return Err(invalid("key must be relative"));
        }
        let mut path = self.root.clone();
        if rel.is_empty() {
            return Ok(path);
        }
        for part in rel.split('/') {
            match part {
                "" => return Err(invalid("key has an empty path component")),
                "." | ".." => return Err(invalid("key must not contain `.` or `..` components")),
                part => path.push(part),
            }
        }
        Ok(path)
    }

    fn write_lock(&self, path: &Path) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        &self.write_locks[hasher.finish() as usize % self.write_locks.len()]
    }

    fn variant_path(path: &Path, encoding: Encoding) -> PathBuf {
        match encoding.file_extension() {
            Some(ext) => {
                let mut name = path.as_os_str().to_owned();
                name.push(".");
                name.push(ext);
                PathBuf::from(name)
            }
            None => path.to_path_buf(),
        }
    }

    fn io_error(&self, key: &str, err: std::io::Error) -> StorageError {
        StorageError::backend(BackendKind::Local, self.target(), Some(key), err)
    }

    async fn remove_if_present(&self, key: &str, path: &Path) -> Result<bool> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(key, e)),
        }
    }
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    async fn get_object(&self, key: &str) -> Result<Option<RawObject>> {
        let path = self.path_for(key)?;
        for encoding in VARIANTS {
            match fs::read(Self::variant_path(&path, encoding)).await {
                Ok(buf) => {
                    return Ok(Some(RawObject {
                        data: Bytes::from(buf),
                        encoding: encoding.header_value().map(str::to_owned),
                        content_type: None,
                    }));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_error(key, e)),
            }
        }
        Ok(None)
    }

    async fn put_object(&self, key: &str, data: Bytes, attrs: &ObjectAttrs) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| self.io_error(key, e))?;
        }

        let _guard = self.write_lock(&path).lock().await;
        let dest = Self::variant_path(&path, attrs.encoding);
        let mut tmp = dest.as_os_str().to_owned();
        tmp.push(format!("{TMP_MARKER}{}", uuid::Uuid::new_v4().simple()));
        let tmp = PathBuf::from(tmp);

        let written = async {
            let mut f = fs::File::create(&tmp).await?;
            f.write_all(&data).await?;
            f.flush().await?;
            fs::rename(&tmp, &dest).await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.io_error(key, e));
        }

        // A stale variant would shadow or duplicate the new object on read.
        for encoding in VARIANTS.into_iter().filter(|e| *e != attrs.encoding) {
            self.remove_if_present(key, &Self::variant_path(&path, encoding))
                .await?;
        }
        Ok(())
    }

    async fn delete_object(&self, key: &str, strict: bool) -> Result<()> {
        let path = self.path_for(key)?;
        let _guard = self.write_lock(&path).lock().await;
        let mut removed = false;
        for encoding in VARIANTS {
            removed |= self
                .remove_if_present(key, &Self::variant_path(&path, encoding))
                .await?;
        }
        if !removed && strict {
            return Err(StorageError::NotFound {
                target: self.target(),
                key: key.to_owned(),
            });
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key)?;
        for encoding in VARIANTS {
            match fs::metadata(Self::variant_path(&path, encoding)).await {
                Ok(meta) if meta.is_file() => return Ok(true),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_error(key, e)),
            }
        }
        Ok(false)
    }

    fn list_objects(&self, prefix: &str, recursive: bool) -> BoxStream<'static, Result<String>> {
        let dir_part = prefix.rfind('/').map_or("", |idx| &prefix[..idx]);
        let file_part = prefix.rfind('/').map_or(prefix, |idx| &prefix[idx + 1..]);
        let start = match self.resolve(prefix, dir_part) {
            Ok(_) if matches!(file_part, "." | "..") => Err(StorageError::InvalidKey {
                key: prefix.to_owned(),
                reason: "key must not contain `.` or `..` components",
            }),
            other => other,
        };
        let start = match start {
            Ok(start) => start,
            Err(err) => {
                return futures::stream::once(async move { Err::<String, _>(err) }).boxed();
            }
        };
        let walk = DirWalk {
            root: self.root.clone(),
            dirs: VecDeque::from([start]),
            ready: VecDeque::new(),
            recursive,
        };
        let target = self.target();
        let prefix = prefix.to_owned();

        futures::stream::try_unfold(walk, DirWalk::next)
            .map_err(move |e| StorageError::backend(BackendKind::Local, target.clone(), None, e))
            .try_filter(move |key| {
                let keep =
                    key.starts_with(&prefix) && (recursive || is_direct_child(&prefix, key));
                futures::future::ready(keep)
            })
            .boxed()
    }
}

/// Breadth-first directory walk yielding one directory's keys at a time.
struct DirWalk {
    root: PathBuf,
    dirs: VecDeque<PathBuf>,
    ready: VecDeque<String>,
    recursive: bool,
}

impl DirWalk {
    async fn next(mut self) -> std::io::Result<Option<(String, Self)>> {
        loop {
            if let Some(key) = self.ready.pop_front() {
                return Ok(Some((key, self)));
            }
            let Some(dir) = self.dirs.pop_front() else {
                return Ok(None);
            };
            self.read_dir(&dir).await?;
        }
    }

    async fn read_dir(&mut self, dir: &Path) -> std::io::Result<()> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        // Sorted and deduplicated so `a.gz` and a stale `a` list once.
        let mut keys = BTreeSet::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                if self.recursive {
                    self.dirs.push_back(path);
                }
                continue;
            }
            let Some(key) = self.key_for(&path) else {
                continue;
            };
            keys.insert(key);
        }
        self.ready.extend(keys);
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut key = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?
            .join("/");
        if key.contains(TMP_MARKER) {
            return None;
        }
        for ext in RESERVED_SUFFIXES {
            if let Some(stripped) = key.strip_suffix(ext) {
                key = stripped.to_owned();
                break;
            }
        }
        Some(key)
    }
}
