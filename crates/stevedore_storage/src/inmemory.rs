//! In-memory [`StorageDriver`], used by the test suites and as the reference
//! for driver semantics (not-found reporting, offset checks, idempotent batch
//! deletes).
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream;
use futures::StreamExt;

use crate::errors::{Error, Result};
use crate::{validate_path, ByteStream, FileInfo, FileInfoStream, FileWriter, StorageDriver};

#[derive(Clone)]
struct Entry {
    data: Vec<u8>,
    mod_time: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct InMemoryDriver {
    state: Arc<Mutex<BTreeMap<String, Entry>>>,
}

impl InMemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(path: &str) -> Error {
        Error::PathNotFound {
            path: path.to_string(),
        }
    }

    /// Number of stored objects; test helper.
    pub fn object_count(&self) -> usize {
        self.state.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageDriver for InMemoryDriver {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    async fn get_content(&self, path: &str) -> Result<Bytes> {
        validate_path(path)?;
        let state = self.state.lock().unwrap();
        state
            .get(path)
            .map(|e| Bytes::copy_from_slice(&e.data))
            .ok_or_else(|| Self::not_found(path))
    }

    async fn put_content(&self, path: &str, content: Bytes) -> Result<()> {
        validate_path(path)?;
        let mut state = self.state.lock().unwrap();
        state.insert(
            path.to_string(),
            Entry {
                data: content.to_vec(),
                mod_time: Utc::now(),
            },
        );
        Ok(())
    }

    async fn reader(&self, path: &str, offset: u64) -> Result<ByteStream> {
        validate_path(path)?;
        let state = self.state.lock().unwrap();
        let entry = state.get(path).ok_or_else(|| Self::not_found(path))?;
        if offset > entry.data.len() as u64 {
            return Err(Error::InvalidOffset {
                path: path.to_string(),
                offset,
            });
        }
        let tail = Bytes::copy_from_slice(&entry.data[offset as usize..]);
        Ok(stream::iter([Ok(tail)]).boxed())
    }

    async fn writer(&self, path: &str, append: bool) -> Result<Box<dyn FileWriter>> {
        validate_path(path)?;
        let buffer = if append {
            let state = self.state.lock().unwrap();
            state.get(path).map(|e| e.data.clone()).unwrap_or_default()
        } else {
            Vec::new()
        };
        Ok(Box::new(InMemoryFileWriter {
            state: self.state.clone(),
            path: path.to_string(),
            buffer,
            terminated: false,
        }))
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        validate_path(path)?;
        let state = self.state.lock().unwrap();
        if let Some(entry) = state.get(path) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: entry.data.len() as u64,
                is_dir: false,
                mod_time: entry.mod_time,
            });
        }
        let prefix = format!("{path}/");
        if state.keys().any(|k| k.starts_with(&prefix)) {
            return Ok(FileInfo {
                path: path.to_string(),
                size: 0,
                is_dir: true,
                mod_time: Utc::now(),
            });
        }
        Err(Self::not_found(path))
    }

    async fn list(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let state = self.state.lock().unwrap();
        let mut children: Vec<String> = state
            .keys()
            .filter_map(|k| {
                let rest = k.strip_prefix(&prefix)?;
                let first = rest.split('/').next()?;
                Some(format!("{prefix}{first}"))
            })
            .collect();
        children.dedup();
        if children.is_empty() && !state.contains_key(path) {
            return Err(Self::not_found(path));
        }
        Ok(children)
    }

    async fn walk(&self, path: &str) -> Result<FileInfoStream> {
        validate_path(path)?;
        let prefix = format!("{path}/");
        let state = self.state.lock().unwrap();
        let entries: Vec<Result<FileInfo>> = state
            .iter()
            .filter(|(k, _)| *k == path || k.starts_with(&prefix))
            .map(|(k, e)| {
                Ok(FileInfo {
                    path: k.clone(),
                    size: e.data.len() as u64,
                    is_dir: false,
                    mod_time: e.mod_time,
                })
            })
            .collect();
        Ok(stream::iter(entries).boxed())
    }

    async fn rename(&self, source: &str, dest: &str) -> Result<()> {
        validate_path(source)?;
        validate_path(dest)?;
        let mut state = self.state.lock().unwrap();
        let entry = state.remove(source).ok_or_else(|| Self::not_found(source))?;
        state.insert(dest.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let prefix = format!("{path}/");
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<String> = state
            .keys()
            .filter(|k| *k == path || k.starts_with(&prefix))
            .cloned()
            .collect();
        if doomed.is_empty() {
            return Err(Self::not_found(path));
        }
        for k in doomed {
            state.remove(&k);
        }
        Ok(())
    }

    async fn delete_files(&self, paths: &[String]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0;
        for path in paths {
            if state.remove(path).is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn url_for(
        &self,
        _path: &str,
        _method: &http::Method,
        _expiry: Duration,
    ) -> Result<String> {
        Err(Error::UnsupportedMethod)
    }
}

struct InMemoryFileWriter {
    state: Arc<Mutex<BTreeMap<String, Entry>>>,
    path: String,
    buffer: Vec<u8>,
    terminated: bool,
}

#[async_trait]
impl FileWriter for InMemoryFileWriter {
    async fn write(&mut self, data: Bytes) -> Result<usize> {
        if self.terminated {
            return Err(Error::UploadTerminated);
        }
        self.buffer.extend_from_slice(&data);
        Ok(data.len())
    }

    fn size(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn commit(&mut self) -> Result<()> {
        if self.terminated {
            return Err(Error::UploadTerminated);
        }
        self.terminated = true;
        let mut state = self.state.lock().unwrap();
        state.insert(
            self.path.clone(),
            Entry {
                data: std::mem::take(&mut self.buffer),
                mod_time: Utc::now(),
            },
        );
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        self.terminated = true;
        self.buffer.clear();
        let mut state = self.state.lock().unwrap();
        state.remove(&self.path);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.terminated {
            // keep buffered content so a later append-mode writer can resume
            let mut state = self.state.lock().unwrap();
            state.insert(
                self.path.clone(),
                Entry {
                    data: std::mem::take(&mut self.buffer),
                    mod_time: Utc::now(),
                },
            );
            self.terminated = true;
        }
        Ok(())
    }
}
