//! File and directory access used by the pipeline.
//!
//! The processor and reconciler only see these traits, so they can run
//! against the real disk ([`LocalFs`]) or an in-memory tree ([`MemoryFs`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use crate::error::Error;

/// Reads whole files.
pub trait FileReader: Send + Sync {
    /// Read a file's raw bytes. Decoding is left to the caller so one bad
    /// line cannot fail the whole file.
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error>;

    fn file_exists(&self, path: &Path) -> Result<bool, Error>;
}

/// Options for [`DirectoryLister::read_directory`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    pub recursive: bool,
}

/// One entry returned by a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub is_file: bool,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Lists directory contents.
pub trait DirectoryLister: Send + Sync {
    fn read_directory(&self, path: &Path, opts: ListOptions) -> Result<Vec<DirEntry>, Error>;
}

/// Real filesystem access.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FileReader for LocalFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error> {
        std::fs::read(path).map_err(|source| Error::FileReader {
            path: path.to_path_buf(),
            source,
        })
    }

    fn file_exists(&self, path: &Path) -> Result<bool, Error> {
        path.try_exists().map_err(|source| Error::FileReader {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl DirectoryLister for LocalFs {
    fn read_directory(&self, path: &Path, opts: ListOptions) -> Result<Vec<DirEntry>, Error> {
        let fs_error = |message: String| Error::FileSystem {
            path: path.to_path_buf(),
            message,
        };

        if !path.is_dir() {
            return Err(fs_error("not a directory".to_string()));
        }

        let max_depth = if opts.recursive { usize::MAX } else { 1 };
        let mut entries = Vec::new();

        for entry in WalkDir::new(path)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
        {
            let entry = entry.map_err(|e| fs_error(e.to_string()))?;
            let metadata = match entry.metadata() {
                Ok(m) => m,
                // Removed between readdir and stat
                Err(_) => continue,
            };
            let modified = metadata
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());

            entries.push(DirEntry {
                path: entry.into_path(),
                is_file: metadata.is_file(),
                size: metadata.len(),
                modified,
            });
        }

        Ok(entries)
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    content: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-memory file tree implementing both ports.
///
/// Directories are implicit: any prefix of a stored file path lists as a directory.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: Mutex<BTreeMap<PathBuf, MemoryFile>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, BTreeMap<PathBuf, MemoryFile>> {
        // The map holds plain data, a poisoned lock is still consistent.
        self.files.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or replace a file.
    pub fn write(&self, path: impl Into<PathBuf>, content: impl AsRef<[u8]>) {
        self.files().insert(
            path.into(),
            MemoryFile {
                content: content.as_ref().to_vec(),
                modified: Utc::now(),
            },
        );
    }

    /// Append to a file, creating it if needed.
    pub fn append(&self, path: impl Into<PathBuf>, content: impl AsRef<[u8]>) {
        let mut files = self.files();
        let file = files.entry(path.into()).or_insert_with(|| MemoryFile {
            content: Vec::new(),
            modified: Utc::now(),
        });
        file.content.extend_from_slice(content.as_ref());
        file.modified = Utc::now();
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.files().remove(path).is_some()
    }

    /// Override a file's modification time.
    pub fn set_modified(&self, path: &Path, modified: DateTime<Utc>) {
        if let Some(file) = self.files().get_mut(path) {
            file.modified = modified;
        }
    }
}

impl FileReader for MemoryFs {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>, Error> {
        self.files()
            .get(path)
            .map(|f| f.content.clone())
            .ok_or_else(|| Error::FileReader {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            })
    }

    fn file_exists(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.files().contains_key(path))
    }
}

impl DirectoryLister for MemoryFs {
    fn read_directory(&self, path: &Path, opts: ListOptions) -> Result<Vec<DirEntry>, Error> {
        let files = self.files();
        let mut dirs = BTreeMap::new();
        let mut entries = Vec::new();

        for (file_path, file) in files.iter() {
            let Ok(rel) = file_path.strip_prefix(path) else {
                continue;
            };
            let depth = rel.components().count();
            if depth == 0 {
                continue;
            }
            if opts.recursive || depth == 1 {
                entries.push(DirEntry {
                    path: file_path.clone(),
                    is_file: true,
                    size: file.content.len() as u64,
                    modified: file.modified,
                });
            }

            // Implicit directories between `path` and the file.
            let mut dir = path.to_path_buf();
            let parents: Vec<_> = rel.components().collect();
            for (i, component) in parents[..parents.len() - 1].iter().enumerate() {
                dir.push(component);
                if opts.recursive || i == 0 {
                    let modified = dirs.entry(dir.clone()).or_insert(file.modified);
                    if file.modified > *modified {
                        *modified = file.modified;
                    }
                }
            }
        }

        if entries.is_empty() && dirs.is_empty() {
            return Err(Error::FileSystem {
                path: path.to_path_buf(),
                message: "no such directory".to_string(),
            });
        }

        entries.extend(dirs.into_iter().map(|(path, modified)| DirEntry {
            path,
            is_file: false,
            size: 0,
            modified,
        }));
        Ok(entries)
    }
}
