//! Virtual filesystem
//!
//! A unified interface over pluggable backends. Backends implement the
//! [`FileSystem`] trait; [`mount::VirtualFileSystem`] routes paths to the
//! most specific mount and merges views at mount boundaries; the
//! [`service`] module owns the whole tree on a dedicated thread and serves
//! blocking, wire-formatted requests from other execution contexts.

pub mod dev;
pub mod memory;
pub mod mount;
pub mod service;

pub use dev::{DevFs, TtyHandle};
pub use memory::MemoryFs;
pub use mount::VirtualFileSystem;
pub use service::{FsConnection, FsService};

use crate::kernel::error::{ApiError, ErrorKind};
use serde::{Deserialize, Serialize};

/// A backend-local open-file handle
pub type FileHandle = usize;

/// File open modes
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = read;
        self
    }

    pub fn write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

/// File metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub size: u64,
    pub is_dir: bool,
    pub is_file: bool,
}

impl Metadata {
    pub fn file(size: u64) -> Self {
        Self {
            size,
            is_dir: false,
            is_file: true,
        }
    }

    pub fn dir() -> Self {
        Self {
            size: 0,
            is_dir: true,
            is_file: false,
        }
    }
}

/// Directory entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Seek origin, kept serializable for the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeekWhence {
    Start,
    Current,
    End,
}

/// The FileSystem trait - implement this for different backends.
///
/// Backends see mount-relative paths and must be `Send` so the whole tree
/// can live on the filesystem service thread.
pub trait FileSystem: Send + std::fmt::Debug {
    /// Open a file, returning a handle
    fn open(&mut self, path: &str, options: OpenOptions) -> Result<FileHandle, ApiError>;

    /// Close a file handle
    fn close(&mut self, handle: FileHandle) -> Result<(), ApiError>;

    /// Read from a file at its cursor
    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, ApiError>;

    /// Write to a file at its cursor
    fn write(&mut self, handle: FileHandle, buf: &[u8]) -> Result<usize, ApiError>;

    /// Move a file cursor
    fn seek(
        &mut self,
        handle: FileHandle,
        whence: SeekWhence,
        offset: i64,
    ) -> Result<u64, ApiError>;

    /// Metadata for an open handle
    fn fstat(&self, handle: FileHandle) -> Result<Metadata, ApiError>;

    /// Metadata for a path
    fn metadata(&self, path: &str) -> Result<Metadata, ApiError>;

    /// Create a directory
    fn create_dir(&mut self, path: &str) -> Result<(), ApiError>;

    /// Read directory contents
    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ApiError>;

    /// Remove a file
    fn remove_file(&mut self, path: &str) -> Result<(), ApiError>;

    /// Remove an empty directory
    fn remove_dir(&mut self, path: &str) -> Result<(), ApiError>;

    /// Rename within this backend
    fn rename(&mut self, from: &str, to: &str) -> Result<(), ApiError>;

    /// Check if a path exists
    fn exists(&self, path: &str) -> bool;
}

/// Normalize an absolute path: leading slash, no trailing slash (except
/// root), `.` and `..` segments resolved.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Resolve a possibly-relative path against a working directory
pub fn resolve_path(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        normalize_path(path)
    } else {
        normalize_path(&format!("{cwd}/{path}"))
    }
}

/// Parent directory of a normalized path (`None` for root)
pub fn parent_path(path: &str) -> Option<String> {
    let path = normalize_path(path);
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    if idx == 0 {
        Some("/".to_string())
    } else {
        Some(path[..idx].to_string())
    }
}

/// Invalid-handle error shared by backends
pub(crate) fn bad_handle(handle: FileHandle) -> ApiError {
    ApiError::new(
        ErrorKind::InvalidInput,
        format!("invalid file handle {handle}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/a/b/"), "/a/b");
        assert_eq!(normalize_path("a/b"), "/a/b");
        assert_eq!(normalize_path("/a/./b"), "/a/b");
        assert_eq!(normalize_path("/a/../b"), "/b");
        assert_eq!(normalize_path("/../.."), "/");
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/home", "notes.txt"), "/home/notes.txt");
        assert_eq!(resolve_path("/home", "/etc/rc"), "/etc/rc");
        assert_eq!(resolve_path("/home", "../tmp"), "/tmp");
        assert_eq!(resolve_path("/", "."), "/");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/a/b"), Some("/a".to_string()));
        assert_eq!(parent_path("/a"), Some("/".to_string()));
        assert_eq!(parent_path("/"), None);
    }
}
