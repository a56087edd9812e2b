//! In-memory filesystem backend
//!
//! Simple, fast, ephemeral. The root backend of a typical kernel and the
//! usual backend for extra mounts in tests.

use super::{
    DirEntry, FileHandle, FileSystem, Metadata, OpenOptions, SeekWhence, bad_handle, normalize_path,
    parent_path,
};
use crate::kernel::error::{ApiError, ErrorKind};
use slab::Slab;
use std::collections::HashMap;

/// An open file's cursor and access mode
#[derive(Debug)]
struct OpenFile {
    path: String,
    position: u64,
    readable: bool,
    writable: bool,
}

/// A stored file or directory
#[derive(Clone, Debug)]
enum Node {
    File(Vec<u8>),
    Directory,
}

/// In-memory filesystem
#[derive(Debug)]
pub struct MemoryFs {
    /// All files and directories, keyed by normalized path
    nodes: HashMap<String, Node>,
    /// Open file handles
    handles: Slab<OpenFile>,
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut fs = Self {
            nodes: HashMap::new(),
            handles: Slab::new(),
        };
        // Root directory always exists
        fs.nodes.insert("/".to_string(), Node::Directory);
        fs
    }

    fn ensure_parent(&self, path: &str) -> Result<(), ApiError> {
        if let Some(parent) = parent_path(path) {
            match self.nodes.get(&parent) {
                Some(Node::Directory) => Ok(()),
                Some(Node::File(_)) => Err(ApiError::new(
                    ErrorKind::NotADirectory,
                    format!("not a directory: {parent}"),
                )),
                None => Err(ApiError::not_found(format!(
                    "parent directory not found: {parent}"
                ))),
            }
        } else {
            Ok(())
        }
    }

    fn file_data(&self, path: &str) -> Result<&Vec<u8>, ApiError> {
        match self.nodes.get(path) {
            Some(Node::File(data)) => Ok(data),
            Some(Node::Directory) => Err(ApiError::new(
                ErrorKind::IsADirectory,
                format!("is a directory: {path}"),
            )),
            None => Err(ApiError::not_found(format!("no such file: {path}"))),
        }
    }

    fn file_data_mut(&mut self, path: &str) -> Result<&mut Vec<u8>, ApiError> {
        match self.nodes.get_mut(path) {
            Some(Node::File(data)) => Ok(data),
            Some(Node::Directory) => Err(ApiError::new(
                ErrorKind::IsADirectory,
                format!("is a directory: {path}"),
            )),
            None => Err(ApiError::not_found(format!("no such file: {path}"))),
        }
    }

    /// Child entries directly under `path`
    fn children_of<'a>(&'a self, path: &'a str) -> impl Iterator<Item = (&'a str, &'a Node)> {
        let prefix = if path == "/" {
            String::new()
        } else {
            path.to_string()
        };
        self.nodes.iter().filter_map(move |(p, node)| {
            let rest = p.strip_prefix(&prefix)?;
            let name = rest.strip_prefix('/')?;
            if name.is_empty() || name.contains('/') {
                None
            } else {
                Some((name, node))
            }
        })
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for MemoryFs {
    fn open(&mut self, path: &str, options: OpenOptions) -> Result<FileHandle, ApiError> {
        let path = normalize_path(path);
        let exists = self.nodes.contains_key(&path);

        if !exists {
            if !options.create {
                return Err(ApiError::not_found(format!("no such file: {path}")));
            }
            self.ensure_parent(&path)?;
            self.nodes.insert(path.clone(), Node::File(Vec::new()));
        } else if options.truncate {
            self.file_data_mut(&path)?.clear();
        }

        let size = match self.nodes.get(&path) {
            Some(Node::File(data)) => data.len() as u64,
            Some(Node::Directory) => {
                return Err(ApiError::new(
                    ErrorKind::IsADirectory,
                    format!("is a directory: {path}"),
                ));
            }
            None => return Err(ApiError::not_found(format!("no such file: {path}"))),
        };

        let handle = self.handles.insert(OpenFile {
            path,
            position: if options.append { size } else { 0 },
            readable: options.read,
            writable: options.write || options.append,
        });
        Ok(handle)
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), ApiError> {
        if self.handles.contains(handle) {
            self.handles.remove(handle);
            Ok(())
        } else {
            Err(bad_handle(handle))
        }
    }

    fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, ApiError> {
        let file = self.handles.get(handle).ok_or_else(|| bad_handle(handle))?;
        if !file.readable {
            return Err(ApiError::new(
                ErrorKind::PermissionDenied,
                format!("not opened for reading: {}", file.path),
            ));
        }
        let path = file.path.clone();
        let position = file.position as usize;

        let data = self.file_data(&path)?;
        let available = data.len().saturating_sub(position);
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&data[position..position + n]);

        if let Some(file) = self.handles.get_mut(handle) {
            file.position += n as u64;
        }
        Ok(n)
    }

    fn write(&mut self, handle: FileHandle, buf: &[u8]) -> Result<usize, ApiError> {
        let file = self.handles.get(handle).ok_or_else(|| bad_handle(handle))?;
        if !file.writable {
            return Err(ApiError::new(
                ErrorKind::PermissionDenied,
                format!("not opened for writing: {}", file.path),
            ));
        }
        let path = file.path.clone();
        let position = file.position as usize;

        let data = self.file_data_mut(&path)?;
        if position + buf.len() > data.len() {
            data.resize(position + buf.len(), 0);
        }
        data[position..position + buf.len()].copy_from_slice(buf);

        if let Some(file) = self.handles.get_mut(handle) {
            file.position += buf.len() as u64;
        }
        Ok(buf.len())
    }

    fn seek(
        &mut self,
        handle: FileHandle,
        whence: SeekWhence,
        offset: i64,
    ) -> Result<u64, ApiError> {
        let file = self.handles.get(handle).ok_or_else(|| bad_handle(handle))?;
        let size = self.file_data(&file.path)?.len() as i64;
        let current = file.position as i64;

        let target = match whence {
            SeekWhence::Start => offset,
            SeekWhence::Current => current + offset,
            SeekWhence::End => size + offset,
        };
        if target < 0 {
            return Err(ApiError::invalid_input("seek before start of file"));
        }

        if let Some(file) = self.handles.get_mut(handle) {
            file.position = target as u64;
        }
        Ok(target as u64)
    }

    fn fstat(&self, handle: FileHandle) -> Result<Metadata, ApiError> {
        let file = self.handles.get(handle).ok_or_else(|| bad_handle(handle))?;
        self.metadata(&file.path)
    }

    fn metadata(&self, path: &str) -> Result<Metadata, ApiError> {
        let path = normalize_path(path);
        match self.nodes.get(&path) {
            Some(Node::File(data)) => Ok(Metadata::file(data.len() as u64)),
            Some(Node::Directory) => Ok(Metadata::dir()),
            None => Err(ApiError::not_found(format!("no such file: {path}"))),
        }
    }

    fn create_dir(&mut self, path: &str) -> Result<(), ApiError> {
        let path = normalize_path(path);
        if self.nodes.contains_key(&path) {
            return Err(ApiError::new(
                ErrorKind::AlreadyExists,
                format!("already exists: {path}"),
            ));
        }
        self.ensure_parent(&path)?;
        self.nodes.insert(path, Node::Directory);
        Ok(())
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ApiError> {
        let path = normalize_path(path);
        match self.nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => {
                return Err(ApiError::new(
                    ErrorKind::NotADirectory,
                    format!("not a directory: {path}"),
                ));
            }
            None => return Err(ApiError::not_found(format!("no such directory: {path}"))),
        }
        let mut entries: Vec<DirEntry> = self
            .children_of(&path)
            .map(|(name, node)| DirEntry {
                name: name.to_string(),
                is_dir: matches!(node, Node::Directory),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn remove_file(&mut self, path: &str) -> Result<(), ApiError> {
        let path = normalize_path(path);
        match self.nodes.get(&path) {
            Some(Node::File(_)) => {
                self.nodes.remove(&path);
                Ok(())
            }
            Some(Node::Directory) => Err(ApiError::new(
                ErrorKind::IsADirectory,
                format!("is a directory: {path}"),
            )),
            None => Err(ApiError::not_found(format!("no such file: {path}"))),
        }
    }

    fn remove_dir(&mut self, path: &str) -> Result<(), ApiError> {
        let path = normalize_path(path);
        match self.nodes.get(&path) {
            Some(Node::Directory) => {}
            Some(Node::File(_)) => {
                return Err(ApiError::new(
                    ErrorKind::NotADirectory,
                    format!("not a directory: {path}"),
                ));
            }
            None => return Err(ApiError::not_found(format!("no such directory: {path}"))),
        }
        if path == "/" {
            return Err(ApiError::invalid_input("cannot remove root directory"));
        }
        if self.children_of(&path).next().is_some() {
            return Err(ApiError::new(
                ErrorKind::NotEmpty,
                format!("directory not empty: {path}"),
            ));
        }
        self.nodes.remove(&path);
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), ApiError> {
        let from = normalize_path(from);
        let to = normalize_path(to);
        if !self.nodes.contains_key(&from) {
            return Err(ApiError::not_found(format!("no such file: {from}")));
        }
        self.ensure_parent(&to)?;

        // Move the node and, for directories, everything underneath it
        let prefix = format!("{from}/");
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| **p == from || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            let node = self.nodes.remove(&old).expect("key listed above");
            let new = format!("{to}{}", &old[from.len()..]);
            self.nodes.insert(new, node);
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&normalize_path(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let mut fs = MemoryFs::new();
        let h = fs
            .open("/hello.txt", OpenOptions::new().write(true).create(true))
            .unwrap();
        fs.write(h, b"Hello, World!").unwrap();
        fs.close(h).unwrap();

        let h = fs.open("/hello.txt", OpenOptions::new()).unwrap();
        let mut buf = [0u8; 32];
        let n = fs.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"Hello, World!");
        fs.close(h).unwrap();
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let mut fs = MemoryFs::new();
        let err = fs.open("/absent", OpenOptions::new()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_append_positions_at_end() {
        let mut fs = MemoryFs::new();
        let h = fs
            .open("/log", OpenOptions::new().write(true).create(true))
            .unwrap();
        fs.write(h, b"one").unwrap();
        fs.close(h).unwrap();

        let h = fs
            .open("/log", OpenOptions::new().append(true).create(true))
            .unwrap();
        fs.write(h, b"two").unwrap();
        fs.close(h).unwrap();

        assert_eq!(fs.metadata("/log").unwrap().size, 6);
    }

    #[test]
    fn test_seek() {
        let mut fs = MemoryFs::new();
        let h = fs
            .open("/f", OpenOptions::new().write(true).create(true))
            .unwrap();
        fs.write(h, b"abcdef").unwrap();
        fs.close(h).unwrap();

        let h = fs.open("/f", OpenOptions::new()).unwrap();
        fs.seek(h, SeekWhence::End, -2).unwrap();
        let mut buf = [0u8; 4];
        let n = fs.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ef");

        fs.seek(h, SeekWhence::Start, 1).unwrap();
        let n = fs.read(h, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"bcde");

        let err = fs.seek(h, SeekWhence::Current, -100).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[test]
    fn test_mkdir_and_readdir() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/docs").unwrap();
        let h = fs
            .open("/docs/a.txt", OpenOptions::new().write(true).create(true))
            .unwrap();
        fs.close(h).unwrap();

        let entries = fs.read_dir("/docs").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
        assert!(!entries[0].is_dir);
    }

    #[test]
    fn test_create_without_parent_fails() {
        let mut fs = MemoryFs::new();
        let err = fs
            .open("/no/such/dir.txt", OpenOptions::new().write(true).create(true))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_remove_dir_not_empty() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/d").unwrap();
        let h = fs
            .open("/d/f", OpenOptions::new().write(true).create(true))
            .unwrap();
        fs.close(h).unwrap();

        let err = fs.remove_dir("/d").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotEmpty);

        fs.remove_file("/d/f").unwrap();
        fs.remove_dir("/d").unwrap();
        assert!(!fs.exists("/d"));
    }

    #[test]
    fn test_rename_moves_directory_tree() {
        let mut fs = MemoryFs::new();
        fs.create_dir("/a").unwrap();
        let h = fs
            .open("/a/f", OpenOptions::new().write(true).create(true))
            .unwrap();
        fs.write(h, b"x").unwrap();
        fs.close(h).unwrap();

        fs.rename("/a", "/b").unwrap();
        assert!(!fs.exists("/a"));
        assert!(fs.exists("/b/f"));
        assert_eq!(fs.metadata("/b/f").unwrap().size, 1);
    }
}
