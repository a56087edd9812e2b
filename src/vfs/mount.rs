//! Mount table and path routing
//!
//! A [`VirtualFileSystem`] is a tree of mount points over a root backend.
//! Paths route to the most specific mount; views merge at mount
//! boundaries so files materialized directly on the root appear alongside
//! a mounted backend's contents. Open handles are routed through a
//! kernel-side table so a handle stays valid no matter which backend it
//! came from.

use super::{
    DirEntry, FileHandle, FileSystem, Metadata, OpenOptions, SeekWhence, normalize_path,
    parent_path,
};
use crate::kernel::error::{ApiError, ErrorKind};
use slab::Slab;

struct Mount {
    point: String,
    fs: Box<dyn FileSystem>,
}

/// Where an open handle lives
#[derive(Clone, PartialEq)]
enum Route {
    Root,
    Mount(String),
}

struct OpenHandle {
    route: Route,
    inner: FileHandle,
}

/// A path-routed filesystem over pluggable backends
pub struct VirtualFileSystem {
    root: Box<dyn FileSystem>,
    /// Sorted by path length descending so the most specific mount wins
    mounts: Vec<Mount>,
    handles: Slab<OpenHandle>,
}

impl VirtualFileSystem {
    pub fn new(root: Box<dyn FileSystem>) -> Self {
        Self {
            root,
            mounts: Vec::new(),
            handles: Slab::new(),
        }
    }

    /// Bind a backend at `point`. A path may not be mounted twice.
    pub fn mount(&mut self, point: &str, fs: Box<dyn FileSystem>) -> Result<(), ApiError> {
        let point = normalize_path(point);
        if point == "/" {
            return Err(ApiError::invalid_input(
                "cannot mount over the root backend",
            ));
        }
        if self.mounts.iter().any(|m| m.point == point) {
            return Err(ApiError::invalid_input(format!(
                "already mounted: {point}"
            )));
        }
        self.mounts.push(Mount { point, fs });
        self.mounts.sort_by(|a, b| b.point.len().cmp(&a.point.len()));
        Ok(())
    }

    /// Unbind the backend at `point`. Fails when the mount still has
    /// entries.
    pub fn unmount(&mut self, point: &str) -> Result<Box<dyn FileSystem>, ApiError> {
        let point = normalize_path(point);
        let idx = self
            .mounts
            .iter()
            .position(|m| m.point == point)
            .ok_or_else(|| ApiError::not_found(format!("not a mount point: {point}")))?;
        if !self.mounts[idx].fs.read_dir("/")?.is_empty() {
            return Err(ApiError::new(
                ErrorKind::NotEmpty,
                format!("directory not empty: {point}"),
            ));
        }
        Ok(self.mounts.remove(idx).fs)
    }

    pub fn mount_points(&self) -> Vec<String> {
        self.mounts.iter().map(|m| m.point.clone()).collect()
    }

    /// Select the most specific mount covering `path` and rewrite the path
    /// relative to it. Falls back to the root backend.
    fn locate(&self, path: &str) -> (Route, String, String) {
        let abs = normalize_path(path);
        for mount in &self.mounts {
            if abs == mount.point || abs.starts_with(&format!("{}/", mount.point)) {
                let rel = &abs[mount.point.len()..];
                let rel = if rel.is_empty() { "/" } else { rel };
                return (Route::Mount(mount.point.clone()), rel.to_string(), abs);
            }
        }
        (Route::Root, abs.clone(), abs)
    }

    fn backend(&mut self, route: &Route) -> Result<&mut (dyn FileSystem + '_), ApiError> {
        match route {
            Route::Root => Ok(self.root.as_mut()),
            Route::Mount(point) => match self.mounts.iter_mut().find(|m| &m.point == point) {
                Some(m) => Ok(m.fs.as_mut()),
                None => Err(ApiError::not_found(format!("mount is gone: {point}"))),
            },
        }
    }

    fn backend_ref(&self, route: &Route) -> Option<&dyn FileSystem> {
        match route {
            Route::Root => Some(self.root.as_ref()),
            Route::Mount(point) => self
                .mounts
                .iter()
                .find(|m| &m.point == point)
                .map(|m| m.fs.as_ref()),
        }
    }

    pub fn open(&mut self, path: &str, options: OpenOptions) -> Result<FileHandle, ApiError> {
        let (route, rel, abs) = self.locate(path);
        let attempt = self
            .backend(&route)?
            .open(&rel, options)
            .map_err(|e| caller_visible(e, &rel, &abs));
        let (route, inner) = match attempt {
            Ok(inner) => (route, inner),
            // A file materialized directly on the root may shadow a mount
            Err(e)
                if e.kind == ErrorKind::NotFound
                    && !options.create
                    && route != Route::Root
                    && self.root.exists(&abs) =>
            {
                (Route::Root, self.root.open(&abs, options)?)
            }
            Err(e) => return Err(e),
        };
        Ok(self.handles.insert(OpenHandle { route, inner }))
    }

    pub fn close(&mut self, handle: FileHandle) -> Result<(), ApiError> {
        if !self.handles.contains(handle) {
            return Err(super::bad_handle(handle));
        }
        let entry = self.handles.remove(handle);
        self.backend(&entry.route)?.close(entry.inner)
    }

    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize, ApiError> {
        let (route, inner) = self.route_of(handle)?;
        self.backend(&route)?.read(inner, buf)
    }

    pub fn write(&mut self, handle: FileHandle, buf: &[u8]) -> Result<usize, ApiError> {
        let (route, inner) = self.route_of(handle)?;
        self.backend(&route)?.write(inner, buf)
    }

    pub fn seek(
        &mut self,
        handle: FileHandle,
        whence: SeekWhence,
        offset: i64,
    ) -> Result<u64, ApiError> {
        let (route, inner) = self.route_of(handle)?;
        self.backend(&route)?.seek(inner, whence, offset)
    }

    pub fn fstat(&self, handle: FileHandle) -> Result<Metadata, ApiError> {
        let entry = self
            .handles
            .get(handle)
            .ok_or_else(|| super::bad_handle(handle))?;
        self.backend_ref(&entry.route)
            .ok_or_else(|| ApiError::not_found("mount is gone"))?
            .fstat(entry.inner)
    }

    fn route_of(&self, handle: FileHandle) -> Result<(Route, FileHandle), ApiError> {
        let entry = self
            .handles
            .get(handle)
            .ok_or_else(|| super::bad_handle(handle))?;
        Ok((entry.route.clone(), entry.inner))
    }

    pub fn metadata(&self, path: &str) -> Result<Metadata, ApiError> {
        let (route, rel, abs) = self.locate(path);
        match &route {
            Route::Root => self.root.metadata(&rel),
            Route::Mount(_) => {
                let primary = self
                    .backend_ref(&route)
                    .ok_or_else(|| ApiError::not_found("mount is gone"))?
                    .metadata(&rel)
                    .map_err(|e| caller_visible(e, &rel, &abs));
                match primary {
                    Err(e) if e.kind == ErrorKind::NotFound && self.root.exists(&abs) => {
                        self.root.metadata(&abs)
                    }
                    other => other,
                }
            }
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        let (route, rel, abs) = self.locate(path);
        match &route {
            Route::Root => self.root.exists(&rel),
            Route::Mount(_) => {
                self.backend_ref(&route)
                    .is_some_and(|fs| fs.exists(&rel))
                    || self.root.exists(&abs)
            }
        }
    }

    /// Canonical absolute path, or `NotFound` if nothing lives there
    pub fn realpath(&self, path: &str) -> Result<String, ApiError> {
        let abs = normalize_path(path);
        if self.exists(&abs) {
            Ok(abs)
        } else {
            Err(ApiError::not_found(format!("no such file: {abs}")))
        }
    }

    pub fn create_dir(&mut self, path: &str) -> Result<(), ApiError> {
        let (route, rel, abs) = self.locate(path);
        self.backend(&route)?
            .create_dir(&rel)
            .map_err(|e| caller_visible(e, &rel, &abs))
    }

    /// Directory listing. At a mount boundary, entries from the mount's
    /// backend and the root backend are merged, de-duplicated by name;
    /// mount points themselves show up in their parent's listing.
    pub fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ApiError> {
        let (route, rel, abs) = self.locate(path);
        let mut entries = match &route {
            Route::Root => self.root.read_dir(&rel)?,
            Route::Mount(_) => {
                let primary = self
                    .backend_ref(&route)
                    .ok_or_else(|| ApiError::not_found("mount is gone"))?
                    .read_dir(&rel)
                    .map_err(|e| caller_visible(e, &rel, &abs));
                match (primary, self.root.read_dir(&abs)) {
                    (Ok(mut entries), Ok(shadowed)) => {
                        for entry in shadowed {
                            if !entries.iter().any(|e| e.name == entry.name) {
                                entries.push(entry);
                            }
                        }
                        entries
                    }
                    (Ok(entries), Err(_)) => entries,
                    (Err(e), Ok(shadowed)) if e.kind == ErrorKind::NotFound => shadowed,
                    (Err(e), _) => return Err(e),
                }
            }
        };
        // Mount points directly under the listed directory
        for mount in &self.mounts {
            if parent_path(&mount.point).as_deref() == Some(abs.as_str()) {
                let name = mount.point.rsplit('/').next().unwrap_or_default();
                if !entries.iter().any(|e| e.name == name) {
                    entries.push(DirEntry {
                        name: name.to_string(),
                        is_dir: true,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn remove_file(&mut self, path: &str) -> Result<(), ApiError> {
        let (route, rel, abs) = self.locate(path);
        self.backend(&route)?
            .remove_file(&rel)
            .map_err(|e| caller_visible(e, &rel, &abs))
    }

    pub fn remove_dir(&mut self, path: &str) -> Result<(), ApiError> {
        let (route, rel, abs) = self.locate(path);
        self.backend(&route)?
            .remove_dir(&rel)
            .map_err(|e| caller_visible(e, &rel, &abs))
    }

    /// Remove a file, or an empty directory
    pub fn remove(&mut self, path: &str) -> Result<(), ApiError> {
        if self.metadata(path)?.is_dir {
            self.remove_dir(path)
        } else {
            self.remove_file(path)
        }
    }

    /// Rename. Across two different backends this degrades to
    /// read-whole-file, write, delete-source rather than an atomic move.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), ApiError> {
        let (from_route, from_rel, from_abs) = self.locate(from);
        let (to_route, to_rel, _to_abs) = self.locate(to);
        if from_route == to_route {
            return self
                .backend(&from_route)?
                .rename(&from_rel, &to_rel)
                .map_err(|e| caller_visible(e, &from_rel, &from_abs));
        }
        if self.metadata(&from_abs)?.is_dir {
            return Err(ApiError::unsupported(format!(
                "cannot move a directory across mounts: {from_abs}"
            )));
        }
        let data = self.read_file(&from_abs)?;
        self.write_file(to, &data)?;
        self.remove_file(&from_abs)
    }

    /// Whole-file read convenience
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>, ApiError> {
        let handle = self.open(path, OpenOptions::new())?;
        let result = self.read_all(handle);
        let _ = self.close(handle);
        result
    }

    fn read_all(&mut self, handle: FileHandle) -> Result<Vec<u8>, ApiError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(handle, &mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    /// Whole-file write convenience; creates or truncates
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<(), ApiError> {
        let handle = self.open(
            path,
            OpenOptions::new().write(true).create(true).truncate(true),
        )?;
        let result = self.write(handle, data);
        let _ = self.close(handle);
        result.map(|_| ())
    }
}

/// Replace the mount-relative path in a backend error with the
/// caller-visible absolute one.
fn caller_visible(mut err: ApiError, rel: &str, abs: &str) -> ApiError {
    if rel != abs && err.message.contains(rel) {
        err.message = err.message.replace(rel, abs);
    }
    err
}
