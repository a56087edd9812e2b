//! Device filesystem backend
//!
//! A small backend meant to be mounted at `/dev`. It carries the
//! controlling terminal device (`tty`) that stdio resources open against,
//! and the byte sink (`null`). The tty's buffers are shared: the hosting
//! program keeps a [`TtyHandle`] to feed input and drain output while the
//! backend itself lives on the filesystem service thread.

use super::{
    DirEntry, FileHandle, FileSystem, Metadata, OpenOptions, SeekWhence, bad_handle, normalize_path,
};
use crate::kernel::error::{ApiError, ErrorKind};
use slab::Slab;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug)]
struct TtyState {
    /// Pending input (keyboard side)
    input: VecDeque<u8>,
    /// Accumulated output (display side)
    output: Vec<u8>,
}

/// Host-side handle to the terminal device buffers
#[derive(Clone, Debug)]
pub struct TtyHandle {
    state: Arc<Mutex<TtyState>>,
}

impl TtyHandle {
    /// Feed input that subsequent tty reads will observe
    pub fn push_input(&self, data: &[u8]) {
        self.state
            .lock()
            .expect("tty lock poisoned")
            .input
            .extend(data);
    }

    /// Take everything written to the tty so far
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().expect("tty lock poisoned").output)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Device {
    Tty,
    Null,
}

impl Device {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            "/tty" => Some(Device::Tty),
            "/null" => Some(Device::Null),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Device::Tty => "tty",
            Device::Null => "null",
        }
    }
}

/// Device filesystem
#[derive(Debug)]
pub struct DevFs {
    tty: Arc<Mutex<TtyState>>,
    handles: Slab<Device>,
}

impl DevFs {
    /// Build the backend and the host-side tty handle
    pub fn new() -> (Self, TtyHandle) {
        let tty = Arc::new(Mutex::new(TtyState {
            input: VecDeque::new(),
            output: Vec::new(),
        }));
        let handle = TtyHandle { state: tty.clone() };
        (
            Self {
                tty,
                handles: Slab::new(),
            },
            handle,
        )
    }

    fn not_permitted(path: &str) -> ApiError {
        ApiError::new(
            ErrorKind::PermissionDenied,
            format!("device tree is read-only: {path}"),
        )
    }
}

impl FileSystem for DevFs {
    fn open(&mut self, path: &str, _options: OpenOptions) -> Result<FileHandle, ApiError> {
        let path = normalize_path(path);
        let device = Device::from_path(&path)
            .ok_or_else(|| ApiError::not_found(format!("no such device: {path}")))?;
        Ok(self.handles.insert(device))
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
        let device = *self.handles.get(handle).ok_or_else(|| bad_handle(handle))?;
        match device {
            Device::Tty => {
                let mut state = self.tty.lock().expect("tty lock poisoned");
                let n = buf.len().min(state.input.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = state.input.pop_front().expect("length checked");
                }
                Ok(n)
            }
            Device::Null => Ok(0),
        }
    }

    fn write(&mut self, handle: FileHandle, buf: &[u8]) -> Result<usize, ApiError> {
        let device = *self.handles.get(handle).ok_or_else(|| bad_handle(handle))?;
        match device {
            Device::Tty => {
                self.tty
                    .lock()
                    .expect("tty lock poisoned")
                    .output
                    .extend_from_slice(buf);
                Ok(buf.len())
            }
            Device::Null => Ok(buf.len()),
        }
    }

    fn seek(
        &mut self,
        handle: FileHandle,
        _whence: SeekWhence,
        _offset: i64,
    ) -> Result<u64, ApiError> {
        let _ = self.handles.get(handle).ok_or_else(|| bad_handle(handle))?;
        Err(ApiError::unsupported("devices are not seekable"))
    }

    fn fstat(&self, handle: FileHandle) -> Result<Metadata, ApiError> {
        let _ = self.handles.get(handle).ok_or_else(|| bad_handle(handle))?;
        Ok(Metadata::file(0))
    }

    fn metadata(&self, path: &str) -> Result<Metadata, ApiError> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(Metadata::dir());
        }
        match Device::from_path(&path) {
            Some(_) => Ok(Metadata::file(0)),
            None => Err(ApiError::not_found(format!("no such device: {path}"))),
        }
    }

    fn create_dir(&mut self, path: &str) -> Result<(), ApiError> {
        Err(Self::not_permitted(path))
    }

    fn read_dir(&self, path: &str) -> Result<Vec<DirEntry>, ApiError> {
        let path = normalize_path(path);
        if path != "/" {
            return Err(ApiError::new(
                ErrorKind::NotADirectory,
                format!("not a directory: {path}"),
            ));
        }
        Ok([Device::Null, Device::Tty]
            .iter()
            .map(|d| DirEntry {
                name: d.name().to_string(),
                is_dir: false,
            })
            .collect())
    }

    fn remove_file(&mut self, path: &str) -> Result<(), ApiError> {
        Err(Self::not_permitted(path))
    }

    fn remove_dir(&mut self, path: &str) -> Result<(), ApiError> {
        Err(Self::not_permitted(path))
    }

    fn rename(&mut self, from: &str, _to: &str) -> Result<(), ApiError> {
        Err(Self::not_permitted(from))
    }

    fn exists(&self, path: &str) -> bool {
        let path = normalize_path(path);
        path == "/" || Device::from_path(&path).is_some()
    }
}
