//! Resources and the per-process resource table
//!
//! Every handle a guest holds is a resource: an open file, a pipe end, a
//! spawned child, an incremental text decoder. Guests refer to them by
//! small integer rids. Rids 0/1/2 are reserved for stdin/stdout/stderr
//! and resolve to files opened against the controlling terminal device
//! unless overridden at spawn. Rids are handed out from a monotonic
//! counter and never recycled while the table lives.

use super::error::ApiError;
use super::pipe::InMemoryPipe;
use crate::vfs::service::{FILE_ENDPOINT, FsConnection};
use crate::vfs::{OpenOptions, SeekWhence};
use serde_json::json;
use std::collections::HashMap;
use std::rc::Rc;

/// An open virtual file; the cursor lives backend-side with the handle
pub struct FileResource {
    pub path: String,
    pub handle: u64,
    pub conn: FsConnection,
}

impl FileResource {
    pub fn read_sync(&self, len: usize) -> Result<Vec<u8>, ApiError> {
        let value = self
            .conn
            .call(FILE_ENDPOINT, "readSync", json!([self.handle, len]))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn write_sync(&self, data: &[u8]) -> Result<usize, ApiError> {
        let value = self
            .conn
            .call(FILE_ENDPOINT, "writeSync", json!([self.handle, data]))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn seek_sync(&self, whence: SeekWhence, offset: i64) -> Result<u64, ApiError> {
        let value = self
            .conn
            .call(FILE_ENDPOINT, "seekSync", json!([self.handle, whence, offset]))?;
        Ok(serde_json::from_value(value)?)
    }
}

/// One end of an in-memory pipe. Ends sharing a pipe share its refcount.
pub struct PipeResource {
    pub pipe: Rc<InMemoryPipe>,
}

/// A spawned child, identified by pid
pub struct ChildProcessResource {
    pub pid: u32,
}

/// Incremental UTF-8 decoder with partial-sequence carry-over
pub struct TextDecoderResource {
    carry: Vec<u8>,
}

impl TextDecoderResource {
    pub fn new() -> Self {
        Self { carry: Vec::new() }
    }

    /// Decode a chunk. A trailing incomplete sequence is held back and
    /// prepended to the next call; invalid bytes become replacement
    /// characters.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.carry.extend_from_slice(bytes);
        match std::str::from_utf8(&self.carry) {
            Ok(s) => {
                let out = s.to_string();
                self.carry.clear();
                out
            }
            Err(e) => match e.error_len() {
                None => {
                    let valid = e.valid_up_to();
                    let out = String::from_utf8_lossy(&self.carry[..valid]).into_owned();
                    self.carry.drain(..valid);
                    out
                }
                Some(_) => {
                    let out = String::from_utf8_lossy(&self.carry).into_owned();
                    self.carry.clear();
                    out
                }
            },
        }
    }
}

impl Default for TextDecoderResource {
    fn default() -> Self {
        Self::new()
    }
}

/// A typed handle owned by exactly one resource table entry
pub enum Resource {
    File(FileResource),
    Pipe(PipeResource),
    Child(ChildProcessResource),
    TextDecoder(TextDecoderResource),
}

impl Resource {
    pub fn type_name(&self) -> &'static str {
        match self {
            Resource::File(_) => "file",
            Resource::Pipe(_) => "pipe",
            Resource::Child(_) => "child",
            Resource::TextDecoder(_) => "textDecoder",
        }
    }

    /// Drain available bytes without suspending. Pipe reads return what
    /// is buffered, possibly nothing.
    pub fn read_sync(&mut self, len: usize) -> Result<Vec<u8>, ApiError> {
        match self {
            Resource::File(f) => f.read_sync(len),
            Resource::Pipe(p) => Ok(p.pipe.drain_now(len)),
            other => Err(ApiError::invalid_input(format!(
                "cannot read from {}",
                other.type_name()
            ))),
        }
    }

    /// Write without suspending. Pipe writes land immediately; the
    /// backpressure wait only applies on the async path.
    pub fn write_sync(&mut self, data: &[u8]) -> Result<usize, ApiError> {
        match self {
            Resource::File(f) => f.write_sync(data),
            Resource::Pipe(p) => p.pipe.push_now(data),
            other => Err(ApiError::invalid_input(format!(
                "cannot write to {}",
                other.type_name()
            ))),
        }
    }

    /// Release the underlying object: files close backend-side, pipes
    /// drop one reference.
    pub fn close(&mut self) -> Result<(), ApiError> {
        match self {
            Resource::File(f) => f.conn.close_sync(f.handle),
            Resource::Pipe(p) => {
                p.pipe.unref();
                Ok(())
            }
            Resource::Child(_) | Resource::TextDecoder(_) => Ok(()),
        }
    }

    /// Half-close: no more data will flow, but the handle stays in the
    /// table until closed.
    pub fn shutdown(&mut self) -> Result<(), ApiError> {
        match self {
            Resource::Pipe(p) => {
                p.pipe.close();
                Ok(())
            }
            Resource::File(_) => Ok(()),
            other => Err(ApiError::unsupported(format!(
                "cannot shut down {}",
                other.type_name()
            ))),
        }
    }
}

/// Reserved stdio rids
pub const STDIN_RID: u32 = 0;
pub const STDOUT_RID: u32 = 1;
pub const STDERR_RID: u32 = 2;

/// Default device the reserved rids open against
pub const TTY_PATH: &str = "/dev/tty";

/// Mapping from rid to resource, exclusively owned by one process
pub struct ResourceTable {
    entries: HashMap<u32, Resource>,
    next_rid: u32,
}

impl ResourceTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_rid: 3,
        }
    }

    /// Open the three reserved stdio entries against the given device
    /// paths (the controlling terminal unless overridden at spawn).
    pub fn install_stdio(
        &mut self,
        conn: &FsConnection,
        paths: &[String; 3],
    ) -> Result<(), ApiError> {
        for (rid, path) in paths.iter().enumerate() {
            let handle = conn.open_sync(path, OpenOptions::new().read(true).write(true))?;
            self.entries.insert(
                rid as u32,
                Resource::File(FileResource {
                    path: path.clone(),
                    handle,
                    conn: conn.clone(),
                }),
            );
        }
        Ok(())
    }

    /// Assign the next rid, strictly increasing per table
    pub fn add(&mut self, resource: Resource) -> u32 {
        let rid = self.next_rid;
        self.next_rid += 1;
        self.entries.insert(rid, resource);
        rid
    }

    pub fn get(&self, rid: u32) -> Option<&Resource> {
        self.entries.get(&rid)
    }

    pub fn get_mut(&mut self, rid: u32) -> Option<&mut Resource> {
        self.entries.get_mut(&rid)
    }

    /// Close the resource and remove the entry
    pub fn close(&mut self, rid: u32) -> Result<(), ApiError> {
        let mut resource = self
            .entries
            .remove(&rid)
            .ok_or_else(|| bad_rid(rid))?;
        resource.close()
    }

    /// Close, swallowing the resource's own close failure. A missing rid
    /// is still an error.
    pub fn try_close(&mut self, rid: u32) -> Result<(), ApiError> {
        let mut resource = self
            .entries
            .remove(&rid)
            .ok_or_else(|| bad_rid(rid))?;
        if let Err(e) = resource.close() {
            crate::klog!("kernel: close of rid {rid} failed: {e}");
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when nothing beyond the reserved stdio rids is live
    pub fn only_stdio(&self) -> bool {
        self.entries.keys().all(|rid| *rid <= STDERR_RID)
    }

    /// Device paths of the stdio entries, for children to inherit
    pub fn stdio_paths(&self) -> [String; 3] {
        [STDIN_RID, STDOUT_RID, STDERR_RID].map(|rid| match self.entries.get(&rid) {
            Some(Resource::File(f)) => f.path.clone(),
            _ => TTY_PATH.to_string(),
        })
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::new()
    }
}

fn bad_rid(rid: u32) -> ApiError {
    ApiError::invalid_input(format!("no resource with rid {rid}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::error::ErrorKind;
    use crate::vfs::service::FsService;
    use crate::vfs::{MemoryFs, VirtualFileSystem};

    fn connection() -> FsConnection {
        FsService::new(VirtualFileSystem::new(Box::new(MemoryFs::new()))).connect()
    }

    #[test]
    fn test_rids_are_unique_and_monotonic() {
        let mut table = ResourceTable::new();
        let a = table.add(Resource::TextDecoder(TextDecoderResource::new()));
        let b = table.add(Resource::TextDecoder(TextDecoderResource::new()));
        assert_eq!(a, 3, "first user rid after reserved stdio");
        assert_eq!(b, 4);

        table.close(a).unwrap();
        // Closed rids are not recycled
        let c = table.add(Resource::TextDecoder(TextDecoderResource::new()));
        assert_eq!(c, 5);
    }

    #[test]
    fn test_close_removes_entry() {
        let mut table = ResourceTable::new();
        let rid = table.add(Resource::Child(ChildProcessResource { pid: 9 }));
        assert!(table.get(rid).is_some());

        table.close(rid).unwrap();
        assert!(table.get(rid).is_none());
        assert_eq!(
            table.close(rid).unwrap_err().kind,
            ErrorKind::InvalidInput
        );
    }

    #[test]
    fn test_try_close_swallows_resource_failure() {
        let conn = connection();
        let mut table = ResourceTable::new();
        // A file resource whose backend handle is already gone
        let rid = table.add(Resource::File(FileResource {
            path: "/phantom".to_string(),
            handle: 42,
            conn,
        }));
        assert!(table.try_close(rid).is_ok());
        assert!(table.get(rid).is_none());

        // Missing rid is still an error
        assert!(table.try_close(999).is_err());
    }

    #[test]
    fn test_stdio_installation() {
        let svc = FsService::new(VirtualFileSystem::new(Box::new(MemoryFs::new())));
        svc.with_vfs(|vfs| {
            vfs.create_dir("/dev").unwrap();
            let (dev, _tty) = crate::vfs::DevFs::new();
            vfs.mount("/dev", Box::new(dev)).unwrap();
        });
        let conn = svc.connect();

        let mut table = ResourceTable::new();
        table
            .install_stdio(&conn, &std::array::from_fn(|_| TTY_PATH.to_string()))
            .unwrap();

        assert_eq!(table.len(), 3);
        assert!(table.only_stdio());
        assert_eq!(table.stdio_paths(), std::array::from_fn(|_| TTY_PATH.to_string()));

        table.add(Resource::TextDecoder(TextDecoderResource::new()));
        assert!(!table.only_stdio());
    }

    #[test]
    fn test_pipe_resource_close_is_refcounted() {
        let pipe = InMemoryPipe::new();
        pipe.add_ref();
        let mut table = ResourceTable::new();
        let read_end = table.add(Resource::Pipe(PipeResource { pipe: pipe.clone() }));
        let write_end = table.add(Resource::Pipe(PipeResource { pipe: pipe.clone() }));

        table.close(write_end).unwrap();
        assert!(!pipe.is_closed(), "read end still holds a reference");
        table.close(read_end).unwrap();
        assert!(pipe.is_closed());
    }

    #[test]
    fn test_decoder_carries_partial_sequences() {
        let mut decoder = TextDecoderResource::new();
        let bytes = "héllo".as_bytes();
        // Split inside the two-byte é sequence
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(second, "éllo");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = TextDecoderResource::new();
        let out = decoder.decode(&[b'a', 0xFF, b'b']);
        assert_eq!(out, "a\u{FFFD}b");
    }

    #[test]
    fn test_read_from_child_is_an_error() {
        let mut resource = Resource::Child(ChildProcessResource { pid: 1 });
        assert_eq!(
            resource.read_sync(4).unwrap_err().kind,
            ErrorKind::InvalidInput
        );
        assert_eq!(
            resource.write_sync(b"x").unwrap_err().kind,
            ErrorKind::InvalidInput
        );
    }
}
