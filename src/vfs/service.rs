//! Filesystem service and the sync bridge
//!
//! The whole [`VirtualFileSystem`] is owned by the service; every
//! execution context gets a fresh connection (its own channel and
//! servicing thread) so cross-context filesystem calls don't serialize
//! through one bottleneck. Requests are JSON `[opName, serializedArgs]`
//! against a path-namespaced endpoint (`/~fs`, `/~file`); responses are
//! `[errorOrNull, serializedResult]`.
//!
//! The blocking path implements synchronous semantics as a genuine
//! blocking channel receive: the calling thread parks on the reply while
//! the service thread does the work. Only `*Sync`-suffixed names are
//! permitted there; anything else fails fast, because a blocked caller
//! has no way to wait on an open-ended operation without deadlocking
//! itself.

use super::{OpenOptions, SeekWhence, VirtualFileSystem};
use crate::kernel::error::{ApiError, ErrorKind, WireError};
use futures::channel::oneshot;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

/// Endpoint for path-addressed operations
pub const FS_ENDPOINT: &str = "/~fs";
/// Endpoint for open-handle operations
pub const FILE_ENDPOINT: &str = "/~file";

/// Reply slot for a request. The blocking path parks the calling thread
/// on a plain channel receive; the async path resolves a oneshot so the
/// caller's executor can keep running.
enum Reply {
    Blocking(mpsc::Sender<String>),
    Async(oneshot::Sender<String>),
}

impl Reply {
    fn send(self, text: String) {
        match self {
            Reply::Blocking(tx) => {
                let _ = tx.send(text);
            }
            Reply::Async(tx) => {
                let _ = tx.send(text);
            }
        }
    }
}

struct FsRequest {
    endpoint: String,
    body: String,
    reply: Reply,
}

/// Owner of the filesystem tree
#[derive(Clone)]
pub struct FsService {
    vfs: Arc<Mutex<VirtualFileSystem>>,
}

impl FsService {
    pub fn new(vfs: VirtualFileSystem) -> Self {
        Self {
            vfs: Arc::new(Mutex::new(vfs)),
        }
    }

    /// Open a fresh connection: a dedicated channel plus servicing thread
    pub fn connect(&self) -> FsConnection {
        let (tx, rx) = mpsc::channel::<FsRequest>();
        let vfs = self.vfs.clone();
        thread::Builder::new()
            .name("fs-service".to_string())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    let response = serve(&vfs, &req.endpoint, &req.body);
                    let _ = req.reply.send(response);
                }
            })
            .expect("spawn fs service thread");
        FsConnection { tx }
    }

    /// Direct access from the owning context. Mount-table mutation goes
    /// through here; other contexts see mounts only via their connection.
    pub fn with_vfs<R>(&self, f: impl FnOnce(&mut VirtualFileSystem) -> R) -> R {
        f(&mut self.vfs.lock().expect("vfs lock poisoned"))
    }
}

/// One context's channel to the filesystem service
#[derive(Clone)]
pub struct FsConnection {
    tx: mpsc::Sender<FsRequest>,
}

impl FsConnection {
    fn send(&self, endpoint: &str, name: &str, args: Value, reply: Reply) {
        let body = json!([name, args]).to_string();
        let _ = self.tx.send(FsRequest {
            endpoint: endpoint.to_string(),
            body,
            reply,
        });
    }

    /// Blocking round-trip: the calling thread parks until the service
    /// replies, stalling this context's event loop for the duration.
    /// Only `*Sync` names cross this path.
    pub fn call(&self, endpoint: &str, name: &str, args: Value) -> Result<Value, ApiError> {
        if !name.ends_with("Sync") {
            return Err(ApiError::unsupported_over_sync_bridge(name));
        }
        let (tx, rx) = mpsc::channel();
        self.send(endpoint, name, args, Reply::Blocking(tx));
        let text = rx
            .recv()
            .map_err(|_| ApiError::new(ErrorKind::ConnectionAborted, "filesystem service is gone"))?;
        decode_response(&text)
    }

    /// Asynchronous round-trip for op implementations
    pub fn request(
        &self,
        endpoint: &str,
        name: &str,
        args: Value,
    ) -> impl Future<Output = Result<Value, ApiError>> + 'static {
        let (tx, rx) = oneshot::channel();
        self.send(endpoint, name, args, Reply::Async(tx));
        async move {
            let text = rx.await.map_err(|_| {
                ApiError::new(ErrorKind::ConnectionAborted, "filesystem service is gone")
            })?;
            decode_response(&text)
        }
    }

    /// Open a file, blocking; used when wiring up stdio
    pub fn open_sync(&self, path: &str, options: OpenOptions) -> Result<u64, ApiError> {
        let value = self.call(FS_ENDPOINT, "openSync", json!([path, options]))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn close_sync(&self, handle: u64) -> Result<(), ApiError> {
        self.call(FILE_ENDPOINT, "closeSync", json!([handle]))?;
        Ok(())
    }
}

pub(crate) fn decode_response(text: &str) -> Result<Value, ApiError> {
    let (error, result): (Option<WireError>, Value) = serde_json::from_str(text)?;
    match error {
        Some(wire) => Err(ApiError::from(wire)),
        None => Ok(result),
    }
}

pub(crate) fn encode_response(result: Result<Value, ApiError>) -> String {
    match result {
        Ok(value) => json!([Value::Null, value]).to_string(),
        Err(e) => json!([WireError::from(&e), Value::Null]).to_string(),
    }
}

fn serve(vfs: &Arc<Mutex<VirtualFileSystem>>, endpoint: &str, body: &str) -> String {
    encode_response(dispatch(vfs, endpoint, body))
}

fn dispatch(
    vfs: &Arc<Mutex<VirtualFileSystem>>,
    endpoint: &str,
    body: &str,
) -> Result<Value, ApiError> {
    let (name, args): (String, Value) = serde_json::from_str(body)?;
    let mut vfs = vfs.lock().expect("vfs lock poisoned");
    match (endpoint, name.as_str()) {
        ("/~fs", "openSync") => {
            let (path, options): (String, OpenOptions) = serde_json::from_value(args)?;
            let handle = vfs.open(&path, options)?;
            Ok(json!(handle as u64))
        }
        ("/~fs", "statSync") => {
            let (path,): (String,) = serde_json::from_value(args)?;
            Ok(serde_json::to_value(vfs.metadata(&path)?)?)
        }
        ("/~fs", "mkdirSync") => {
            let (path,): (String,) = serde_json::from_value(args)?;
            vfs.create_dir(&path)?;
            Ok(Value::Null)
        }
        ("/~fs", "readdirSync") => {
            let (path,): (String,) = serde_json::from_value(args)?;
            Ok(serde_json::to_value(vfs.read_dir(&path)?)?)
        }
        ("/~fs", "removeSync") => {
            let (path,): (String,) = serde_json::from_value(args)?;
            vfs.remove(&path)?;
            Ok(Value::Null)
        }
        ("/~fs", "renameSync") => {
            let (from, to): (String, String) = serde_json::from_value(args)?;
            vfs.rename(&from, &to)?;
            Ok(Value::Null)
        }
        ("/~fs", "realpathSync") => {
            let (path,): (String,) = serde_json::from_value(args)?;
            Ok(json!(vfs.realpath(&path)?))
        }
        ("/~fs", "readFileSync") => {
            let (path,): (String,) = serde_json::from_value(args)?;
            Ok(serde_json::to_value(vfs.read_file(&path)?)?)
        }
        ("/~fs", "writeFileSync") => {
            let (path, data): (String, Vec<u8>) = serde_json::from_value(args)?;
            vfs.write_file(&path, &data)?;
            Ok(Value::Null)
        }
        ("/~fs", "existsSync") => {
            let (path,): (String,) = serde_json::from_value(args)?;
            Ok(json!(vfs.exists(&path)))
        }
        ("/~file", "readSync") => {
            let (handle, len): (u64, usize) = serde_json::from_value(args)?;
            let mut buf = vec![0u8; len];
            let n = vfs.read(handle as usize, &mut buf)?;
            buf.truncate(n);
            Ok(serde_json::to_value(buf)?)
        }
        ("/~file", "writeSync") => {
            let (handle, data): (u64, Vec<u8>) = serde_json::from_value(args)?;
            let n = vfs.write(handle as usize, &data)?;
            Ok(json!(n))
        }
        ("/~file", "seekSync") => {
            let (handle, whence, offset): (u64, SeekWhence, i64) = serde_json::from_value(args)?;
            Ok(json!(vfs.seek(handle as usize, whence, offset)?))
        }
        ("/~file", "closeSync") => {
            let (handle,): (u64,) = serde_json::from_value(args)?;
            vfs.close(handle as usize)?;
            Ok(Value::Null)
        }
        ("/~file", "fstatSync") => {
            let (handle,): (u64,) = serde_json::from_value(args)?;
            Ok(serde_json::to_value(vfs.fstat(handle as usize)?)?)
        }
        _ => Err(ApiError::not_found(format!(
            "no handler for {endpoint}/{name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::MemoryFs;
    use futures::executor::block_on;

    fn service() -> FsService {
        FsService::new(VirtualFileSystem::new(Box::new(MemoryFs::new())))
    }

    #[test]
    fn test_round_trip_over_the_wire() {
        let svc = service();
        let conn = svc.connect();

        conn.call(
            FS_ENDPOINT,
            "writeFileSync",
            json!(["/a.txt", b"hello".to_vec()]),
        )
        .unwrap();
        let value = conn
            .call(FS_ENDPOINT, "readFileSync", json!(["/a.txt"]))
            .unwrap();
        let data: Vec<u8> = serde_json::from_value(value).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn test_stat_missing_file_returns_structured_error() {
        let svc = service();
        let conn = svc.connect();

        let err = conn
            .call(FS_ENDPOINT, "statSync", json!(["/a.txt"]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        // The wire shape carries the POSIX-style code
        assert_eq!(err.kind.code(), "ENOENT");
    }

    #[test]
    fn test_non_sync_names_fail_fast() {
        let svc = service();
        let conn = svc.connect();

        let err = conn.call(FS_ENDPOINT, "watch", json!([])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unsupported);
        assert!(err.message.contains("sync bridge"));
    }

    #[test]
    fn test_unknown_handler() {
        let svc = service();
        let conn = svc.connect();
        let err = conn
            .call(FS_ENDPOINT, "formatDiskSync", json!([]))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_async_request_path() {
        let svc = service();
        let conn = svc.connect();

        block_on(async {
            conn.request(
                FS_ENDPOINT,
                "writeFileSync",
                json!(["/b.txt", b"async".to_vec()]),
            )
            .await
            .unwrap();
            let value = conn
                .request(FS_ENDPOINT, "readFileSync", json!(["/b.txt"]))
                .await
                .unwrap();
            let data: Vec<u8> = serde_json::from_value(value).unwrap();
            assert_eq!(data, b"async");
        });
    }

    #[test]
    fn test_handle_ops_over_the_wire() {
        let svc = service();
        let conn = svc.connect();

        let handle = conn
            .open_sync("/c.txt", OpenOptions::new().write(true).create(true))
            .unwrap();
        let n = conn
            .call(FILE_ENDPOINT, "writeSync", json!([handle, b"abcdef".to_vec()]))
            .unwrap();
        assert_eq!(n, json!(6));

        conn.call(FILE_ENDPOINT, "seekSync", json!([handle, "start", 2]))
            .unwrap();
        // Reopened for write only; a second read-mode handle sees the data
        conn.close_sync(handle).unwrap();

        let handle = conn.open_sync("/c.txt", OpenOptions::new()).unwrap();
        let value = conn
            .call(FILE_ENDPOINT, "readSync", json!([handle, 16]))
            .unwrap();
        let data: Vec<u8> = serde_json::from_value(value).unwrap();
        assert_eq!(data, b"abcdef");
        conn.close_sync(handle).unwrap();
    }

    #[test]
    fn test_connections_are_independent() {
        let svc = service();
        let a = svc.connect();
        let b = svc.connect();

        a.call(
            FS_ENDPOINT,
            "writeFileSync",
            json!(["/shared.txt", b"one".to_vec()]),
        )
        .unwrap();
        // The other connection sees the same tree
        let value = b
            .call(FS_ENDPOINT, "readFileSync", json!(["/shared.txt"]))
            .unwrap();
        let data: Vec<u8> = serde_json::from_value(value).unwrap();
        assert_eq!(data, b"one");
    }
}
