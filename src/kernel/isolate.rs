//! Isolate attachment
//!
//! Bridges a guest's op-calling convention - numeric op codes plus
//! caller-supplied promise ids - to the process dispatcher. The op-name
//! index is fetched once at attach time through the `ops_sync` handshake;
//! async completions are delivered out-of-order through a promise map,
//! each correlation id exactly once.

use super::error::{ApiError, ErrorKind, WireError};
use super::process::Process;
use futures::channel::oneshot;
use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

pub struct Isolate {
    process: Rc<Process>,
    spawner: LocalSpawner,
    /// Cached `name -> index` table, filled by the one-time handshake
    ops: RefCell<HashMap<String, u32>>,
    promises: RefCell<HashMap<u64, oneshot::Receiver<Result<Value, WireError>>>>,
    next_promise: Cell<u64>,
}

impl Isolate {
    pub fn attach(process: Rc<Process>, spawner: LocalSpawner) -> Rc<Self> {
        Rc::new(Self {
            process,
            spawner,
            ops: RefCell::new(HashMap::new()),
            promises: RefCell::new(HashMap::new()),
            next_promise: Cell::new(1),
        })
    }

    pub fn process(&self) -> &Rc<Process> {
        &self.process
    }

    /// One-time index handshake through the dispatcher itself. Index 0
    /// is always `ops_sync`, so no prior knowledge is needed.
    fn ensure_handshake(&self) {
        if !self.ops.borrow().is_empty() {
            return;
        }
        match self.process.op_sync(0, Value::Null, Value::Null) {
            Ok(Value::Array(entries)) => {
                let mut ops = self.ops.borrow_mut();
                for entry in entries {
                    if let Ok((name, index)) = serde_json::from_value::<(String, u32)>(entry) {
                        ops.insert(name, index);
                    }
                }
            }
            other => crate::klog!("kernel: ops_sync handshake failed: {other:?}"),
        }
        self.process.sweep_epoch();
    }

    pub fn op_code(&self, name: &str) -> Option<u32> {
        self.ensure_handshake();
        self.ops.borrow().get(name).copied()
    }

    /// Synchronous op call by code
    pub fn op_sync(&self, code: u32, a: Value, b: Value) -> Result<Value, WireError> {
        let result = self.process.op_sync(code, a, b);
        self.process.sweep_epoch();
        result
    }

    /// Synchronous op call by name, resolving through the cached index
    pub fn sync(&self, name: &str, a: Value, b: Value) -> Result<Value, WireError> {
        let code = self
            .op_code(name)
            .ok_or_else(|| WireError::from(&ApiError::not_found(format!("no such op: {name}"))))?;
        self.op_sync(code, a, b)
    }

    /// Begin an asynchronous op call under the caller's correlation id.
    /// The result arrives through [`resolve`](Self::resolve).
    pub fn op_async(&self, code: u32, a: Value, b: Value, promise_id: u64) {
        let (tx, rx) = oneshot::channel();
        if self.promises.borrow_mut().insert(promise_id, rx).is_some() {
            crate::klog!("kernel: promise id {promise_id} reused while pending");
        }
        let fut = self.process.op_async(code, a, b, promise_id);
        let process = self.process.clone();
        let task = async move {
            let result = fut.await;
            // Deliver first; the tracking entry retires on the next sweep
            // so completions queued in the same tick stay visible
            let _ = tx.send(result);
            process.sweep_epoch();
        };
        if self.spawner.spawn_local(task).is_err() {
            crate::klog!("kernel: executor is gone, op {code} dropped");
        }
    }

    /// Await the completion of an async op. Each promise id is delivered
    /// exactly once; asking again is an error.
    pub async fn resolve(&self, promise_id: u64) -> Result<Value, WireError> {
        let rx = self.promises.borrow_mut().remove(&promise_id).ok_or_else(|| {
            WireError::from(&ApiError::invalid_input(format!(
                "no pending promise {promise_id}"
            )))
        })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(WireError::from(&ApiError::new(
                ErrorKind::Interrupted,
                "op canceled: context torn down",
            ))),
        }
    }

    /// Fresh correlation id for callers that don't track their own
    pub fn next_promise_id(&self) -> u64 {
        let id = self.next_promise.get();
        self.next_promise.set(id + 1);
        id
    }

    /// Async op call by name: dispatch and await in one step
    pub async fn invoke(&self, name: &str, a: Value, b: Value) -> Result<Value, WireError> {
        let code = self
            .op_code(name)
            .ok_or_else(|| WireError::from(&ApiError::not_found(format!("no such op: {name}"))))?;
        let promise_id = self.next_promise_id();
        self.op_async(code, a, b, promise_id);
        self.resolve(promise_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::manager::ProcessManager;
    use crate::kernel::program::ProgramRegistry;
    use futures::executor::LocalPool;
    use serde_json::json;
    use std::sync::Arc;

    fn attach() -> (ProcessManager, LocalPool, Rc<Isolate>) {
        let registry = Arc::new(ProgramRegistry::new());
        let (manager, _tty) = ProcessManager::with_standard_fs(registry);
        let pool = LocalPool::new();
        let (_process, isolate) = manager.main_process(&pool.spawner()).unwrap();
        (manager, pool, isolate)
    }

    #[test]
    fn test_handshake_caches_the_index() {
        let (_manager, _pool, isolate) = attach();
        assert_eq!(isolate.op_code("ops_sync"), Some(0));
        assert!(isolate.op_code("op_open").is_some());
        assert!(isolate.op_code("op_format_disk").is_none());
    }

    #[test]
    fn test_sync_by_name() {
        let (_manager, _pool, isolate) = attach();
        let value = isolate.sync("op_pid", Value::Null, Value::Null).unwrap();
        assert_eq!(value["pid"], json!(0));
    }

    #[test]
    fn test_async_completions_resolve_out_of_order() {
        let (_manager, mut pool, isolate) = attach();

        isolate
            .sync(
                "op_write_file",
                json!({ "path": "/a.txt" }),
                serde_json::to_value(b"first".to_vec()).unwrap(),
            )
            .unwrap();

        let read = isolate.op_code("op_read_file").unwrap();
        isolate.op_async(read, json!({ "path": "/a.txt" }), Value::Null, 10);
        isolate.op_async(read, json!({ "path": "/a.txt" }), Value::Null, 11);

        // Await the second promise before the first
        let isolate2 = isolate.clone();
        let (b, a) = pool.run_until(async move {
            let b = isolate2.resolve(11).await.unwrap();
            let a = isolate2.resolve(10).await.unwrap();
            (b, a)
        });
        assert_eq!(serde_json::from_value::<Vec<u8>>(a).unwrap(), b"first");
        assert_eq!(serde_json::from_value::<Vec<u8>>(b).unwrap(), b"first");
    }

    #[test]
    fn test_promise_delivered_exactly_once() {
        let (_manager, mut pool, isolate) = attach();

        let pid_op = isolate.op_code("op_read_file").unwrap();
        isolate
            .sync(
                "op_write_file",
                json!({ "path": "/b.txt" }),
                serde_json::to_value(b"x".to_vec()).unwrap(),
            )
            .unwrap();
        isolate.op_async(pid_op, json!({ "path": "/b.txt" }), Value::Null, 42);

        let isolate2 = isolate.clone();
        pool.run_until(async move {
            isolate2.resolve(42).await.unwrap();
            let err = isolate2.resolve(42).await.unwrap_err();
            assert_eq!(err.code, "EINVAL");
        });
    }

    #[test]
    fn test_unknown_name_is_wire_shaped() {
        let (_manager, _pool, isolate) = attach();
        let err = isolate
            .sync("op_bogus", Value::Null, Value::Null)
            .unwrap_err();
        assert_eq!(err.code, "ENOENT");
    }
}
