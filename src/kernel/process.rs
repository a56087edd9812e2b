//! Process abstraction and op dispatch
//!
//! A process is one OS-process-like unit: pid, working directory,
//! environment, an exclusively-owned resource table, a filesystem
//! connection, and the op table guests call into. The dispatcher tracks
//! every in-flight op under a synthetic key - a decrementing counter for
//! sync calls, the caller's correlation id for async calls - so the
//! kernel can tell "idle and safe to reap" from "merely has open
//! handles". Completions retire in batches: each completed call queues
//! its key, an epoch sweep removes the batch and runs the
//! should-it-exit check once per epoch.

use super::error::{ApiError, WireError};
use super::events::{EventSender, LifecycleEvent};
use super::isolate::Isolate;
use super::manager::ManagerConnection;
use super::ops::{Op, OpCode, op_table};
use super::program::ProgramRegistry;
use super::resource::ResourceTable;
use crate::vfs::service::FsConnection;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde_json::Value;
use std::cell::{Cell, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Lifecycle states. Idle/Busy oscillation is tracked by the in-flight
/// counter, not a literal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Initialized,
    Running,
    ExitPending,
    Exited,
}

/// One kernel-managed unit of execution
pub struct Process {
    pid: u32,
    parent: Option<u32>,
    state: Cell<ProcessState>,
    cwd: RefCell<String>,
    env: RefCell<HashMap<String, String>>,
    resources: RefCell<ResourceTable>,
    fs: FsConnection,
    manager: ManagerConnection,
    ops: Vec<Op>,
    /// Keys of calls currently executing
    in_flight: RefCell<HashSet<i64>>,
    /// Completed keys awaiting the next epoch sweep
    retired: RefCell<Vec<i64>>,
    /// Tracking keys for sync calls; async calls use the caller's
    /// correlation id (non-negative), so these never collide
    next_sync_key: Cell<i64>,
    epoch: Cell<u64>,
    exit_code: Cell<Option<i32>>,
    pending_code: Cell<Option<i32>>,
    exit_wait: Cell<bool>,
    might_exit_sent: Cell<bool>,
    exit_waker: RefCell<Option<Waker>>,
    events: EventSender,
}

impl Process {
    pub fn new(
        pid: u32,
        parent: Option<u32>,
        cwd: String,
        env: HashMap<String, String>,
        fs: FsConnection,
        manager: ManagerConnection,
        events: EventSender,
    ) -> Rc<Self> {
        Rc::new(Self {
            pid,
            parent,
            state: Cell::new(ProcessState::Created),
            cwd: RefCell::new(cwd),
            env: RefCell::new(env),
            resources: RefCell::new(ResourceTable::new()),
            fs,
            manager,
            ops: op_table(),
            in_flight: RefCell::new(HashSet::new()),
            retired: RefCell::new(Vec::new()),
            next_sync_key: Cell::new(-1),
            epoch: Cell::new(0),
            exit_code: Cell::new(None),
            pending_code: Cell::new(None),
            exit_wait: Cell::new(false),
            might_exit_sent: Cell::new(false),
            exit_waker: RefCell::new(None),
            events,
        })
    }

    /// Open the reserved stdio rids against their device paths
    pub fn init(&self, stdio: &[String; 3]) -> Result<(), ApiError> {
        self.resources.borrow_mut().install_stdio(&self.fs, stdio)?;
        self.state.set(ProcessState::Initialized);
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn parent(&self) -> Option<u32> {
        self.parent
    }

    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    pub fn cwd(&self) -> String {
        self.cwd.borrow().clone()
    }

    pub fn set_cwd(&self, path: String) {
        *self.cwd.borrow_mut() = path;
    }

    pub fn env(&self) -> HashMap<String, String> {
        self.env.borrow().clone()
    }

    pub fn env_get(&self, name: &str) -> Option<String> {
        self.env.borrow().get(name).cloned()
    }

    pub fn env_set(&self, name: &str, value: &str) {
        self.env
            .borrow_mut()
            .insert(name.to_string(), value.to_string());
    }

    pub fn env_delete(&self, name: &str) -> bool {
        self.env.borrow_mut().remove(name).is_some()
    }

    pub fn resources_mut(&self) -> RefMut<'_, ResourceTable> {
        self.resources.borrow_mut()
    }

    pub fn fs(&self) -> &FsConnection {
        &self.fs
    }

    pub fn manager(&self) -> &ManagerConnection {
        &self.manager
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Advisory exit code, recorded by `op_exit`
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.set(Some(code));
    }

    pub fn in_flight_ops(&self) -> usize {
        self.in_flight.borrow().len()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.events.send(event);
    }

    fn begin_op(&self, key: i64) {
        if !self.in_flight.borrow_mut().insert(key) {
            crate::klog!("kernel: pid {}: duplicate op tracking key {key}", self.pid);
        }
        self.emit(LifecycleEvent::Alive { pid: self.pid });
    }

    fn finish_op(&self, key: i64) {
        self.retired.borrow_mut().push(key);
        if self.exit_wait.get()
            && let Some(waker) = self.exit_waker.borrow_mut().take()
        {
            waker.wake();
        }
    }

    /// Retire the completed batch and run the exit check once
    pub fn sweep_epoch(&self) {
        let batch: Vec<i64> = self.retired.borrow_mut().drain(..).collect();
        if !batch.is_empty() {
            self.epoch.set(self.epoch.get() + 1);
            let mut in_flight = self.in_flight.borrow_mut();
            for key in batch {
                in_flight.remove(&key);
            }
        }
        if self.exit_wait.get() && !self.might_exit_sent.get() && self.is_quiescent() {
            self.might_exit_sent.set(true);
            self.emit(LifecycleEvent::MightExit {
                pid: self.pid,
                code: self.pending_code.get().unwrap_or(0),
            });
            if let Some(waker) = self.exit_waker.borrow_mut().take() {
                waker.wake();
            }
        }
    }

    /// No pending ops and nothing live beyond the reserved stdio rids
    fn is_quiescent(&self) -> bool {
        self.in_flight.borrow().is_empty() && self.resources.borrow().only_stdio()
    }

    fn translate(&self, op: OpCode, result: Result<Value, ApiError>) -> Result<Value, WireError> {
        match result {
            // Exit must never itself fail
            Err(_) if op == OpCode::Exit => Ok(Value::Null),
            other => other.map_err(|e| WireError::from(&e)),
        }
    }

    /// Dispatch a synchronous op call. Domain errors are translated to
    /// the structured wire shape at this boundary; a thrown value would
    /// not survive serialization.
    pub fn op_sync(self: &Rc<Self>, code: u32, a: Value, b: Value) -> Result<Value, WireError> {
        let Some(op) = OpCode::from_index(code) else {
            return Err(WireError::from(&ApiError::op_not_found(code)));
        };
        let entry = &self.ops[code as usize];
        let Some(f) = entry.sync else {
            return Err(WireError::from(&ApiError::op_mode_unsupported(
                entry.name, "sync",
            )));
        };
        let key = self.next_sync_key.get();
        self.next_sync_key.set(key - 1);
        self.begin_op(key);
        let result = f(self, a, b);
        self.finish_op(key);
        self.translate(op, result)
    }

    /// Dispatch an asynchronous op call under the caller's correlation
    /// id. The call is recorded in-flight before execution begins.
    pub fn op_async(
        self: &Rc<Self>,
        code: u32,
        a: Value,
        b: Value,
        promise_id: u64,
    ) -> LocalBoxFuture<'static, Result<Value, WireError>> {
        let Some(op) = OpCode::from_index(code) else {
            let err = WireError::from(&ApiError::op_not_found(code));
            return async move { Err(err) }.boxed_local();
        };
        let entry = &self.ops[code as usize];
        let Some(f) = entry.r#async else {
            let err = WireError::from(&ApiError::op_mode_unsupported(entry.name, "async"));
            return async move { Err(err) }.boxed_local();
        };
        let key = promise_id as i64;
        self.begin_op(key);
        let process = self.clone();
        async move {
            let result = f(process.clone(), a, b).await;
            process.finish_op(key);
            process.translate(op, result)
        }
        .boxed_local()
    }

    /// Import and evaluate the entry program, then wait out in-flight
    /// ops before tearing down.
    pub async fn run(
        self: Rc<Self>,
        registry: &ProgramRegistry,
        isolate: Rc<Isolate>,
        argv: Vec<String>,
    ) -> i32 {
        self.state.set(ProcessState::Running);
        self.emit(LifecycleEvent::Start { pid: self.pid });

        let entry = argv.first().map(String::as_str).unwrap_or_default();
        let main = match registry.resolve(entry) {
            Ok(main) => main,
            Err(e) => {
                // A missing program at import time looks like a transient
                // load race; exit is suppressed rather than reported.
                if e.message.contains("program not reachable") {
                    crate::klog!("kernel: pid {}: suppressing exit: {e}", self.pid);
                    self.state.set(ProcessState::Exited);
                    return -1;
                }
                return self.finish(-1).await;
            }
        };
        let code = main(isolate, argv).await;
        self.finish(code).await
    }

    async fn finish(self: &Rc<Self>, code: i32) -> i32 {
        let code = self.exit_code.get().unwrap_or(code);
        self.pending_code.set(Some(code));
        self.state.set(ProcessState::ExitPending);
        self.exit_wait.set(true);
        ExitWait {
            process: self.clone(),
        }
        .await;
        self.state.set(ProcessState::Exited);
        self.emit(LifecycleEvent::Exit {
            pid: self.pid,
            code,
        });
        // Blocking round-trip so the manager reaps its entry even when
        // this process lives in another execution context
        if let Err(e) = self.manager.report_exit(self.pid, code) {
            crate::klog!("kernel: pid {}: exit report failed: {e}", self.pid);
        }
        code
    }
}

/// Blocks final teardown until the process is quiescent
struct ExitWait {
    process: Rc<Process>,
}

impl Future for ExitWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let p = &self.process;
        p.sweep_epoch();
        if p.is_quiescent() {
            Poll::Ready(())
        } else {
            *p.exit_waker.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}
