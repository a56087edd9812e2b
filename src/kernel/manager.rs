//! Process manager and spawn machinery
//!
//! Issues pids from its own monotonic counter, owns the main (pid 0)
//! process's table entry, and boots children into fresh execution
//! contexts: a new thread driving its own single-threaded executor, a
//! fresh filesystem connection so cross-context calls don't serialize
//! through one bottleneck, and a channel back to the manager for the
//! exit-report and wait bridge (`/~proc`, same wire shape as the
//! filesystem endpoints).
//!
//! `spawn` resolves after the child's init-and-run handshake;
//! `spawn_sync` hands back the pid immediately while the boot proceeds
//! in the background, so a boot failure is only observable through a
//! later process-table lookup.

use super::error::{ApiError, ErrorKind, WireError};
use super::events::{EventHub, EventSender};
use super::isolate::Isolate;
use super::process::Process;
use super::program::ProgramRegistry;
use super::resource::TTY_PATH;
use crate::vfs::service::{FsService, decode_response, encode_response};
use crate::vfs::{DevFs, MemoryFs, TtyHandle, VirtualFileSystem};
use futures::channel::oneshot;
use futures::executor::{LocalPool, LocalSpawner};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

/// Endpoint for manager-bridge operations
pub const PROC_ENDPOINT: &str = "/~proc";

/// How to start a child process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnOptions {
    /// `cmd[0]` is the program path, the rest its arguments
    pub cmd: Vec<String>,
    /// Defaults to the spawner's working directory
    #[serde(default)]
    pub cwd: Option<String>,
    /// Defaults to the spawner's environment
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
    /// Device paths for rids 0/1/2; defaults to the spawner's stdio
    #[serde(default)]
    pub stdio: Option<[String; 3]>,
}

impl SpawnOptions {
    pub fn new(cmd: &[&str]) -> Self {
        Self {
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: None,
            stdio: None,
        }
    }
}

/// Where a table entry is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "code", rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Exited(i32),
}

struct ProcEntry {
    parent: u32,
    cmd: String,
    status: ProcessStatus,
    waiters: Vec<oneshot::Sender<Result<i32, WireError>>>,
}

struct ManagerShared {
    next_pid: AtomicU32,
    table: Mutex<HashMap<u32, ProcEntry>>,
    events: EventSender,
    fs: FsService,
    registry: Arc<ProgramRegistry>,
}

impl ManagerShared {
    fn alloc_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::Relaxed)
    }

    fn mark_exited(&self, pid: u32, code: i32) {
        let mut table = self.table.lock().expect("process table lock poisoned");
        if let Some(entry) = table.get_mut(&pid) {
            entry.status = ProcessStatus::Exited(code);
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(Ok(code));
            }
        } else {
            crate::klog!("kernel: exit report for unknown pid {pid}");
        }
    }

    fn register_waiter(&self, pid: u32, reply: oneshot::Sender<Result<i32, WireError>>) {
        let mut table = self.table.lock().expect("process table lock poisoned");
        match table.get_mut(&pid) {
            Some(entry) => match entry.status {
                ProcessStatus::Exited(code) => {
                    let _ = reply.send(Ok(code));
                }
                ProcessStatus::Running => entry.waiters.push(reply),
            },
            None => {
                let err = ApiError::not_found(format!("no process with pid {pid}"));
                let _ = reply.send(Err(WireError::from(&err)));
            }
        }
    }

    fn status(&self, pid: u32) -> Option<ProcessStatus> {
        self.table
            .lock()
            .expect("process table lock poisoned")
            .get(&pid)
            .map(|e| e.status)
    }

    fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self
            .table
            .lock()
            .expect("process table lock poisoned")
            .keys()
            .copied()
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Allocate a pid and boot the child in its own execution context.
    /// The handshake, when present, fires once the child has initialized
    /// and is about to evaluate its entry program.
    fn spawn_child(
        self: &Arc<Self>,
        opts: SpawnOptions,
        parent: u32,
        handshake: Option<oneshot::Sender<Result<u32, WireError>>>,
    ) -> u32 {
        let pid = self.alloc_pid();
        self.table
            .lock()
            .expect("process table lock poisoned")
            .insert(
                pid,
                ProcEntry {
                    parent,
                    cmd: opts.cmd.join(" "),
                    status: ProcessStatus::Running,
                    waiters: Vec::new(),
                },
            );
        let shared = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("proc-{pid}"))
            .spawn(move || boot_child(shared, opts, pid, parent, handshake));
        if let Err(e) = spawned {
            crate::klog!("kernel: could not create context for pid {pid}: {e}");
            self.mark_exited(pid, -1);
        }
        pid
    }
}

fn boot_child(
    shared: Arc<ManagerShared>,
    opts: SpawnOptions,
    pid: u32,
    parent: u32,
    handshake: Option<oneshot::Sender<Result<u32, WireError>>>,
) {
    let mut pool = LocalPool::new();
    let fs = shared.fs.connect();
    let manager = connect(&shared);
    let cwd = opts.cwd.clone().unwrap_or_else(|| "/".to_string());
    let env = opts.env.clone().unwrap_or_default();
    let process = Process::new(
        pid,
        Some(parent),
        cwd,
        env,
        fs,
        manager,
        shared.events.clone(),
    );
    let stdio = opts.stdio.clone().unwrap_or_else(default_stdio);
    if let Err(e) = process.init(&stdio) {
        crate::klog!("kernel: pid {pid} failed to boot: {e}");
        shared.mark_exited(pid, -1);
        if let Some(h) = handshake {
            let _ = h.send(Err(WireError::from(&e)));
        }
        return;
    }
    let isolate = Isolate::attach(process.clone(), pool.spawner());
    if let Some(h) = handshake {
        let _ = h.send(Ok(pid));
    }
    // A panicking guest must not leave the table entry live forever
    let run = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pool.run_until(process.run(&shared.registry, isolate, opts.cmd))
    }));
    if run.is_err() {
        crate::klog!("kernel: pid {pid} panicked");
        shared.mark_exited(pid, -1);
    }
}

fn default_stdio() -> [String; 3] {
    std::array::from_fn(|_| TTY_PATH.to_string())
}

fn default_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("HOME".to_string(), "/".to_string());
    env.insert("USER".to_string(), "user".to_string());
    env.insert("PATH".to_string(), "/bin".to_string());
    env
}

enum ManagerRequest {
    Wire {
        body: String,
        reply: mpsc::Sender<String>,
    },
    Spawn {
        opts: SpawnOptions,
        parent: u32,
        handshake: oneshot::Sender<Result<u32, WireError>>,
    },
    WaitFor {
        pid: u32,
        reply: oneshot::Sender<Result<i32, WireError>>,
    },
}

/// One context's channel back to the manager
#[derive(Clone)]
pub struct ManagerConnection {
    tx: mpsc::Sender<ManagerRequest>,
}

fn connect(shared: &Arc<ManagerShared>) -> ManagerConnection {
    let (tx, rx) = mpsc::channel::<ManagerRequest>();
    let shared = shared.clone();
    thread::Builder::new()
        .name("proc-service".to_string())
        .spawn(move || {
            while let Ok(req) = rx.recv() {
                match req {
                    ManagerRequest::Wire { body, reply } => {
                        let _ = reply.send(serve_wire(&shared, &body));
                    }
                    ManagerRequest::Spawn {
                        opts,
                        parent,
                        handshake,
                    } => {
                        shared.spawn_child(opts, parent, Some(handshake));
                    }
                    ManagerRequest::WaitFor { pid, reply } => {
                        shared.register_waiter(pid, reply);
                    }
                }
            }
        })
        .expect("spawn proc service thread");
    ManagerConnection { tx }
}

impl ManagerConnection {
    /// Blocking round-trip on the `/~proc` endpoint; the calling thread
    /// parks until the manager replies. Only `*Sync` names cross this
    /// path.
    pub fn call(&self, name: &str, args: Value) -> Result<Value, ApiError> {
        if !name.ends_with("Sync") {
            return Err(ApiError::unsupported_over_sync_bridge(name));
        }
        let (reply, rx) = mpsc::channel();
        let body = json!([name, args]).to_string();
        let _ = self.tx.send(ManagerRequest::Wire { body, reply });
        let text = rx
            .recv()
            .map_err(|_| ApiError::new(ErrorKind::ConnectionAborted, "manager is gone"))?;
        decode_response(&text)
    }

    /// Report a process's exit so the manager can reap its table entry
    pub fn report_exit(&self, pid: u32, code: i32) -> Result<(), ApiError> {
        self.call("reportExitSync", json!([pid, code]))?;
        Ok(())
    }

    /// Spawn with a pre-synchronized pid: returns immediately while the
    /// boot proceeds in the background.
    pub fn spawn_sync(&self, opts: SpawnOptions, parent: u32) -> Result<u32, ApiError> {
        let value = self.call("spawnSync", json!([opts, parent]))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Spawn and resolve once the child's init-and-run handshake lands
    pub fn spawn(
        &self,
        opts: SpawnOptions,
        parent: u32,
    ) -> impl Future<Output = Result<u32, ApiError>> + 'static {
        let (handshake, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerRequest::Spawn {
            opts,
            parent,
            handshake,
        });
        async move {
            match rx.await {
                Ok(Ok(pid)) => Ok(pid),
                Ok(Err(wire)) => Err(ApiError::from(wire)),
                Err(_) => Err(ApiError::new(ErrorKind::ConnectionAborted, "manager is gone")),
            }
        }
    }

    /// Resolve with the exit code once the process reports it
    pub fn wait_for(&self, pid: u32) -> impl Future<Output = Result<i32, ApiError>> + 'static {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(ManagerRequest::WaitFor { pid, reply });
        async move {
            match rx.await {
                Ok(Ok(code)) => Ok(code),
                Ok(Err(wire)) => Err(ApiError::from(wire)),
                Err(_) => Err(ApiError::new(ErrorKind::ConnectionAborted, "manager is gone")),
            }
        }
    }
}

fn serve_wire(shared: &Arc<ManagerShared>, body: &str) -> String {
    encode_response(dispatch_wire(shared, body))
}

fn dispatch_wire(shared: &Arc<ManagerShared>, body: &str) -> Result<Value, ApiError> {
    let (name, args): (String, Value) = serde_json::from_str(body)?;
    match name.as_str() {
        "reportExitSync" => {
            let (pid, code): (u32, i32) = serde_json::from_value(args)?;
            shared.mark_exited(pid, code);
            Ok(Value::Null)
        }
        "spawnSync" => {
            let (opts, parent): (SpawnOptions, u32) = serde_json::from_value(args)?;
            Ok(json!(shared.spawn_child(opts, parent, None)))
        }
        "lookupSync" => {
            let (pid,): (u32,) = serde_json::from_value(args)?;
            match shared.status(pid) {
                Some(status) => Ok(serde_json::to_value(status)?),
                None => Ok(Value::Null),
            }
        }
        "pidsSync" => Ok(serde_json::to_value(shared.pids())?),
        _ => Err(ApiError::not_found(format!(
            "no handler for {PROC_ENDPOINT}/{name}"
        ))),
    }
}

/// Creates and destroys processes, brokering spawns across execution
/// contexts
pub struct ProcessManager {
    shared: Arc<ManagerShared>,
    events: EventHub,
    conn: ManagerConnection,
}

impl ProcessManager {
    pub fn new(vfs: VirtualFileSystem, registry: Arc<ProgramRegistry>) -> Self {
        let (events, tx) = EventHub::new();
        let mut table = HashMap::new();
        table.insert(
            0,
            ProcEntry {
                parent: 0,
                cmd: "kernel".to_string(),
                status: ProcessStatus::Running,
                waiters: Vec::new(),
            },
        );
        let shared = Arc::new(ManagerShared {
            next_pid: AtomicU32::new(1),
            table: Mutex::new(table),
            events: tx,
            fs: FsService::new(vfs),
            registry,
        });
        let conn = connect(&shared);
        Self {
            shared,
            events,
            conn,
        }
    }

    /// A memory-backed root with the device tree at `/dev`, enough for
    /// the stdio invariant to hold.
    pub fn with_standard_fs(registry: Arc<ProgramRegistry>) -> (Self, TtyHandle) {
        let mut vfs = VirtualFileSystem::new(Box::new(MemoryFs::new()));
        vfs.create_dir("/dev").expect("create /dev");
        let (dev, tty) = DevFs::new();
        vfs.mount("/dev", Box::new(dev)).expect("mount /dev");
        (Self::new(vfs, registry), tty)
    }

    pub fn fs(&self) -> &FsService {
        &self.shared.fs
    }

    pub fn registry(&self) -> &Arc<ProgramRegistry> {
        &self.shared.registry
    }

    /// A fresh channel to the manager, for handing to another context
    pub fn connect(&self) -> ManagerConnection {
        connect(&self.shared)
    }

    /// Build the main (pid 0) process in the calling context
    pub fn main_process(
        &self,
        spawner: &LocalSpawner,
    ) -> Result<(Rc<Process>, Rc<Isolate>), ApiError> {
        let fs = self.shared.fs.connect();
        let manager = connect(&self.shared);
        let process = Process::new(
            0,
            None,
            "/".to_string(),
            default_env(),
            fs,
            manager,
            self.shared.events.clone(),
        );
        process.init(&default_stdio())?;
        let isolate = Isolate::attach(process.clone(), spawner.clone());
        Ok((process, isolate))
    }

    pub fn spawn(
        &self,
        opts: SpawnOptions,
    ) -> impl Future<Output = Result<u32, ApiError>> + 'static {
        self.conn.spawn(opts, 0)
    }

    pub fn spawn_sync(&self, opts: SpawnOptions) -> Result<u32, ApiError> {
        self.conn.spawn_sync(opts, 0)
    }

    pub fn wait(&self, pid: u32) -> impl Future<Output = Result<i32, ApiError>> + 'static {
        self.conn.wait_for(pid)
    }

    pub fn status(&self, pid: u32) -> Option<ProcessStatus> {
        self.shared.status(pid)
    }

    pub fn pids(&self) -> Vec<u32> {
        self.shared.pids()
    }

    pub fn command_of(&self, pid: u32) -> Option<String> {
        self.shared
            .table
            .lock()
            .expect("process table lock poisoned")
            .get(&pid)
            .map(|e| e.cmd.clone())
    }

    pub fn parent_of(&self, pid: u32) -> Option<u32> {
        self.shared
            .table
            .lock()
            .expect("process table lock poisoned")
            .get(&pid)
            .map(|e| e.parent)
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }
}
