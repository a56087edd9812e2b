//! Integration tests for the tabos kernel
//!
//! Tests end-to-end functionality across the process manager, op
//! dispatch, and the virtual filesystem. Each test boots its own kernel;
//! guest programs are plain functions registered under /bin paths.

use futures::FutureExt;
use futures::executor::{LocalPool, block_on};
use futures::future::LocalBoxFuture;
use serde_json::{Value, json};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tabos::kernel::{
    ErrorKind, Isolate, LifecycleEvent, ProcessManager, ProgramRegistry, SpawnOptions, WireError,
};
use tabos::vfs::TtyHandle;
use tabos::vfs::service::FS_ENDPOINT;

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Guest programs
// ============================================================================

/// Write the arguments to stdout, space-separated, newline-terminated
fn prog_echo(isolate: Rc<Isolate>, argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
    async move {
        let line = format!("{}\n", argv[1..].join(" "));
        let payload = serde_json::to_value(line.into_bytes()).unwrap();
        match isolate.sync("op_write", json!({ "rid": 1 }), payload) {
            Ok(_) => 0,
            Err(_) => 1,
        }
    }
    .boxed_local()
}

/// Record an advisory exit code, then return something else
fn prog_exitcode(isolate: Rc<Isolate>, _argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
    async move {
        isolate
            .sync("op_exit", json!({ "code": 7 }), Value::Null)
            .unwrap();
        0
    }
    .boxed_local()
}

/// Fire several async reads and return without awaiting any of them
fn prog_burst(isolate: Rc<Isolate>, _argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
    async move {
        let read = isolate.op_code("op_read_file").unwrap();
        for promise_id in 1..=4 {
            isolate.op_async(read, json!({ "path": "/seed.txt" }), Value::Null, promise_id);
        }
        0
    }
    .boxed_local()
}

/// Push bytes through a pipe and persist what came out the other end
fn prog_pipeline(isolate: Rc<Isolate>, _argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
    async move {
        let ends = isolate.sync("op_pipe", Value::Null, Value::Null).unwrap();
        let read_rid = ends["read_rid"].as_u64().unwrap();
        let write_rid = ends["write_rid"].as_u64().unwrap();

        let payload = serde_json::to_value(b"through the pipe".to_vec()).unwrap();
        isolate
            .invoke("op_write", json!({ "rid": write_rid }), payload)
            .await
            .unwrap();
        let data = isolate
            .invoke("op_read", json!({ "rid": read_rid, "len": 64 }), Value::Null)
            .await
            .unwrap();
        isolate
            .sync("op_write_file", json!({ "path": "/pipe-out.txt" }), data)
            .unwrap();

        isolate
            .sync("op_close", json!({ "rid": read_rid }), Value::Null)
            .unwrap();
        isolate
            .sync("op_close", json!({ "rid": write_rid }), Value::Null)
            .unwrap();
        0
    }
    .boxed_local()
}

/// Spawn a child, wait for it, persist the reaped exit code
fn prog_parent(isolate: Rc<Isolate>, _argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
    async move {
        let child = isolate
            .invoke(
                "op_spawn",
                json!({ "cmd": ["/bin/exitcode"] }),
                Value::Null,
            )
            .await
            .unwrap();
        let rid = child["rid"].as_u64().unwrap();

        let waited = isolate
            .invoke("op_wait", json!({ "rid": rid }), Value::Null)
            .await
            .unwrap();
        let code = waited["code"].as_i64().unwrap();

        let payload = serde_json::to_value(format!("child exited {code}").into_bytes()).unwrap();
        isolate
            .sync("op_write_file", json!({ "path": "/wait-out.txt" }), payload)
            .unwrap();
        isolate
            .sync("op_close", json!({ "rid": rid }), Value::Null)
            .unwrap();
        0
    }
    .boxed_local()
}

fn files_main(isolate: &Isolate) -> Result<(), WireError> {
    isolate.sync("op_mkdir", json!({ "path": "/work" }), Value::Null)?;

    let opened = isolate.sync(
        "op_open",
        json!({ "path": "/work/log.txt", "options": { "write": true, "create": true } }),
        Value::Null,
    )?;
    let rid = opened["rid"].as_u64().unwrap();
    let payload = serde_json::to_value(b"abcdef".to_vec()).unwrap();
    let written = isolate.sync("op_write", json!({ "rid": rid }), payload)?;
    assert_eq!(written["n"], json!(6));
    isolate.sync("op_close", json!({ "rid": rid }), Value::Null)?;

    let opened = isolate.sync("op_open", json!({ "path": "/work/log.txt" }), Value::Null)?;
    let rid = opened["rid"].as_u64().unwrap();
    let data = isolate.sync("op_read", json!({ "rid": rid, "len": 4 }), Value::Null)?;
    assert_eq!(serde_json::from_value::<Vec<u8>>(data).unwrap(), b"abcd");
    let pos = isolate.sync(
        "op_seek",
        json!({ "rid": rid, "whence": "end", "offset": -2 }),
        Value::Null,
    )?;
    assert_eq!(pos["pos"], json!(4));
    let data = isolate.sync("op_read", json!({ "rid": rid, "len": 16 }), Value::Null)?;
    assert_eq!(serde_json::from_value::<Vec<u8>>(data).unwrap(), b"ef");
    isolate.sync("op_close", json!({ "rid": rid }), Value::Null)?;

    let meta = isolate.sync("op_stat", json!({ "path": "/work/log.txt" }), Value::Null)?;
    assert_eq!(meta["size"], json!(6));
    assert_eq!(meta["is_file"], json!(true));

    isolate.sync(
        "op_rename",
        json!({ "from": "/work/log.txt", "to": "/work/renamed.txt" }),
        Value::Null,
    )?;
    let real = isolate.sync(
        "op_realpath",
        json!({ "path": "/work/../work/./renamed.txt" }),
        Value::Null,
    )?;
    assert_eq!(real, json!("/work/renamed.txt"));

    let entries = isolate.sync("op_readdir", json!({ "path": "/work" }), Value::Null)?;
    let names: Vec<String> = entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["renamed.txt".to_string()]);

    let whole = isolate.sync("op_read_file", json!({ "path": "/work/renamed.txt" }), Value::Null)?;
    assert_eq!(serde_json::from_value::<Vec<u8>>(whole).unwrap(), b"abcdef");

    isolate.sync("op_remove", json!({ "path": "/work/renamed.txt" }), Value::Null)?;
    let gone = isolate
        .sync("op_stat", json!({ "path": "/work/renamed.txt" }), Value::Null)
        .unwrap_err();
    assert_eq!(gone.code, "ENOENT");
    Ok(())
}

/// Exercise the whole file-op surface; nonzero exit on any mismatch
fn prog_files(isolate: Rc<Isolate>, _argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
    async move {
        match files_main(&isolate) {
            Ok(()) => 0,
            Err(_) => 1,
        }
    }
    .boxed_local()
}

/// chdir, relative paths, and environment round-trips
fn prog_env_cwd(isolate: Rc<Isolate>, _argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
    async move {
        isolate
            .sync("op_mkdir", json!({ "path": "/home" }), Value::Null)
            .unwrap();
        isolate
            .sync("op_chdir", json!({ "path": "/home" }), Value::Null)
            .unwrap();
        let cwd = isolate.sync("op_cwd", Value::Null, Value::Null).unwrap();
        if cwd != json!("/home") {
            return 1;
        }

        isolate
            .sync(
                "op_set_env",
                json!({ "name": "GREETING", "value": "hi" }),
                Value::Null,
            )
            .unwrap();
        let value = isolate
            .sync("op_get_env", json!({ "name": "GREETING" }), Value::Null)
            .unwrap();
        if value != json!("hi") {
            return 1;
        }

        // Relative to the new working directory
        let payload = serde_json::to_value(b"at home".to_vec()).unwrap();
        isolate
            .sync("op_write_file", json!({ "path": "notes.txt" }), payload)
            .unwrap();
        0
    }
    .boxed_local()
}

/// Decode UTF-8 split across chunk boundaries
fn prog_decode(isolate: Rc<Isolate>, _argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
    async move {
        let decoder = isolate
            .sync("op_text_decoder_new", Value::Null, Value::Null)
            .unwrap();
        let rid = decoder["rid"].as_u64().unwrap();

        let bytes = "héllo".as_bytes();
        let first = isolate
            .sync(
                "op_text_decode",
                json!({ "rid": rid }),
                serde_json::to_value(&bytes[..2]).unwrap(),
            )
            .unwrap();
        let second = isolate
            .sync(
                "op_text_decode",
                json!({ "rid": rid }),
                serde_json::to_value(&bytes[2..]).unwrap(),
            )
            .unwrap();

        let joined = format!(
            "{}{}",
            first.as_str().unwrap_or_default(),
            second.as_str().unwrap_or_default()
        );
        let payload = serde_json::to_value(joined.into_bytes()).unwrap();
        isolate
            .sync("op_write_file", json!({ "path": "/decode-out.txt" }), payload)
            .unwrap();
        isolate
            .sync("op_close", json!({ "rid": rid }), Value::Null)
            .unwrap();
        0
    }
    .boxed_local()
}

// ============================================================================
// Harness
// ============================================================================

fn kernel() -> (ProcessManager, TtyHandle) {
    let registry = Arc::new(ProgramRegistry::new());
    registry.register("/bin/echo", prog_echo);
    registry.register("/bin/exitcode", prog_exitcode);
    registry.register("/bin/burst", prog_burst);
    registry.register("/bin/pipeline", prog_pipeline);
    registry.register("/bin/parent", prog_parent);
    registry.register("/bin/files", prog_files);
    registry.register("/bin/envcwd", prog_env_cwd);
    registry.register("/bin/decode", prog_decode);
    ProcessManager::with_standard_fs(registry)
}

fn read_kernel_file(manager: &ProcessManager, path: &str) -> Vec<u8> {
    manager
        .fs()
        .with_vfs(|vfs| vfs.read_file(path))
        .unwrap_or_else(|e| panic!("read {path}: {e}"))
}

// ============================================================================
// Spawning and lifecycle
// ============================================================================

#[test]
fn test_spawn_echo_writes_to_the_controlling_tty() {
    let (manager, tty) = kernel();
    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/echo", "hello", "world"]))).unwrap();
    assert_eq!(pid, 1, "first spawned pid");

    let code = block_on(manager.wait(pid)).unwrap();
    assert_eq!(code, 0);
    assert_eq!(tty.take_output(), b"hello world\n");
}

#[test]
fn test_first_lifecycle_event_is_start() {
    let (manager, _tty) = kernel();
    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/echo", "x"]))).unwrap();
    block_on(manager.wait(pid)).unwrap();

    let first = manager
        .events()
        .wait_for(WAIT, |e| e.pid() == pid)
        .expect("no events for spawned pid");
    assert_eq!(first, LifecycleEvent::Start { pid });
}

#[test]
fn test_exit_code_is_advisory_and_overrides_the_return_value() {
    let (manager, _tty) = kernel();
    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/exitcode"]))).unwrap();
    let code = block_on(manager.wait(pid)).unwrap();
    assert_eq!(code, 7, "op_exit's code wins over the returned 0");
}

#[test]
fn test_concurrent_async_ops_yield_exactly_one_might_exit() {
    let (manager, _tty) = kernel();
    manager
        .fs()
        .with_vfs(|vfs| vfs.write_file("/seed.txt", b"seed"))
        .unwrap();

    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/burst"]))).unwrap();
    let code = block_on(manager.wait(pid)).unwrap();
    assert_eq!(code, 0);

    let might_exits = manager
        .events()
        .drain()
        .into_iter()
        .filter(|e| matches!(e, LifecycleEvent::MightExit { pid: p, .. } if *p == pid))
        .count();
    assert_eq!(might_exits, 1, "one might_exit, not one per op");
}

#[test]
fn test_stdio_override_redirects_to_the_null_device() {
    let (manager, tty) = kernel();
    let mut opts = SpawnOptions::new(&["/bin/echo", "quiet"]);
    opts.stdio = Some(std::array::from_fn(|_| "/dev/null".to_string()));

    let pid = block_on(manager.spawn(opts)).unwrap();
    block_on(manager.wait(pid)).unwrap();
    assert_eq!(tty.take_output(), b"", "nothing reached the tty");
}

#[test]
fn test_guest_spawns_and_waits_for_its_own_child() {
    let (manager, _tty) = kernel();
    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/parent"]))).unwrap();
    let code = block_on(manager.wait(pid)).unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_kernel_file(&manager, "/wait-out.txt"), b"child exited 7");

    // The grandchild's table entry records its lineage
    assert_eq!(manager.parent_of(pid), Some(0));
    assert_eq!(manager.parent_of(2), Some(pid));
    assert_eq!(manager.command_of(2).as_deref(), Some("/bin/exitcode"));
}

// ============================================================================
// Ops over the filesystem
// ============================================================================

#[test]
fn test_file_op_surface() {
    let (manager, _tty) = kernel();
    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/files"]))).unwrap();
    let code = block_on(manager.wait(pid)).unwrap();
    assert_eq!(code, 0);
}

#[test]
fn test_pipe_ops_round_trip() {
    let (manager, _tty) = kernel();
    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/pipeline"]))).unwrap();
    let code = block_on(manager.wait(pid)).unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_kernel_file(&manager, "/pipe-out.txt"), b"through the pipe");
}

#[test]
fn test_chdir_env_and_relative_paths() {
    let (manager, _tty) = kernel();
    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/envcwd"]))).unwrap();
    let code = block_on(manager.wait(pid)).unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_kernel_file(&manager, "/home/notes.txt"), b"at home");
}

#[test]
fn test_text_decoder_carries_split_sequences() {
    let (manager, _tty) = kernel();
    let pid = block_on(manager.spawn(SpawnOptions::new(&["/bin/decode"]))).unwrap();
    let code = block_on(manager.wait(pid)).unwrap();
    assert_eq!(code, 0);
    assert_eq!(read_kernel_file(&manager, "/decode-out.txt"), "héllo".as_bytes());
}

// ============================================================================
// The sync bridge
// ============================================================================

#[test]
fn test_stat_of_missing_file_over_the_bridge() {
    let (manager, _tty) = kernel();
    let conn = manager.fs().connect();

    let err = conn
        .call(FS_ENDPOINT, "statSync", json!(["/a.txt"]))
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::NotFound);
    assert_eq!(err.kind.code(), "ENOENT");
}

#[test]
fn test_mounted_backend_through_the_op_surface() {
    let (manager, _tty) = kernel();
    manager.fs().with_vfs(|vfs| {
        vfs.create_dir("/mnt").unwrap();
        vfs.mount("/mnt/data", Box::new(tabos::vfs::MemoryFs::new()))
            .unwrap();
        vfs.write_file("/mnt/data/inside.txt", b"mounted").unwrap();
    });

    let mut pool = LocalPool::new();
    let (_process, isolate) = manager.main_process(&pool.spawner()).unwrap();

    let entries = isolate
        .sync("op_readdir", json!({ "path": "/mnt/data" }), Value::Null)
        .unwrap();
    let names: Vec<&str> = entries
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["inside.txt"]);

    let data = pool.run_until(isolate.invoke(
        "op_read_file",
        json!({ "path": "/mnt/data/inside.txt" }),
        Value::Null,
    ));
    assert_eq!(
        serde_json::from_value::<Vec<u8>>(data.unwrap()).unwrap(),
        b"mounted"
    );
}
