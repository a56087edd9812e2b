//! The op table
//!
//! Every host operation a guest can call, identified by a fixed code
//! resolved at compile time. The dispatch table is built once at process
//! construction and exposed to the guest only as opaque indices through
//! the `ops_sync` handshake at index 0, which returns the full
//! `[name, index]` table for the guest's own caching layer.

use super::error::ApiError;
use super::manager::SpawnOptions;
use super::pipe::InMemoryPipe;
use super::process::Process;
use super::resource::{
    ChildProcessResource, FileResource, PipeResource, Resource, TextDecoderResource,
};
use crate::vfs::service::{FILE_ENDPOINT, FS_ENDPOINT};
use crate::vfs::{Metadata, OpenOptions, SeekWhence, resolve_path};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde::Deserialize;
use serde_json::{Value, json};
use std::rc::Rc;

/// Host operations, in wire-index order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpCode {
    OpsSync = 0,
    Open,
    Read,
    Write,
    Seek,
    Close,
    TryClose,
    Stat,
    Mkdir,
    Readdir,
    Remove,
    Rename,
    Realpath,
    ReadFile,
    WriteFile,
    Cwd,
    Chdir,
    Env,
    GetEnv,
    SetEnv,
    DeleteEnv,
    Pipe,
    TextDecoderNew,
    TextDecode,
    Spawn,
    Wait,
    Exit,
    Pid,
}

const ALL_OPS: [OpCode; 28] = [
    OpCode::OpsSync,
    OpCode::Open,
    OpCode::Read,
    OpCode::Write,
    OpCode::Seek,
    OpCode::Close,
    OpCode::TryClose,
    OpCode::Stat,
    OpCode::Mkdir,
    OpCode::Readdir,
    OpCode::Remove,
    OpCode::Rename,
    OpCode::Realpath,
    OpCode::ReadFile,
    OpCode::WriteFile,
    OpCode::Cwd,
    OpCode::Chdir,
    OpCode::Env,
    OpCode::GetEnv,
    OpCode::SetEnv,
    OpCode::DeleteEnv,
    OpCode::Pipe,
    OpCode::TextDecoderNew,
    OpCode::TextDecode,
    OpCode::Spawn,
    OpCode::Wait,
    OpCode::Exit,
    OpCode::Pid,
];

impl OpCode {
    pub fn index(self) -> u32 {
        self as u32
    }

    pub fn from_index(index: u32) -> Option<Self> {
        ALL_OPS.get(index as usize).copied()
    }
}

pub type SyncFn = fn(&Rc<Process>, Value, Value) -> Result<Value, ApiError>;
pub type AsyncFn = fn(Rc<Process>, Value, Value) -> LocalBoxFuture<'static, Result<Value, ApiError>>;

/// A registered host operation with independent sync/async
/// implementations
pub struct Op {
    pub code: OpCode,
    pub name: &'static str,
    pub sync: Option<SyncFn>,
    pub r#async: Option<AsyncFn>,
}

/// Build the dispatch table, ordered by [`OpCode`] index
pub fn op_table() -> Vec<Op> {
    let table = vec![
        Op {
            code: OpCode::OpsSync,
            name: "ops_sync",
            sync: Some(ops_sync),
            r#async: None,
        },
        Op {
            code: OpCode::Open,
            name: "op_open",
            sync: Some(op_open_sync),
            r#async: Some(op_open_async),
        },
        Op {
            code: OpCode::Read,
            name: "op_read",
            sync: Some(op_read_sync),
            r#async: Some(op_read_async),
        },
        Op {
            code: OpCode::Write,
            name: "op_write",
            sync: Some(op_write_sync),
            r#async: Some(op_write_async),
        },
        Op {
            code: OpCode::Seek,
            name: "op_seek",
            sync: Some(op_seek_sync),
            r#async: Some(op_seek_async),
        },
        Op {
            code: OpCode::Close,
            name: "op_close",
            sync: Some(op_close),
            r#async: None,
        },
        Op {
            code: OpCode::TryClose,
            name: "op_try_close",
            sync: Some(op_try_close),
            r#async: None,
        },
        Op {
            code: OpCode::Stat,
            name: "op_stat",
            sync: Some(op_stat_sync),
            r#async: Some(op_stat_async),
        },
        Op {
            code: OpCode::Mkdir,
            name: "op_mkdir",
            sync: Some(op_mkdir_sync),
            r#async: Some(op_mkdir_async),
        },
        Op {
            code: OpCode::Readdir,
            name: "op_readdir",
            sync: Some(op_readdir_sync),
            r#async: Some(op_readdir_async),
        },
        Op {
            code: OpCode::Remove,
            name: "op_remove",
            sync: Some(op_remove_sync),
            r#async: Some(op_remove_async),
        },
        Op {
            code: OpCode::Rename,
            name: "op_rename",
            sync: Some(op_rename_sync),
            r#async: Some(op_rename_async),
        },
        Op {
            code: OpCode::Realpath,
            name: "op_realpath",
            sync: Some(op_realpath_sync),
            r#async: Some(op_realpath_async),
        },
        Op {
            code: OpCode::ReadFile,
            name: "op_read_file",
            sync: Some(op_read_file_sync),
            r#async: Some(op_read_file_async),
        },
        Op {
            code: OpCode::WriteFile,
            name: "op_write_file",
            sync: Some(op_write_file_sync),
            r#async: Some(op_write_file_async),
        },
        Op {
            code: OpCode::Cwd,
            name: "op_cwd",
            sync: Some(op_cwd),
            r#async: None,
        },
        Op {
            code: OpCode::Chdir,
            name: "op_chdir",
            sync: Some(op_chdir),
            r#async: None,
        },
        Op {
            code: OpCode::Env,
            name: "op_env",
            sync: Some(op_env),
            r#async: None,
        },
        Op {
            code: OpCode::GetEnv,
            name: "op_get_env",
            sync: Some(op_get_env),
            r#async: None,
        },
        Op {
            code: OpCode::SetEnv,
            name: "op_set_env",
            sync: Some(op_set_env),
            r#async: None,
        },
        Op {
            code: OpCode::DeleteEnv,
            name: "op_delete_env",
            sync: Some(op_delete_env),
            r#async: None,
        },
        Op {
            code: OpCode::Pipe,
            name: "op_pipe",
            sync: Some(op_pipe),
            r#async: None,
        },
        Op {
            code: OpCode::TextDecoderNew,
            name: "op_text_decoder_new",
            sync: Some(op_text_decoder_new),
            r#async: None,
        },
        Op {
            code: OpCode::TextDecode,
            name: "op_text_decode",
            sync: Some(op_text_decode),
            r#async: None,
        },
        Op {
            code: OpCode::Spawn,
            name: "op_spawn",
            sync: Some(op_spawn_sync),
            r#async: Some(op_spawn_async),
        },
        Op {
            code: OpCode::Wait,
            name: "op_wait",
            sync: None,
            r#async: Some(op_wait_async),
        },
        Op {
            code: OpCode::Exit,
            name: "op_exit",
            sync: Some(op_exit),
            r#async: None,
        },
        Op {
            code: OpCode::Pid,
            name: "op_pid",
            sync: Some(op_pid),
            r#async: None,
        },
    ];
    debug_assert!(
        table
            .iter()
            .enumerate()
            .all(|(i, op)| op.code.index() as usize == i)
    );
    table
}

fn bad_rid(rid: u32) -> ApiError {
    ApiError::invalid_input(format!("no resource with rid {rid}"))
}

// ---------------------------------------------------------------------
// Argument shapes
// ---------------------------------------------------------------------

#[derive(Deserialize)]
struct OpenArgs {
    path: String,
    #[serde(default)]
    options: OpenOptions,
}

#[derive(Deserialize)]
struct RidArgs {
    rid: u32,
}

#[derive(Deserialize)]
struct ReadArgs {
    rid: u32,
    len: usize,
}

#[derive(Deserialize)]
struct SeekArgs {
    rid: u32,
    whence: SeekWhence,
    offset: i64,
}

#[derive(Deserialize)]
struct PathArgs {
    path: String,
}

#[derive(Deserialize)]
struct RenameArgs {
    from: String,
    to: String,
}

#[derive(Deserialize)]
struct NameArgs {
    name: String,
}

#[derive(Deserialize)]
struct SetEnvArgs {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct ExitArgs {
    code: i32,
}

// ---------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------

fn ops_sync(p: &Rc<Process>, _a: Value, _b: Value) -> Result<Value, ApiError> {
    Ok(Value::Array(
        p.ops()
            .iter()
            .map(|op| json!([op.name, op.code.index()]))
            .collect(),
    ))
}

// ---------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------

fn op_open_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: OpenArgs = serde_json::from_value(a)?;
    let path = resolve_path(&p.cwd(), &args.path);
    let value = p
        .fs()
        .call(FS_ENDPOINT, "openSync", json!([path, args.options]))?;
    let handle: u64 = serde_json::from_value(value)?;
    let rid = p.resources_mut().add(Resource::File(FileResource {
        path,
        handle,
        conn: p.fs().clone(),
    }));
    Ok(json!({ "rid": rid }))
}

fn op_open_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: OpenArgs = serde_json::from_value(a)?;
        let path = resolve_path(&p.cwd(), &args.path);
        let value = p
            .fs()
            .request(FS_ENDPOINT, "openSync", json!([path, args.options]))
            .await?;
        let handle: u64 = serde_json::from_value(value)?;
        let rid = p.resources_mut().add(Resource::File(FileResource {
            path,
            handle,
            conn: p.fs().clone(),
        }));
        Ok(json!({ "rid": rid }))
    }
    .boxed_local()
}

fn op_read_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: ReadArgs = serde_json::from_value(a)?;
    let mut table = p.resources_mut();
    let resource = table.get_mut(args.rid).ok_or_else(|| bad_rid(args.rid))?;
    Ok(serde_json::to_value(resource.read_sync(args.len)?)?)
}

/// What an async read needs, cloned out so no table borrow crosses an
/// await point
enum IoPlan {
    File(FileResource),
    Pipe(Rc<InMemoryPipe>),
}

fn io_plan(p: &Rc<Process>, rid: u32, verb: &str) -> Result<IoPlan, ApiError> {
    let mut table = p.resources_mut();
    match table.get_mut(rid).ok_or_else(|| bad_rid(rid))? {
        Resource::File(f) => Ok(IoPlan::File(FileResource {
            path: f.path.clone(),
            handle: f.handle,
            conn: f.conn.clone(),
        })),
        Resource::Pipe(pr) => Ok(IoPlan::Pipe(pr.pipe.clone())),
        other => Err(ApiError::invalid_input(format!(
            "cannot {verb} {}",
            other.type_name()
        ))),
    }
}

fn op_read_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: ReadArgs = serde_json::from_value(a)?;
        match io_plan(&p, args.rid, "read from")? {
            IoPlan::File(f) => {
                let value = f
                    .conn
                    .request(FILE_ENDPOINT, "readSync", json!([f.handle, args.len]))
                    .await?;
                Ok(value)
            }
            IoPlan::Pipe(pipe) => {
                let data = pipe.read_buffer(args.len).await;
                Ok(serde_json::to_value(data)?)
            }
        }
    }
    .boxed_local()
}

fn op_write_sync(p: &Rc<Process>, a: Value, b: Value) -> Result<Value, ApiError> {
    let args: RidArgs = serde_json::from_value(a)?;
    let data: Vec<u8> = serde_json::from_value(b)?;
    let mut table = p.resources_mut();
    let resource = table.get_mut(args.rid).ok_or_else(|| bad_rid(args.rid))?;
    let n = resource.write_sync(&data)?;
    Ok(json!({ "n": n }))
}

fn op_write_async(p: Rc<Process>, a: Value, b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: RidArgs = serde_json::from_value(a)?;
        let data: Vec<u8> = serde_json::from_value(b)?;
        match io_plan(&p, args.rid, "write to")? {
            IoPlan::File(f) => {
                let value = f
                    .conn
                    .request(FILE_ENDPOINT, "writeSync", json!([f.handle, data]))
                    .await?;
                let n: usize = serde_json::from_value(value)?;
                Ok(json!({ "n": n }))
            }
            // The backpressure wait lives here: past the cutoff the
            // writer parks until a reader drains
            IoPlan::Pipe(pipe) => {
                let n = pipe.write_buffer(&data).await?;
                Ok(json!({ "n": n }))
            }
        }
    }
    .boxed_local()
}

fn op_seek_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: SeekArgs = serde_json::from_value(a)?;
    let mut table = p.resources_mut();
    match table.get_mut(args.rid).ok_or_else(|| bad_rid(args.rid))? {
        Resource::File(f) => Ok(json!({ "pos": f.seek_sync(args.whence, args.offset)? })),
        other => Err(ApiError::invalid_input(format!(
            "cannot seek {}",
            other.type_name()
        ))),
    }
}

fn op_seek_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: SeekArgs = serde_json::from_value(a)?;
        match io_plan(&p, args.rid, "seek")? {
            IoPlan::File(f) => {
                let value = f
                    .conn
                    .request(
                        FILE_ENDPOINT,
                        "seekSync",
                        json!([f.handle, args.whence, args.offset]),
                    )
                    .await?;
                Ok(json!({ "pos": serde_json::from_value::<u64>(value)? }))
            }
            IoPlan::Pipe(_) => Err(ApiError::invalid_input("cannot seek pipe")),
        }
    }
    .boxed_local()
}

fn op_close(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: RidArgs = serde_json::from_value(a)?;
    p.resources_mut().close(args.rid)?;
    Ok(Value::Null)
}

fn op_try_close(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: RidArgs = serde_json::from_value(a)?;
    p.resources_mut().try_close(args.rid)?;
    Ok(Value::Null)
}

// ---------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------

fn op_stat_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: PathArgs = serde_json::from_value(a)?;
    let path = resolve_path(&p.cwd(), &args.path);
    p.fs().call(FS_ENDPOINT, "statSync", json!([path]))
}

fn op_stat_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: PathArgs = serde_json::from_value(a)?;
        let path = resolve_path(&p.cwd(), &args.path);
        p.fs().request(FS_ENDPOINT, "statSync", json!([path])).await
    }
    .boxed_local()
}

fn op_mkdir_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: PathArgs = serde_json::from_value(a)?;
    let path = resolve_path(&p.cwd(), &args.path);
    p.fs().call(FS_ENDPOINT, "mkdirSync", json!([path]))
}

fn op_mkdir_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: PathArgs = serde_json::from_value(a)?;
        let path = resolve_path(&p.cwd(), &args.path);
        p.fs().request(FS_ENDPOINT, "mkdirSync", json!([path])).await
    }
    .boxed_local()
}

fn op_readdir_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: PathArgs = serde_json::from_value(a)?;
    let path = resolve_path(&p.cwd(), &args.path);
    p.fs().call(FS_ENDPOINT, "readdirSync", json!([path]))
}

fn op_readdir_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: PathArgs = serde_json::from_value(a)?;
        let path = resolve_path(&p.cwd(), &args.path);
        p.fs()
            .request(FS_ENDPOINT, "readdirSync", json!([path]))
            .await
    }
    .boxed_local()
}

fn op_remove_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: PathArgs = serde_json::from_value(a)?;
    let path = resolve_path(&p.cwd(), &args.path);
    p.fs().call(FS_ENDPOINT, "removeSync", json!([path]))
}

fn op_remove_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: PathArgs = serde_json::from_value(a)?;
        let path = resolve_path(&p.cwd(), &args.path);
        p.fs().request(FS_ENDPOINT, "removeSync", json!([path])).await
    }
    .boxed_local()
}

fn op_rename_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: RenameArgs = serde_json::from_value(a)?;
    let from = resolve_path(&p.cwd(), &args.from);
    let to = resolve_path(&p.cwd(), &args.to);
    p.fs().call(FS_ENDPOINT, "renameSync", json!([from, to]))
}

fn op_rename_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: RenameArgs = serde_json::from_value(a)?;
        let from = resolve_path(&p.cwd(), &args.from);
        let to = resolve_path(&p.cwd(), &args.to);
        p.fs()
            .request(FS_ENDPOINT, "renameSync", json!([from, to]))
            .await
    }
    .boxed_local()
}

fn op_realpath_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: PathArgs = serde_json::from_value(a)?;
    let path = resolve_path(&p.cwd(), &args.path);
    p.fs().call(FS_ENDPOINT, "realpathSync", json!([path]))
}

fn op_realpath_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: PathArgs = serde_json::from_value(a)?;
        let path = resolve_path(&p.cwd(), &args.path);
        p.fs()
            .request(FS_ENDPOINT, "realpathSync", json!([path]))
            .await
    }
    .boxed_local()
}

fn op_read_file_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: PathArgs = serde_json::from_value(a)?;
    let path = resolve_path(&p.cwd(), &args.path);
    p.fs().call(FS_ENDPOINT, "readFileSync", json!([path]))
}

fn op_read_file_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: PathArgs = serde_json::from_value(a)?;
        let path = resolve_path(&p.cwd(), &args.path);
        p.fs()
            .request(FS_ENDPOINT, "readFileSync", json!([path]))
            .await
    }
    .boxed_local()
}

fn op_write_file_sync(p: &Rc<Process>, a: Value, b: Value) -> Result<Value, ApiError> {
    let args: PathArgs = serde_json::from_value(a)?;
    let data: Vec<u8> = serde_json::from_value(b)?;
    let path = resolve_path(&p.cwd(), &args.path);
    p.fs().call(FS_ENDPOINT, "writeFileSync", json!([path, data]))
}

fn op_write_file_async(p: Rc<Process>, a: Value, b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: PathArgs = serde_json::from_value(a)?;
        let data: Vec<u8> = serde_json::from_value(b)?;
        let path = resolve_path(&p.cwd(), &args.path);
        p.fs()
            .request(FS_ENDPOINT, "writeFileSync", json!([path, data]))
            .await
    }
    .boxed_local()
}

// ---------------------------------------------------------------------
// Working directory and environment
// ---------------------------------------------------------------------

fn op_cwd(p: &Rc<Process>, _a: Value, _b: Value) -> Result<Value, ApiError> {
    Ok(json!(p.cwd()))
}

fn op_chdir(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: PathArgs = serde_json::from_value(a)?;
    let path = resolve_path(&p.cwd(), &args.path);
    let value = p.fs().call(FS_ENDPOINT, "statSync", json!([path]))?;
    let meta: Metadata = serde_json::from_value(value)?;
    if !meta.is_dir {
        return Err(ApiError::new(
            super::error::ErrorKind::NotADirectory,
            format!("not a directory: {path}"),
        ));
    }
    p.set_cwd(path);
    Ok(Value::Null)
}

fn op_env(p: &Rc<Process>, _a: Value, _b: Value) -> Result<Value, ApiError> {
    Ok(serde_json::to_value(p.env())?)
}

fn op_get_env(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: NameArgs = serde_json::from_value(a)?;
    Ok(match p.env_get(&args.name) {
        Some(value) => json!(value),
        None => Value::Null,
    })
}

fn op_set_env(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: SetEnvArgs = serde_json::from_value(a)?;
    p.env_set(&args.name, &args.value);
    Ok(Value::Null)
}

fn op_delete_env(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: NameArgs = serde_json::from_value(a)?;
    Ok(json!(p.env_delete(&args.name)))
}

// ---------------------------------------------------------------------
// Pipes and decoders
// ---------------------------------------------------------------------

fn op_pipe(p: &Rc<Process>, _a: Value, _b: Value) -> Result<Value, ApiError> {
    let pipe = InMemoryPipe::new();
    pipe.add_ref();
    let mut table = p.resources_mut();
    let read_rid = table.add(Resource::Pipe(PipeResource { pipe: pipe.clone() }));
    let write_rid = table.add(Resource::Pipe(PipeResource { pipe }));
    Ok(json!({ "read_rid": read_rid, "write_rid": write_rid }))
}

fn op_text_decoder_new(p: &Rc<Process>, _a: Value, _b: Value) -> Result<Value, ApiError> {
    let rid = p
        .resources_mut()
        .add(Resource::TextDecoder(TextDecoderResource::new()));
    Ok(json!({ "rid": rid }))
}

fn op_text_decode(p: &Rc<Process>, a: Value, b: Value) -> Result<Value, ApiError> {
    let args: RidArgs = serde_json::from_value(a)?;
    let data: Vec<u8> = serde_json::from_value(b)?;
    let mut table = p.resources_mut();
    match table.get_mut(args.rid).ok_or_else(|| bad_rid(args.rid))? {
        Resource::TextDecoder(decoder) => Ok(json!(decoder.decode(&data))),
        other => Err(ApiError::invalid_input(format!(
            "not a text decoder: {}",
            other.type_name()
        ))),
    }
}

// ---------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------

fn fill_spawn_defaults(p: &Rc<Process>, opts: &mut SpawnOptions) {
    if opts.cwd.is_none() {
        opts.cwd = Some(p.cwd());
    }
    if opts.env.is_none() {
        opts.env = Some(p.env());
    }
    if opts.stdio.is_none() {
        opts.stdio = Some(p.resources_mut().stdio_paths());
    }
}

fn op_spawn_sync(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let mut opts: SpawnOptions = serde_json::from_value(a)?;
    fill_spawn_defaults(p, &mut opts);
    let pid = p.manager().spawn_sync(opts, p.pid())?;
    let rid = p
        .resources_mut()
        .add(Resource::Child(ChildProcessResource { pid }));
    Ok(json!({ "pid": pid, "rid": rid }))
}

fn op_spawn_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let mut opts: SpawnOptions = serde_json::from_value(a)?;
        fill_spawn_defaults(&p, &mut opts);
        let pid = p.manager().spawn(opts, p.pid()).await?;
        let rid = p
            .resources_mut()
            .add(Resource::Child(ChildProcessResource { pid }));
        Ok(json!({ "pid": pid, "rid": rid }))
    }
    .boxed_local()
}

fn op_wait_async(p: Rc<Process>, a: Value, _b: Value) -> LocalBoxFuture<'static, Result<Value, ApiError>> {
    async move {
        let args: RidArgs = serde_json::from_value(a)?;
        let pid = {
            let mut table = p.resources_mut();
            match table.get_mut(args.rid).ok_or_else(|| bad_rid(args.rid))? {
                Resource::Child(child) => child.pid,
                other => {
                    return Err(ApiError::invalid_input(format!(
                        "cannot wait on {}",
                        other.type_name()
                    )));
                }
            }
        };
        let code = p.manager().wait_for(pid).await?;
        Ok(json!({ "code": code }))
    }
    .boxed_local()
}

fn op_exit(p: &Rc<Process>, a: Value, _b: Value) -> Result<Value, ApiError> {
    let args: ExitArgs = serde_json::from_value(a)?;
    p.set_exit_code(args.code);
    Ok(Value::Null)
}

fn op_pid(p: &Rc<Process>, _a: Value, _b: Value) -> Result<Value, ApiError> {
    Ok(json!({ "pid": p.pid(), "parent": p.parent() }))
}
