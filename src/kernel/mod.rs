//! The kernel - processes, resources, op dispatch, and spawning
//!
//! No ambient global state: the pid counter lives in the
//! [`ProcessManager`], resource tables are owned by their [`Process`], and
//! everything crossing a context boundary goes through an explicit channel.

pub mod error;
pub mod events;
pub mod isolate;
pub mod manager;
pub mod ops;
pub mod pipe;
pub mod process;
pub mod program;
pub mod resource;

pub use error::{ApiError, ErrorKind, WireError};
pub use events::{EventHub, LifecycleEvent};
pub use isolate::Isolate;
pub use manager::{ManagerConnection, ProcessManager, SpawnOptions};
pub use ops::OpCode;
pub use pipe::InMemoryPipe;
pub use process::{Process, ProcessState};
pub use program::{ProgramMain, ProgramRegistry};
pub use resource::{Resource, ResourceTable};
