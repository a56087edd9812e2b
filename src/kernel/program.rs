//! Program registry
//!
//! Guest programs are `main(isolate, argv)` entry points addressed by
//! path. A process starts by resolving its command's first word here and
//! running the returned future; a numeric return value becomes the
//! advisory exit code.

use super::error::ApiError;
use super::isolate::Isolate;
use futures::future::LocalBoxFuture;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Mutex;

/// A program entry point. Receives the full argv, `argv[0]` included.
pub type ProgramMain = fn(Rc<Isolate>, Vec<String>) -> LocalBoxFuture<'static, i32>;

/// Path-addressed program table, shared by every execution context
pub struct ProgramRegistry {
    programs: Mutex<HashMap<String, ProgramMain>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self {
            programs: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, path: &str, main: ProgramMain) {
        self.programs
            .lock()
            .expect("program registry lock poisoned")
            .insert(path.to_string(), main);
    }

    pub fn resolve(&self, path: &str) -> Result<ProgramMain, ApiError> {
        self.programs
            .lock()
            .expect("program registry lock poisoned")
            .get(path)
            .copied()
            .ok_or_else(|| ApiError::not_found(format!("program not reachable: {path}")))
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .programs
            .lock()
            .expect("program registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

impl Default for ProgramRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn nop(_isolate: Rc<Isolate>, _argv: Vec<String>) -> LocalBoxFuture<'static, i32> {
        async { 0 }.boxed_local()
    }

    #[test]
    fn test_register_and_resolve() {
        let registry = ProgramRegistry::new();
        registry.register("/bin/true", nop);

        assert!(registry.resolve("/bin/true").is_ok());
        assert_eq!(registry.paths(), vec!["/bin/true".to_string()]);
    }

    #[test]
    fn test_unknown_program_is_not_reachable() {
        let registry = ProgramRegistry::new();
        let err = registry.resolve("/bin/absent").unwrap_err();
        assert!(err.message.contains("program not reachable"));
    }
}
