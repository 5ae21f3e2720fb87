//! Process-wide table of live programs.
//!
//! Each running program is keyed by its name and by the thread identity
//! of its first state set. Entries hold weak references: a program that
//! has finished cannot be revived through the registry.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::ThreadId;

use crate::program::Program;

struct Entry {
    name: String,
    thread: ThreadId,
    prog: Weak<Program>,
}

static REGISTRY: OnceLock<Mutex<Vec<Entry>>> = OnceLock::new();

fn registry() -> MutexGuard<'static, Vec<Entry>> {
    REGISTRY
        .get_or_init(|| Mutex::new(Vec::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn register(prog: &Arc<Program>, thread: ThreadId) {
    let mut reg = registry();
    reg.retain(|e| e.prog.strong_count() > 0);
    reg.push(Entry {
        name: prog.name().to_owned(),
        thread,
        prog: Arc::downgrade(prog),
    });
}

pub(crate) fn unregister(prog: &Arc<Program>) {
    let target = Arc::downgrade(prog);
    registry().retain(|e| !Weak::ptr_eq(&e.prog, &target));
}

/// Find the `instance`-th live program named `name`.
pub fn find_by_name(name: &str, instance: usize) -> Option<Arc<Program>> {
    registry()
        .iter()
        .filter(|e| e.name == name)
        .filter_map(|e| e.prog.upgrade())
        .nth(instance)
}

/// Find the live program whose first state set runs on `thread`.
pub fn find_by_thread(thread: ThreadId) -> Option<Arc<Program>> {
    registry()
        .iter()
        .find(|e| e.thread == thread)
        .and_then(|e| e.prog.upgrade())
}
