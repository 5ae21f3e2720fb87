#![allow(dead_code)]

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use sequencer::bus::mem::MemBus;
use sequencer::{Program, ProgramDef, StateDef, StateSetDef};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn membus() -> Arc<MemBus> {
    Arc::new(MemBus::new())
}

pub fn program(def: ProgramDef, bus: &Arc<MemBus>) -> Arc<Program> {
    init_tracing();
    Program::new(def, "", bus.clone()).expect("program construction")
}

/// A state set that sits in one idle state forever.
pub fn idle_ss(name: &str) -> StateSetDef {
    StateSetDef::new(name).state(StateDef::new("idle"))
}

/// Run the program on a spawned thread and return the handle.
pub fn spawn_run(prog: &Arc<Program>) -> JoinHandle<()> {
    let prog = prog.clone();
    std::thread::spawn(move || prog.run().expect("program run"))
}

/// Wait until the handle finishes, panicking after `timeout`.
pub fn join_within(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;

    while !handle.is_finished() {
        assert!(
            Instant::now() < deadline,
            "program did not terminate within {timeout:?}"
        );
        std::thread::sleep(Duration::from_millis(5));
    }

    handle.join().expect("program thread");
}
