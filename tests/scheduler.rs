//! Scheduler behavior: delays, self-transition options, lifecycle and
//! exit broadcast.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use sequencer::bus::{Type, Value};
use sequencer::{
    ChanDef, ProgOptions, ProgramDef, StateDef, StateOptions, StateSetDef, Transition, VarId,
    registry,
};

use self::common::{idle_ss, join_within, membus, program, spawn_run};

/// Two state sets asleep on infinite waits wake on the exit broadcast
/// and terminate.
#[test]
fn test_exit_broadcast_terminates_sleepers() {
    let bus = membus();
    let def = ProgramDef::new("exit")
        .state_set(idle_ss("one"))
        .state_set(idle_ss("two"));
    let prog = program(def, &bus);

    let handle = spawn_run(&prog);
    thread::sleep(Duration::from_millis(100));
    assert!(!handle.is_finished());

    prog.request_exit();
    join_within(handle, Duration::from_secs(5));
}

fn timer_program(options: StateOptions, elapsed: Arc<Mutex<Option<Duration>>>) -> ProgramDef {
    let fired = AtomicUsize::new(0);

    let work = StateDef::new("work")
        .options(options)
        .event(move |ss| {
            if ss.delay(0.3) {
                return Some(Transition {
                    next_state: 1,
                    trans_num: 1,
                });
            }

            if fired.load(Ordering::SeqCst) == 0 && ss.delay(0.1) {
                fired.store(1, Ordering::SeqCst);
                return Some(Transition {
                    next_state: 0,
                    trans_num: 0,
                });
            }

            None
        });

    let start = Instant::now();
    let done = StateDef::new("done").entry(move |ss| {
        *elapsed.lock().unwrap() = Some(start.elapsed());
        ss.exit();
    });

    ProgramDef::new("timers").state_set(
        StateSetDef::new("main")
            .delays(2)
            .state(work)
            .state(done),
    )
}

/// With NORESETTIMERS a self-transition keeps measuring delays from the
/// first entry into the state.
#[test]
fn test_self_transition_keeps_timers_with_noresettimers() {
    let bus = membus();
    let elapsed = Arc::new(Mutex::new(None));
    let def = timer_program(StateOptions::NORESETTIMERS, elapsed.clone());
    let prog = program(def, &bus);

    let handle = spawn_run(&prog);
    join_within(handle, Duration::from_secs(5));

    let elapsed = elapsed.lock().unwrap().expect("program finished");
    assert!(
        elapsed >= Duration::from_millis(280) && elapsed < Duration::from_millis(380),
        "elapsed {elapsed:?}"
    );
}

/// Without NORESETTIMERS the self-transition restarts the delay base.
#[test]
fn test_self_transition_resets_timers_by_default() {
    let bus = membus();
    let elapsed = Arc::new(Mutex::new(None));
    let def = timer_program(StateOptions::NONE, elapsed.clone());
    let prog = program(def, &bus);

    let handle = spawn_run(&prog);
    join_within(handle, Duration::from_secs(5));

    let elapsed = elapsed.lock().unwrap().expect("program finished");
    assert!(
        elapsed >= Duration::from_millis(380) && elapsed < Duration::from_millis(800),
        "elapsed {elapsed:?}"
    );
}

fn entry_exit_program(options: StateOptions) -> (ProgramDef, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let entries = Arc::new(AtomicUsize::new(0));
    let exits = Arc::new(AtomicUsize::new(0));
    let evals = AtomicUsize::new(0);

    let first = StateDef::new("first")
        .options(options)
        .entry({
            let entries = entries.clone();
            move |_ss| {
                entries.fetch_add(1, Ordering::SeqCst);
            }
        })
        .exit({
            let exits = exits.clone();
            move |_ss| {
                exits.fetch_add(1, Ordering::SeqCst);
            }
        })
        .event(move |_ss| {
            let k = evals.fetch_add(1, Ordering::SeqCst);

            Some(Transition {
                next_state: if k < 2 { 0 } else { 1 },
                trans_num: 0,
            })
        });

    let done = StateDef::new("done").entry(|ss| ss.exit());

    let def = ProgramDef::new("entryexit")
        .state_set(StateSetDef::new("main").state(first).state(done));

    (def, entries, exits)
}

#[test]
fn test_self_transition_skips_entry_exit_by_default() {
    let bus = membus();
    let (def, entries, exits) = entry_exit_program(StateOptions::NONE);
    let prog = program(def, &bus);

    let handle = spawn_run(&prog);
    join_within(handle, Duration::from_secs(5));

    // One initial entry; one exit when finally leaving.
    assert_eq!(entries.load(Ordering::SeqCst), 1);
    assert_eq!(exits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_self_transition_runs_entry_exit_when_opted_in() {
    let bus = membus();
    let (def, entries, exits) = entry_exit_program(
        StateOptions::DOENTRYFROMSELF | StateOptions::DOEXITTOSELF,
    );
    let prog = program(def, &bus);

    let handle = spawn_run(&prog);
    join_within(handle, Duration::from_secs(5));

    // Initial entry plus one per self-transition; exit on both
    // self-transitions and on the final leave.
    assert_eq!(entries.load(Ordering::SeqCst), 3);
    assert_eq!(exits.load(Ordering::SeqCst), 3);
}

/// Global entry runs before the state sets, global exit after they have
/// all terminated, and the registry tracks the program for its lifetime.
#[test]
fn test_lifecycle_order_and_registry() {
    let bus = membus();
    let order = Arc::new(Mutex::new(Vec::new()));

    let def = ProgramDef::new("lifecycle")
        .chan(ChanDef::new("x", Type::Int))
        .init(|vars| vars.set(VarId::new(0), Value::int(5)))
        .entry({
            let order = order.clone();
            move |ss| {
                order.lock().unwrap().push(format!("entry:{}", ss.var(VarId::new(0)).as_long().unwrap()));
            }
        })
        .exit({
            let order = order.clone();
            move |_ss| {
                order.lock().unwrap().push("exit".to_owned());
            }
        })
        .state_set(StateSetDef::new("main").state(StateDef::new("idle").entry({
            let order = order.clone();
            move |_ss| {
                order.lock().unwrap().push("state".to_owned());
            }
        })));

    let prog = program(def, &bus);
    let handle = spawn_run(&prog);

    // The program is registered while it runs.
    let deadline = Instant::now() + Duration::from_secs(5);

    while registry::find_by_name("lifecycle", 0).is_none() {
        assert!(Instant::now() < deadline, "program never registered");
        thread::sleep(Duration::from_millis(5));
    }

    prog.request_exit();
    join_within(handle, Duration::from_secs(5));

    assert!(registry::find_by_name("lifecycle", 0).is_none());
    assert_eq!(
        order.lock().unwrap().as_slice(),
        &["entry:5", "state", "exit"]
    );
}

/// With the CONN option the program waits for every assigned channel to
/// connect before any state set runs.
#[test]
fn test_connection_gate() {
    let bus = membus();
    let def = ProgramDef::new("gate")
        .options(ProgOptions::CONN)
        .chan(ChanDef::new("x", Type::Int).named("pv:x"))
        .state_set(
            StateSetDef::new("main").state(StateDef::new("leave").entry(|ss| ss.exit())),
        );
    let prog = program(def, &bus);

    let handle = spawn_run(&prog);
    thread::sleep(Duration::from_millis(150));
    assert!(!handle.is_finished(), "program ran before connections");

    bus.connect_all();
    join_within(handle, Duration::from_secs(5));
}

/// Parameters reach generated code through the macro-value lookup, with
/// run-time parameters overriding the table defaults.
#[test]
fn test_mac_value_lookup() {
    let bus = membus();
    let def = ProgramDef::new("params")
        .params("unit=1,host=left")
        .state_set(idle_ss("main"));

    common::init_tracing();
    let prog = sequencer::Program::new(def, "unit=7", bus.clone()).expect("program");
    let ss = prog.state_set(0);

    assert_eq!(ss.mac_value_get("unit"), Some("7"));
    assert_eq!(ss.mac_value_get("host"), Some("left"));
    assert_eq!(ss.mac_value_get("missing"), None);

    assert!(!ss.opt_get("s"));
    assert!(!ss.opt_get("a"));
}
