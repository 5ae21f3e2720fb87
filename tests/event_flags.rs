//! Event flag semantics: set/test/clear/test-and-clear and wake-up.

mod common;

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use sequencer::{EvId, ProgramDef, StateDef, StateSetDef, Transition};

use self::common::{idle_ss, join_within, membus, program, spawn_run};

#[test]
fn test_set_test_and_clear() {
    let bus = membus();
    let def = ProgramDef::new("flags").ev_flags(2).state_set(idle_ss("main"));
    let prog = program(def, &bus);
    let mut ss = prog.state_set(0);

    let f = EvId::new(1);

    assert!(!ss.ef_test(f));

    ss.ef_set(f);
    assert!(ss.ef_test(f));
    // Testing does not clear.
    assert!(ss.ef_test(f));

    assert!(ss.ef_test_and_clear(f));
    assert!(!ss.ef_test(f));
    assert!(!ss.ef_test_and_clear(f));
}

#[test]
fn test_clear_returns_previous_value() {
    let bus = membus();
    let def = ProgramDef::new("flags").ev_flags(1).state_set(idle_ss("main"));
    let prog = program(def, &bus);
    let ss = prog.state_set(0);

    let f = EvId::new(1);

    ss.ef_set(f);
    assert!(ss.ef_clear(f));
    assert!(!ss.ef_clear(f));
}

#[test]
fn test_flags_are_independent() {
    let bus = membus();
    let def = ProgramDef::new("flags").ev_flags(3).state_set(idle_ss("main"));
    let prog = program(def, &bus);
    let mut ss = prog.state_set(0);

    ss.ef_set(EvId::new(2));

    assert!(!ss.ef_test(EvId::new(1)));
    assert!(ss.ef_test(EvId::new(2)));
    assert!(!ss.ef_test(EvId::new(3)));
}

#[test]
#[should_panic(expected = "out of range")]
fn test_flag_zero_rejected() {
    let bus = membus();
    let def = ProgramDef::new("flags").ev_flags(1).state_set(idle_ss("main"));
    let prog = program(def, &bus);

    prog.state_set(0).ef_set(EvId::NONE);
}

#[test]
#[should_panic(expected = "out of range")]
fn test_flag_beyond_range_rejected() {
    let bus = membus();
    let def = ProgramDef::new("flags").ev_flags(1).state_set(idle_ss("main"));
    let prog = program(def, &bus);

    prog.state_set(0).ef_set(EvId::new(2));
}

/// A state set sleeping on a flag is woken by `ef_set` from another
/// state set and sees the flag through `ef_test_and_clear`.
#[test]
fn test_set_wakes_waiting_state_set() {
    let bus = membus();
    let order = Arc::new(Mutex::new(Vec::new()));
    let f = EvId::new(1);

    let waiter = {
        let order = order.clone();
        StateSetDef::new("waiter")
            .state(
                StateDef::new("wait").mask([1]).event(move |ss| {
                    ss.ef_test_and_clear(f).then_some(Transition {
                        next_state: 1,
                        trans_num: 0,
                    })
                }),
            )
            .state(StateDef::new("done").entry(move |ss| {
                order.lock().unwrap().push("woken");
                ss.exit();
            }))
    };

    let setter = {
        let order = order.clone();
        StateSetDef::new("setter")
            .delays(1)
            .state(StateDef::new("arm").event(move |ss| {
                if ss.delay(0.05) {
                    order.lock().unwrap().push("set");
                    ss.ef_set(f);
                    return Some(Transition {
                        next_state: 1,
                        trans_num: 0,
                    });
                }

                None
            }))
            .state(StateDef::new("idle"))
    };

    let def = ProgramDef::new("wakeup")
        .ev_flags(1)
        .state_set(waiter)
        .state_set(setter);

    let prog = program(def, &bus);
    let handle = spawn_run(&prog);
    join_within(handle, Duration::from_secs(5));

    assert_eq!(order.lock().unwrap().as_slice(), &["set", "woken"]);
}
