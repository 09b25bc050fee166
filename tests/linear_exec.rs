//! A program that execs once and exits: the simplest possible trace.

use anyhow::Result;
use forktrace::event::EventKind;
use forktrace::process::ProcState;
use ntest::timeout;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn traces_a_linear_exec() -> Result<()> {
    let (tracer, root) = trace("/bin/true", &["/bin/true"])?;

    let node = tracer.tree().get(root);
    assert_eq!(node.state(), ProcState::Zombie);
    assert!(!node.killed());

    // The tracer reaped the leader itself, so it's out of the live map.
    assert!(!tracer.tracees_alive());
    assert!(tracer.find(node.pid()).is_none());

    let events = events(&tracer, root);
    assert_eq!(events.len(), 2, "expected exec + exit, got {events:?}");
    match events[0] {
        EventKind::Exec { calls, args } => {
            assert_eq!(calls.last().unwrap().errcode, 0);
            assert_eq!(calls.last().unwrap().file, "/bin/true");
            assert_eq!(args, &["/bin/true"]);
        }
        other => panic!("expected exec, got {other:?}"),
    }
    match events[1] {
        EventKind::Exit { status } => assert_eq!(*status, 0),
        other => panic!("expected exit, got {other:?}"),
    }
    Ok(())
}
