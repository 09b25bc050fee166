//! A shell that SIGKILLs its own child: both halves of the send should be
//! recorded and share one descriptor.

use anyhow::Result;
use forktrace::event::EventKind;
use forktrace::process::ProcState;
use ntest::timeout;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn traces_a_kill_pair() -> Result<()> {
    let (tracer, root) = trace("/bin/sh", &["/bin/sh", "-c", "sleep 60 & kill -9 $!; wait"])?;

    let child = only_child(&tracer, root);
    let child_node = tracer.tree().get(child);
    assert_eq!(child_node.state(), ProcState::Reaped);
    assert!(child_node.killed(), "child should have died to the signal");

    let parent_events = events(&tracer, root);
    let sender = parent_events.iter().find_map(|kind| match kind {
        EventKind::Kill { info, sender: true } => Some(info.clone()),
        _ => None,
    });
    let sender = sender.expect("parent records the sending half");
    assert_eq!(sender.signal, libc::SIGKILL);
    assert!(!sender.to_thread);

    let child_events = events(&tracer, child);
    let receiver = child_events.iter().find_map(|kind| match kind {
        EventKind::Kill { info, sender: false } => Some(info.clone()),
        _ => None,
    });
    let receiver = receiver.expect("child records the receiving half");
    assert!(
        std::rc::Rc::ptr_eq(&sender, &receiver),
        "both halves share one descriptor"
    );

    // The fatal delivery is the child's terminal event.
    assert!(
        matches!(
            child_events.last(),
            Some(EventKind::Signal { signal, killed: true, .. }) if *signal == libc::SIGKILL
        ),
        "child events: {child_events:?}"
    );

    // And the parent still got to reap the corpse.
    assert!(parent_events
        .iter()
        .any(|kind| matches!(kind, EventKind::Reap { child: c, .. } if *c == child)));
    Ok(())
}
