//! A shell that forks a subshell and reaps it.

use anyhow::Result;
use forktrace::diagram::{Diagram, DiagramOpts};
use forktrace::event::EventKind;
use forktrace::process::ProcState;
use ntest::timeout;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn traces_a_fork_and_reap() -> Result<()> {
    let (tracer, root) = trace("/bin/sh", &["/bin/sh", "-c", "(exit 0)"])?;

    let child = only_child(&tracer, root);
    assert_eq!(tracer.tree().get(child).state(), ProcState::Reaped);
    assert!(!tracer.tree().get(child).killed());

    // The parent observed the child through one wait that became a reap.
    // Some shells also poll with WNOHANG around the real wait; those may
    // linger as failed/empty waits, but no *blocking* wait may survive.
    let parent_events = events(&tracer, root);
    let reaps = parent_events
        .iter()
        .filter(|kind| matches!(kind, EventKind::Reap { .. }))
        .count();
    let pending_blocking_waits = parent_events
        .iter()
        .filter(|kind| matches!(kind, EventKind::Wait(wait) if wait.error == 0 && !wait.nohang))
        .count();
    assert_eq!(reaps, 1, "events: {parent_events:?}");
    assert_eq!(pending_blocking_waits, 0, "events: {parent_events:?}");
    assert!(matches!(parent_events.last(), Some(EventKind::Exit { status: 0 })));

    // The reap points back at the child, which ends with its exit.
    let reap_child = parent_events.iter().find_map(|kind| match kind {
        EventKind::Reap { child, .. } => Some(*child),
        _ => None,
    });
    assert_eq!(reap_child, Some(child));
    let child_events = events(&tracer, child);
    assert!(
        matches!(child_events.last(), Some(EventKind::Exit { status: 0 })),
        "child events: {child_events:?}"
    );

    // Child inherits the parent's post-exec identity.
    assert!(tracer.tree().get(child).command_line(None).contains("/bin/sh"));

    // One lane for the shell, one for the subshell.
    let diagram = Diagram::new(tracer.tree(), root, DiagramOpts::default());
    assert_eq!(diagram.lane_count(), 2);
    Ok(())
}
