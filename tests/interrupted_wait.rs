//! A signal that interrupts a blocking wait makes the kernel restart the
//! call (visible to us as ERESTARTSYS); the restarted wait must merge
//! back into the original so only one wait is ever recorded.

use std::time::Duration;

use anyhow::Result;
use forktrace::event::EventKind;
use forktrace::tracer::{Control, Tracer};
use ntest::timeout;

mod support;
use support::*;

#[test]
#[timeout(20000)]
fn interrupted_wait_is_merged() -> Result<()> {
    forktrace::log::init();
    let control = Control::new(false);
    let mut tracer = Tracer::new(control, true);

    // The shell blocks in wait4 on the sleeping subshell.
    let root = tracer.start(
        "/bin/sh",
        vec!["/bin/sh".into(), "-c".into(), "sleep 1 & wait".into()],
    )?;
    let shell_pid = tracer.tree().get(root).pid();

    // Poke the waiting shell with a (default-ignored) SIGWINCH once it has
    // had time to settle into the wait.
    let poker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        unsafe {
            libc::kill(shell_pid, libc::SIGWINCH);
        }
    });

    while tracer.step()? {}
    poker.join().unwrap();

    let events = events(&tracer, root);

    // The interruption was observed...
    assert!(
        events.iter().any(|kind| matches!(
            kind,
            EventKind::Signal { signal, killed: false, .. } if *signal == libc::SIGWINCH
        )),
        "events: {events:?}"
    );

    // ...but the interrupted wait merged with its restart instead of
    // splitting: no wait abandoned with the kernel's restart marker, and
    // the one real wait became the reap.
    let restart_marked = events.iter().any(|kind| {
        matches!(
            kind,
            EventKind::Wait(wait) if wait.error == forktrace::syscalls::ERESTARTSYS
        )
    });
    let reaps = events
        .iter()
        .filter(|kind| matches!(kind, EventKind::Reap { .. }))
        .count();
    assert!(!restart_marked, "events: {events:?}");
    assert_eq!(reaps, 1, "events: {events:?}");
    Ok(())
}
