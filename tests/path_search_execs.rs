//! libc's $PATH search issues one failed execve per directory until one
//! sticks; consecutive attempts for the same program collapse into a
//! single exec event.

use anyhow::Result;
use forktrace::event::EventKind;
use ntest::timeout;

mod support;
use support::*;

#[test]
#[timeout(10000)]
fn path_search_attempts_merge_into_one_exec() -> Result<()> {
    // Prepend a directory that can't exist so the first execve fails with
    // ENOENT before the real one succeeds.
    let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".into());
    std::env::set_var("PATH", format!("/nonexistent-forktrace-dir:{path}"));

    let (tracer, root) = trace("true", &["true"])?;

    let events = events(&tracer, root);
    let execs: Vec<_> = events
        .iter()
        .filter_map(|kind| match kind {
            EventKind::Exec { calls, .. } => Some(calls),
            _ => None,
        })
        .collect();
    assert_eq!(execs.len(), 1, "attempts should coalesce: {events:?}");

    let calls = execs[0];
    assert!(calls.len() >= 2, "expected several attempts: {calls:?}");
    assert_eq!(calls.first().unwrap().errcode, libc::ENOENT);
    assert!(calls.first().unwrap().file.starts_with("/nonexistent-forktrace-dir"));
    assert_eq!(calls.last().unwrap().errcode, 0);
    Ok(())
}
