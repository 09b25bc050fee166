#![allow(dead_code)] // not every scenario uses every helper

use anyhow::Result;
use forktrace::event::EventKind;
use forktrace::process::ProcessId;
use forktrace::tracer::{Control, Tracer};

/// Trace `program` from start to finish without a reaper helper and hand
/// back the tracer (for the tree) and the root process.
pub fn trace(program: &str, args: &[&str]) -> Result<(Tracer, ProcessId)> {
    forktrace::log::init();
    let control = Control::new(false);
    let mut tracer = Tracer::new(control, true);
    let argv: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
    let root = tracer.start(program, argv)?;
    while tracer.step()? {}
    Ok((tracer, root))
}

/// The events of one process, for terse matching.
pub fn events(tracer: &Tracer, id: ProcessId) -> Vec<&EventKind> {
    tracer.tree().get(id).events().iter().map(|e| &e.kind).collect()
}

/// The single fork child of a process. Panics if there isn't exactly one.
#[allow(dead_code)]
pub fn only_child(tracer: &Tracer, id: ProcessId) -> ProcessId {
    let children: Vec<ProcessId> = tracer
        .tree()
        .get(id)
        .events()
        .iter()
        .filter_map(|event| match &event.kind {
            EventKind::Fork { child } => Some(*child),
            _ => None,
        })
        .collect();
    assert_eq!(children.len(), 1, "expected exactly one fork");
    children[0]
}
