//! The process-lineage model.
//!
//! All processes live in one arena owned by [`ProcessTree`]; everything
//! else refers to them through [`ProcessId`] handles. Handles stay valid
//! for the life of the tree, so dropping a tracee from the driver's map
//! never invalidates anything, and parent/child references can't form
//! ownership cycles.
//!
//! Each process carries an append-only event log. Appending requires the
//! process to be alive; once it has ended, the only permitted changes are
//! the in-place promotions (wait to reap, non-fatal signal to fatal, extra
//! exec attempts, wait error codes).

use std::rc::Rc;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::{Event, EventKind, ExecCall, KillInfo, SourceLocation, WaitData};
use crate::syscalls::ERESTARTSYS;
use crate::util::{base_name, escaped, join};

/// Handle to a process node. Only meaningful with the tree that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ProcessId(usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ProcState {
    Alive,
    Zombie,
    Reaped,
    Orphaned,
}

/// How a process ended, decoded from its wait status.
#[derive(Clone, Copy, Debug)]
pub enum Ended {
    Exited(i32),
    Signaled(i32),
}

pub struct Process {
    pid: i32,
    parent: Option<ProcessId>,
    state: ProcState,
    killed: bool,
    events: Vec<Event>,
    location: Option<SourceLocation>,

    // The command line before any execs, frozen at creation.
    initial_name: String,
    initial_args: Vec<String>,
}

impl Process {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// The parent handle. For navigation only; ownership flows strictly
    /// down the fork events.
    pub fn parent(&self) -> Option<ProcessId> {
        self.parent
    }

    pub fn state(&self) -> ProcState {
        self.state
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            ProcState::Alive => "alive",
            ProcState::Zombie => "zombie",
            ProcState::Reaped => "reaped",
            ProcState::Orphaned => "orphaned",
        }
    }

    pub fn killed(&self) -> bool {
        self.killed
    }

    pub fn dead(&self) -> bool {
        self.state != ProcState::Alive
    }

    pub fn reaped(&self) -> bool {
        self.state == ProcState::Reaped
    }

    pub fn orphaned(&self) -> bool {
        self.state == ProcState::Orphaned
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event(&self, index: usize) -> &Event {
        &self.events[index]
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Reverse-search for the most recent successful exec strictly before
    /// `before` (or in the whole log if `None`).
    fn most_recent_exec(&self, before: Option<usize>) -> Option<&Event> {
        let end = before.unwrap_or(self.events.len());
        self.events[..end].iter().rev().find(|event| {
            matches!(
                &event.kind,
                EventKind::Exec { calls, .. }
                    if calls.last().is_some_and(|c| c.errcode == 0)
            )
        })
    }

    /// The process's command line as of event index `before` (the whole
    /// history if `None`), formatted `name [ args... ]`.
    pub fn command_line(&self, before: Option<usize>) -> String {
        match self.most_recent_exec(before) {
            Some(event) => match &event.kind {
                EventKind::Exec { calls, args } => {
                    format!("{} [ {} ]", calls.last().unwrap().file, join(args))
                }
                _ => unreachable!(),
            },
            None => format!("{} [ {} ]", self.initial_name, join(&self.initial_args)),
        }
    }
}

/// Helper for the invariant checks: a failed check is a tracer bug, not a
/// tracee misbehaviour, and surfaces as `Error::ProcessTree`.
macro_rules! tree_assert {
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(Error::ProcessTree(format!($($arg)*)));
        }
    };
}

#[derive(Default)]
pub struct ProcessTree {
    nodes: Vec<Process>,

    /// Whether consecutive failed execs of the same program are coalesced.
    pub merge_execs: bool,
}

impl ProcessTree {
    pub fn new(merge_execs: bool) -> Self {
        Self {
            nodes: Vec::new(),
            merge_execs,
        }
    }

    pub fn get(&self, id: ProcessId) -> &Process {
        &self.nodes[id.0]
    }

    fn node(&mut self, id: ProcessId) -> &mut Process {
        &mut self.nodes[id.0]
    }

    /// Create a root process (no traced parent) with a known command line.
    pub fn new_root(&mut self, pid: i32, name: String, args: Vec<String>) -> ProcessId {
        self.insert(Process {
            pid,
            parent: None,
            state: ProcState::Alive,
            killed: false,
            events: Vec::new(),
            location: None,
            initial_name: name,
            initial_args: args,
        })
    }

    /// Create a process forked by a traced parent. The child inherits its
    /// initial command line from the parent's most recent successful exec,
    /// or from the parent's own initial values.
    pub fn new_child(&mut self, pid: i32, parent: ProcessId) -> ProcessId {
        let parent_node = self.get(parent);
        let (name, args) = match parent_node.most_recent_exec(None) {
            Some(event) => match &event.kind {
                EventKind::Exec { calls, args } => {
                    (calls.last().unwrap().file.clone(), args.clone())
                }
                _ => unreachable!(),
            },
            None => (
                parent_node.initial_name.clone(),
                parent_node.initial_args.clone(),
            ),
        };
        self.insert(Process {
            pid,
            parent: Some(parent),
            state: ProcState::Alive,
            killed: false,
            events: Vec::new(),
            location: None,
            initial_name: name,
            initial_args: args,
        })
    }

    fn insert(&mut self, process: Process) -> ProcessId {
        self.nodes.push(process);
        ProcessId(self.nodes.len() - 1)
    }

    /// Append an event, logging it. `consume_location` moves the pending
    /// source location (if any) into the event.
    fn add_event(&mut self, id: ProcessId, kind: EventKind, consume_location: bool) -> Result<()> {
        tree_assert!(
            self.get(id).state == ProcState::Alive,
            "({}) event {:?} delivered to a process that isn't alive",
            self.get(id).pid,
            kind
        );
        let mut event = Event::new(kind);
        if consume_location {
            event.location = self.node(id).location.take();
        }
        match &event.location {
            Some(loc) => info!("{} @ {}", event.describe(self, id), loc),
            None => info!("{}", event.describe(self, id)),
        }
        self.node(id).events.push(event);
        Ok(())
    }

    /// A wait call has begun. If the most recent wait was interrupted
    /// with ERESTARTSYS, this is the kernel retrying it, and the two are
    /// merged back into one pending wait. The delivery of the interrupting
    /// signal itself sits between the two stops (exit-stop first, then
    /// signal-delivery-stop, then the restarted entry), so trailing signal
    /// events are looked through; anything more substantial in between
    /// (a handler forked or execed) keeps the waits separate.
    pub fn notify_waiting(&mut self, id: ProcessId, waited_id: i32, nohang: bool) -> Result<()> {
        let pid = self.get(id).pid;
        let restarted = self
            .get(id)
            .events
            .iter()
            .rev()
            .find(|event| !matches!(event.kind, EventKind::Signal { .. }))
            .is_some_and(|event| {
                matches!(&event.kind, EventKind::Wait(wait) if wait.error == ERESTARTSYS)
            });
        if restarted {
            let index = self
                .get(id)
                .events
                .iter()
                .rposition(|event| matches!(event.kind, EventKind::Wait(_)))
                .expect("a wait event is present");
            if let EventKind::Wait(wait) = &mut self.node(id).events[index].kind {
                tree_assert!(
                    wait.waited_id == waited_id && wait.nohang == nohang,
                    "({pid}) restarted wait has different parameters \
                     ({waited_id}, nohang={nohang}) vs ({}, nohang={})",
                    wait.waited_id,
                    wait.nohang
                );
                debug!("({pid}) merging event for restarted wait call");
                wait.error = 0;
            }
            return Ok(());
        }
        self.add_event(
            id,
            EventKind::Wait(WaitData {
                waited_id,
                nohang,
                error: 0,
            }),
            true,
        )
    }

    /// The wait that `notify_waiting` announced has failed. Writes the
    /// error into the pending WaitEvent in place.
    pub fn notify_failed_wait(&mut self, id: ProcessId, error: i32) -> Result<()> {
        let pid = self.get(id).pid;
        for index in (0..self.get(id).events.len()).rev() {
            if let EventKind::Wait(wait) = &self.get(id).events[index].kind {
                tree_assert!(
                    wait.error == 0,
                    "({pid}) notify_failed_wait: the previous wait already failed"
                );
                if let EventKind::Wait(wait) = &mut self.node(id).events[index].kind {
                    wait.error = error;
                }
                let line = self.get(id).events[index].describe(self, id);
                info!("{line}");
                return Ok(());
            }
        }
        Err(Error::ProcessTree(format!(
            "({pid}) notify_failed_wait: no wait event to fail"
        )))
    }

    /// The wait that `notify_waiting` announced has reaped `child`. The
    /// pending WaitEvent is promoted in place to a ReapEvent that owns it,
    /// and the child moves Zombie -> Reaped.
    pub fn notify_reaped(&mut self, id: ProcessId, child: ProcessId) -> Result<()> {
        let pid = self.get(id).pid;
        tree_assert!(
            self.get(child).state == ProcState::Zombie,
            "({pid}) reaped process {} which is {}",
            self.get(child).pid,
            self.get(child).state_name()
        );
        self.node(child).state = ProcState::Reaped;

        for index in (0..self.get(id).events.len()).rev() {
            if let EventKind::Wait(wait) = &self.get(id).events[index].kind {
                tree_assert!(
                    wait.error == 0,
                    "({pid}) notify_reaped: the pending wait already failed"
                );
                let wait = wait.clone();
                // Promote in place; the reap inherits the wait's location.
                self.node(id).events[index].kind = EventKind::Reap { child, wait };
                let line = self.get(id).events[index].describe(self, id);
                info!("{line}");
                return Ok(());
            }
        }
        Err(Error::ProcessTree(format!(
            "({pid}) notify_reaped: no wait event led to the reap"
        )))
    }

    pub fn notify_forked(&mut self, id: ProcessId, child: ProcessId) -> Result<()> {
        self.add_event(id, EventKind::Fork { child }, true)
    }

    /// Record an exec attempt, merging into the previous event when it was
    /// a failed exec of the same program (same basename) with the same
    /// argv. That collapses libc's $PATH search into one event.
    pub fn notify_exec(
        &mut self,
        id: ProcessId,
        file: String,
        args: Vec<String>,
        errcode: i32,
    ) -> Result<()> {
        let file = escaped(&file);
        let args: Vec<String> = args.iter().map(|a| escaped(a)).collect();

        if self.merge_execs {
            let mergeable = match self.get(id).events.last() {
                Some(Event {
                    kind:
                        EventKind::Exec {
                            calls,
                            args: prev_args,
                        },
                    ..
                }) => {
                    let prev = calls.last().expect("exec event with no calls");
                    prev.errcode != 0
                        && *prev_args == args
                        && base_name(&prev.file) == base_name(&file)
                }
                _ => false,
            };
            if mergeable {
                if let Some(Event {
                    kind: EventKind::Exec { calls, .. },
                    ..
                }) = self.node(id).events.last_mut()
                {
                    calls.push(ExecCall { file, errcode });
                }
                let line = self.get(id).events.last().unwrap().describe(self, id);
                info!("{line}");
                return Ok(());
            }
        }

        self.add_event(
            id,
            EventKind::Exec {
                calls: vec![ExecCall { file, errcode }],
                args,
            },
            true,
        )
    }

    /// The process has ended. If it was killed and the most recent event is
    /// a SignalEvent delivering the killing signal, that event is promoted
    /// in place instead of appending a new one.
    pub fn notify_ended(&mut self, id: ProcessId, how: Ended) -> Result<()> {
        match how {
            Ended::Exited(status) => {
                self.add_event(id, EventKind::Exit { status }, false)?;
                // Must come after add_event, which requires Alive.
                self.node(id).state = ProcState::Zombie;
            }
            Ended::Signaled(signal) => {
                if let Some(Event {
                    kind:
                        EventKind::Signal {
                            signal: sig,
                            killed,
                            ..
                        },
                    ..
                }) = self.node(id).events.last_mut()
                {
                    if *sig == signal {
                        *killed = true;
                        let node = self.node(id);
                        node.killed = true;
                        node.state = ProcState::Zombie;
                        let line = self.get(id).events.last().unwrap().describe(self, id);
                        info!("{line}");
                        return Ok(());
                    }
                }
                self.add_event(
                    id,
                    EventKind::Signal {
                        origin: -1,
                        signal,
                        killed: true,
                    },
                    false,
                )?;
                let node = self.node(id);
                node.state = ProcState::Zombie;
                node.killed = true;
            }
        }
        Ok(())
    }

    /// The process received a signal. Whether it proves fatal is learned
    /// later, via `notify_ended`.
    pub fn notify_signaled(&mut self, id: ProcessId, origin: i32, signal: i32) -> Result<()> {
        self.add_event(
            id,
            EventKind::Signal {
                origin,
                signal,
                killed: false,
            },
            false,
        )
    }

    /// A signal send observed on `source`. When the destination is a
    /// different process in the tree, both sides get a KillEvent sharing
    /// one descriptor; otherwise the sender gets a lone RaiseEvent.
    ///
    /// Instant killers like SIGKILL can land before we get here, in which
    /// case the receiver's death event is already recorded and the
    /// receiver's KillEvent is inserted just before it.
    pub fn notify_sent_signal(
        &mut self,
        killed_id: i32,
        source: ProcessId,
        dest: Option<ProcessId>,
        signal: i32,
        to_thread: bool,
    ) -> Result<()> {
        let dest = dest.filter(|d| *d != source && self.get(*d).pid == killed_id);
        let Some(dest) = dest else {
            return self.add_event(
                source,
                EventKind::Raise {
                    killed_id,
                    signal,
                    to_thread,
                },
                true,
            );
        };

        let info = Rc::new(KillInfo {
            source,
            dest,
            signal,
            to_thread,
        });
        self.add_event(
            source,
            EventKind::Kill {
                info: Rc::clone(&info),
                sender: true,
            },
            true,
        )?;

        // The receiver's half bypasses add_event: the event was already
        // logged from the sender's side, and a synchronously-killed
        // receiver is dead, which add_event would reject.
        let event = Event::new(EventKind::Kill {
            info,
            sender: false,
        });
        let node = self.node(dest);
        if node.dead() {
            let last = node.events.len() - 1;
            node.events.insert(last, event);
        } else {
            node.events.push(event);
        }
        Ok(())
    }

    /// The reaper helper collected this process: its parent chain died
    /// without reaping it.
    pub fn notify_orphaned(&mut self, id: ProcessId) -> Result<()> {
        tree_assert!(
            self.get(id).state == ProcState::Zombie,
            "({}) orphaned but it is {}",
            self.get(id).pid,
            self.get(id).state_name()
        );
        self.node(id).state = ProcState::Orphaned;
        Ok(())
    }

    /// Park a source location on the process; the next location-eligible
    /// event consumes it.
    pub fn update_location(&mut self, id: ProcessId, location: SourceLocation) {
        debug!("{} got updated location {}", self.get(id).pid, location);
        self.node(id).location = Some(location);
    }

    pub fn describe(&self, id: ProcessId) -> String {
        let node = self.get(id);
        format!("{} {}", node.pid, node.command_line(None))
    }

    /// The event that ended this process, if it is dead.
    pub fn death_event(&self, id: ProcessId) -> Option<&Event> {
        let node = self.get(id);
        if node.dead() {
            node.events.last()
        } else {
            None
        }
    }

    /// Indented recursive dump of a process and its descendants, one line
    /// per event. Used by the `tree` command.
    pub fn format_tree(&self, id: ProcessId, indent: usize, out: &mut String) {
        let pad = "    ".repeat(indent);
        out.push_str(&format!("{}process {}\n", pad, self.get(id).pid));
        for event in self.get(id).events() {
            match &event.kind {
                EventKind::Exec { calls, args } if calls.len() > 1 => {
                    // Expand merged exec attempts one per line.
                    for call in calls {
                        let partial = Event::new(EventKind::Exec {
                            calls: vec![call.clone()],
                            args: args.clone(),
                        });
                        out.push_str(&format!("{}    {}\n", pad, partial.describe(self, id)));
                    }
                }
                _ => {
                    out.push_str(&format!("{}    {}\n", pad, event.describe(self, id)));
                }
            }
            if let EventKind::Fork { child } = &event.kind {
                self.format_tree(*child, indent + 2, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn tree() -> ProcessTree {
        ProcessTree::new(true)
    }

    fn root(tree: &mut ProcessTree) -> ProcessId {
        tree.new_root(100, "prog".into(), vec!["prog".into()])
    }

    #[test]
    fn events_append_only_while_alive() {
        let mut t = tree();
        let p = root(&mut t);
        t.notify_exec(p, "/bin/prog".into(), vec!["prog".into()], 0)
            .unwrap();
        t.notify_ended(p, Ended::Exited(0)).unwrap();
        assert_eq!(t.get(p).state(), ProcState::Zombie);

        // Appending to a zombie is a tracer bug.
        let err = t.notify_signaled(p, -1, 15).unwrap_err();
        assert!(matches!(err, Error::ProcessTree(_)));
        assert_eq!(t.get(p).event_count(), 2);
    }

    #[test]
    fn fork_back_reference_resolves() {
        let mut t = tree();
        let p = root(&mut t);
        let c = t.new_child(101, p);
        t.notify_forked(p, c).unwrap();

        assert_eq!(t.get(c).parent(), Some(p));
        let child = match &t.get(p).event(0).kind {
            EventKind::Fork { child } => *child,
            other => panic!("expected fork event, got {other:?}"),
        };
        assert_eq!(child, c);
        assert_eq!(t.get(child).pid(), 101);
    }

    #[test]
    fn child_inherits_parent_exec() {
        let mut t = tree();
        let p = root(&mut t);
        t.notify_exec(p, "/bin/sh".into(), vec!["sh".into(), "-c".into()], 0)
            .unwrap();
        let c = t.new_child(101, p);
        assert_eq!(t.get(c).command_line(None), "/bin/sh [ sh -c ]");
    }

    #[test]
    fn reap_promotes_the_pending_wait() {
        let mut t = tree();
        let p = root(&mut t);
        let c = t.new_child(101, p);
        t.notify_forked(p, c).unwrap();
        t.notify_waiting(p, -1, false).unwrap();
        t.notify_ended(c, Ended::Exited(0)).unwrap();
        t.notify_reaped(p, c).unwrap();

        assert_eq!(t.get(c).state(), ProcState::Reaped);
        assert_eq!(t.get(p).event_count(), 2); // fork + reap, no extra wait
        match &t.get(p).event(1).kind {
            EventKind::Reap { child, wait } => {
                assert_eq!(*child, c);
                assert_eq!(wait.waited_id, -1);
                assert!(!wait.nohang);
                assert_eq!(wait.error, 0);
            }
            other => panic!("expected reap, got {other:?}"),
        }
    }

    #[test]
    fn reaping_a_non_zombie_is_rejected() {
        let mut t = tree();
        let p = root(&mut t);
        let c = t.new_child(101, p);
        t.notify_forked(p, c).unwrap();
        t.notify_waiting(p, -1, false).unwrap();
        let err = t.notify_reaped(p, c).unwrap_err();
        assert!(matches!(err, Error::ProcessTree(_)));
    }

    #[test]
    fn orphaning_requires_a_zombie() {
        let mut t = tree();
        let p = root(&mut t);
        assert!(t.notify_orphaned(p).is_err());
        t.notify_ended(p, Ended::Exited(3)).unwrap();
        t.notify_orphaned(p).unwrap();
        assert_eq!(t.get(p).state(), ProcState::Orphaned);
    }

    #[test]
    fn kill_pair_shares_one_descriptor() {
        let mut t = tree();
        let a = root(&mut t);
        let b = t.new_child(101, a);
        t.notify_forked(a, b).unwrap();
        t.notify_sent_signal(101, a, Some(b), 15, false).unwrap();

        let sender_info = match &t.get(a).event(1).kind {
            EventKind::Kill { info, sender } => {
                assert!(sender);
                Rc::clone(info)
            }
            other => panic!("expected kill, got {other:?}"),
        };
        let receiver_info = match &t.get(b).event(0).kind {
            EventKind::Kill { info, sender } => {
                assert!(!sender);
                Rc::clone(info)
            }
            other => panic!("expected kill, got {other:?}"),
        };
        assert!(Rc::ptr_eq(&sender_info, &receiver_info));
        assert_eq!(sender_info.signal, 15);
        assert!(!sender_info.to_thread);
    }

    #[test]
    fn synchronous_kill_lands_before_the_death_event() {
        let mut t = tree();
        let a = root(&mut t);
        let b = t.new_child(101, a);
        t.notify_forked(a, b).unwrap();
        // The receiver died before the sender's syscall was accounted for.
        t.notify_ended(b, Ended::Signaled(9)).unwrap();
        t.notify_sent_signal(101, a, Some(b), 9, false).unwrap();

        assert!(matches!(
            t.get(b).event(0).kind,
            EventKind::Kill { sender: false, .. }
        ));
        assert!(matches!(
            t.get(b).event(1).kind,
            EventKind::Signal { killed: true, .. }
        ));
    }

    #[test]
    fn self_kill_becomes_a_raise() {
        let mut t = tree();
        let a = root(&mut t);
        t.notify_sent_signal(100, a, Some(a), 10, false).unwrap();
        assert!(matches!(
            t.get(a).event(0).kind,
            EventKind::Raise { signal: 10, .. }
        ));
    }

    #[test]
    fn fatal_signal_promotes_the_delivery_event() {
        let mut t = tree();
        let p = root(&mut t);
        t.notify_signaled(p, 200, 15).unwrap();
        t.notify_ended(p, Ended::Signaled(15)).unwrap();

        assert_eq!(t.get(p).event_count(), 1);
        assert!(matches!(
            t.get(p).event(0).kind,
            EventKind::Signal {
                origin: 200,
                signal: 15,
                killed: true,
            }
        ));
        assert!(t.get(p).killed());
    }

    #[test]
    fn unannounced_fatal_signal_appends_its_own_event() {
        let mut t = tree();
        let p = root(&mut t);
        t.notify_ended(p, Ended::Signaled(9)).unwrap();
        assert!(matches!(
            t.get(p).event(0).kind,
            EventKind::Signal {
                origin: -1,
                signal: 9,
                killed: true,
            }
        ));
    }

    #[test]
    fn consecutive_failed_execs_merge() {
        let mut t = tree();
        let p = root(&mut t);
        let args = vec!["prog".to_owned()];
        t.notify_exec(p, "/usr/local/bin/prog".into(), args.clone(), libc::ENOENT)
            .unwrap();
        t.notify_exec(p, "/usr/bin/prog".into(), args.clone(), libc::ENOENT)
            .unwrap();
        t.notify_exec(p, "/bin/prog".into(), args.clone(), 0).unwrap();

        assert_eq!(t.get(p).event_count(), 1);
        match &t.get(p).event(0).kind {
            EventKind::Exec { calls, .. } => {
                assert_eq!(calls.len(), 3);
                assert_eq!(calls[0].file, "/usr/local/bin/prog");
                assert_eq!(calls[0].errcode, libc::ENOENT);
                assert_eq!(calls[2].file, "/bin/prog");
                assert_eq!(calls[2].errcode, 0);
            }
            other => panic!("expected exec, got {other:?}"),
        }
    }

    #[test]
    fn execs_with_different_basenames_do_not_merge() {
        let mut t = tree();
        let p = root(&mut t);
        let args = vec!["prog".to_owned()];
        t.notify_exec(p, "/no/such".into(), args.clone(), libc::ENOENT)
            .unwrap();
        t.notify_exec(p, "/bin/true".into(), args.clone(), 0).unwrap();
        assert_eq!(t.get(p).event_count(), 2);
    }

    #[test]
    fn exec_merging_can_be_disabled() {
        let mut t = ProcessTree::new(false);
        let p = root(&mut t);
        let args = vec!["prog".to_owned()];
        t.notify_exec(p, "/usr/bin/prog".into(), args.clone(), libc::ENOENT)
            .unwrap();
        t.notify_exec(p, "/bin/prog".into(), args.clone(), 0).unwrap();
        assert_eq!(t.get(p).event_count(), 2);
    }

    #[test]
    fn a_successful_exec_never_absorbs_attempts() {
        let mut t = tree();
        let p = root(&mut t);
        let args = vec!["prog".to_owned()];
        t.notify_exec(p, "/bin/prog".into(), args.clone(), 0).unwrap();
        t.notify_exec(p, "/bin/prog".into(), args.clone(), libc::ENOENT)
            .unwrap();
        assert_eq!(t.get(p).event_count(), 2);
    }

    #[test]
    fn interrupted_wait_merges_on_identical_retry() {
        let mut t = tree();
        let p = root(&mut t);
        t.notify_waiting(p, -1, false).unwrap();
        t.notify_failed_wait(p, ERESTARTSYS).unwrap();
        t.notify_waiting(p, -1, false).unwrap();

        assert_eq!(t.get(p).event_count(), 1);
        match &t.get(p).event(0).kind {
            EventKind::Wait(wait) => assert_eq!(wait.error, 0),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn interrupted_wait_with_different_parameters_is_a_bug() {
        let mut t = tree();
        let p = root(&mut t);
        t.notify_waiting(p, -1, false).unwrap();
        t.notify_failed_wait(p, ERESTARTSYS).unwrap();
        assert!(t.notify_waiting(p, 42, false).is_err());
    }

    #[test]
    fn interrupting_signal_delivery_does_not_prevent_merging() {
        // The delivery event for the interrupting signal always lands
        // between the failed wait and the kernel's retry.
        let mut t = tree();
        let p = root(&mut t);
        t.notify_waiting(p, -1, false).unwrap();
        t.notify_failed_wait(p, ERESTARTSYS).unwrap();
        t.notify_signaled(p, -1, 28).unwrap(); // SIGWINCH
        t.notify_waiting(p, -1, false).unwrap();

        assert_eq!(t.get(p).event_count(), 2); // wait + signal, no second wait
        match &t.get(p).event(0).kind {
            EventKind::Wait(wait) => assert_eq!(wait.error, 0),
            other => panic!("expected wait, got {other:?}"),
        }
    }

    #[test]
    fn substantial_intervening_event_prevents_wait_merging() {
        // A signal handler that execs between the interruption and the
        // retry is real activity; the waits stay separate.
        let mut t = tree();
        let p = root(&mut t);
        t.notify_waiting(p, -1, false).unwrap();
        t.notify_failed_wait(p, ERESTARTSYS).unwrap();
        t.notify_signaled(p, -1, 10).unwrap();
        t.notify_exec(p, "/bin/handler".into(), vec!["handler".into()], 0)
            .unwrap();
        t.notify_waiting(p, -1, false).unwrap();
        assert_eq!(t.get(p).event_count(), 4);
    }
}
