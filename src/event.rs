//! The events that make up a process's history.
//!
//! Events are a tagged sum rather than a class hierarchy; the link-related
//! queries and the drawing protocol dispatch by matching on the tag. All
//! cross-process references are [`ProcessId`] handles into the tree's
//! arena, except the kill descriptor, which really is jointly owned by the
//! sender's and receiver's events.

use std::fmt;
use std::rc::Rc;

use crate::process::{ProcessId, ProcessTree};
use crate::render::{
    Colour, EventRenderer, BAD_EXEC_COLOUR, BAD_WAIT_COLOUR, EXEC_COLOUR, EXITED_COLOUR,
    KILLED_COLOUR, SIGNAL_COLOUR, SIGNAL_SEND_COLOUR,
};
use crate::syscalls::{errno_name, signal_name};
use crate::util::join;

/// Where in the tracee's source an event came from, when the injection
/// header told us.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub func: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.func, self.line)
    }
}

/// The parameters of a wait call that hasn't (yet) reaped anybody. If the
/// call does reap, the whole record is absorbed into a `Reap` event.
///
/// `error == 0` with `nohang` set is ambiguous between "returned 0" and
/// "reaped"; the distinction is exactly whether this record was promoted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WaitData {
    /// Same meaning as the pid argument of waitpid(2), negatives included.
    pub waited_id: i32,
    pub nohang: bool,
    /// 0 while pending or successful; otherwise an errno.
    pub error: i32,
}

/// One attempt within an exec event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecCall {
    pub file: String,
    /// errno, 0 on success.
    pub errcode: i32,
}

/// The information shared between the two halves of a kill pair. Both the
/// sender's and the receiver's events hold it; it lives as long as the
/// longest-lived holder.
#[derive(Debug)]
pub struct KillInfo {
    pub source: ProcessId,
    pub dest: ProcessId,
    pub signal: i32,
    pub to_thread: bool,
}

#[derive(Debug)]
pub enum EventKind {
    /// Spawned a child. Links to the child's path.
    Fork { child: ProcessId },

    /// A wait that is pending or failed (successful waits become reaps).
    Wait(WaitData),

    /// Observed a dead child via wait4/waitid, releasing it. Owns the wait
    /// that produced it. Links to the child's path.
    Reap { child: ProcessId, wait: WaitData },

    /// One or more exec attempts. Consecutive failures for the same program
    /// are coalesced here, which hides libc's $PATH search.
    Exec {
        calls: Vec<ExecCall>,
        args: Vec<String>,
    },

    /// Sent a signal we can't draw as a pair: to itself, to a group, or to
    /// a process outside the tree.
    Raise {
        killed_id: i32,
        signal: i32,
        to_thread: bool,
    },

    /// One half of a signal sent between two traced processes. Links to the
    /// peer's path.
    Kill { info: Rc<KillInfo>, sender: bool },

    /// Received a signal. `killed` is promoted in place once we learn the
    /// delivery was fatal.
    Signal {
        origin: i32,
        signal: i32,
        killed: bool,
    },

    /// Exited normally.
    Exit { status: i32 },
}

#[derive(Debug)]
pub struct Event {
    pub kind: EventKind,
    pub location: Option<SourceLocation>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            location: None,
        }
    }

    /// The path this event's horizontal line terminates on, for the link
    /// events (fork, reap, kill); `None` for everything else.
    pub fn linked_path(&self) -> Option<ProcessId> {
        match &self.kind {
            EventKind::Fork { child } => Some(*child),
            EventKind::Reap { child, .. } => Some(*child),
            EventKind::Kill { info, sender } => {
                Some(if *sender { info.dest } else { info.source })
            }
            _ => None,
        }
    }

    pub fn is_link(&self) -> bool {
        self.linked_path().is_some()
    }

    /// The fill character for a link's horizontal line. The kill fill
    /// depends on which side the renderer encounters first: moving left to
    /// right, the sender wants `>` pointing at the receiver and vice versa.
    pub fn link_char(&self, tree: &ProcessTree) -> char {
        match &self.kind {
            EventKind::Fork { .. } => '-',
            EventKind::Reap { child, .. } => {
                if tree.get(*child).killed() {
                    '~'
                } else {
                    '-'
                }
            }
            EventKind::Kill { sender, .. } => {
                if *sender {
                    '>'
                } else {
                    '<'
                }
            }
            _ => unreachable!("not a link event"),
        }
    }

    pub fn link_colour(&self, tree: &ProcessTree) -> Colour {
        match &self.kind {
            EventKind::Reap { child, .. } => {
                if tree.get(*child).killed() {
                    KILLED_COLOUR
                } else {
                    EXITED_COLOUR
                }
            }
            _ => Colour::White,
        }
    }

    /// Draw this event at the renderer's cursor.
    pub fn draw(&self, tree: &ProcessTree, owner: ProcessId, r: &mut dyn EventRenderer) {
        let process = tree.get(owner);
        match &self.kind {
            EventKind::Fork { .. } => {
                r.draw_char(self.link_colour(tree), '+', 1);
            }
            EventKind::Wait(wait) => {
                let colour = if wait.error == 0 {
                    Colour::Default
                } else {
                    BAD_WAIT_COLOUR
                };
                r.draw_char(colour, 'w', 1);
            }
            EventKind::Reap { wait, .. } => {
                let ch = if wait.waited_id == -1 {
                    'w' // any child
                } else if wait.waited_id > 0 {
                    'i' // a specific pid
                } else {
                    'g' // a process group
                };
                r.draw_char(self.link_colour(tree), ch, 1);
            }
            EventKind::Exec { calls, .. } => {
                let ok = calls.last().is_some_and(|call| call.errcode == 0);
                r.draw_char(if ok { EXEC_COLOUR } else { BAD_EXEC_COLOUR }, 'E', 1);
            }
            EventKind::Raise { signal, .. } => {
                r.draw_string(SIGNAL_SEND_COLOUR, &signal.to_string());
            }
            EventKind::Kill { info, .. } => {
                r.draw_string(SIGNAL_SEND_COLOUR, &info.signal.to_string());
            }
            EventKind::Signal {
                signal, killed, ..
            } => {
                if !*killed {
                    r.draw_string(SIGNAL_COLOUR, &signal.to_string());
                    return;
                }
                if process.orphaned() {
                    r.backtrack(1);
                    r.draw_char(Colour::Default, '[', 1);
                } else if !process.reaped() {
                    r.backtrack(1);
                    r.draw_char(KILLED_COLOUR, '~', 1);
                }
                r.draw_string(KILLED_COLOUR, &signal.to_string());
                if process.orphaned() {
                    r.draw_char(Colour::Default, ']', 1);
                }
            }
            EventKind::Exit { status } => {
                if process.orphaned() {
                    r.backtrack(1);
                    r.draw_char(Colour::Default, '(', 1);
                }
                r.draw_string(EXITED_COLOUR, &status.to_string());
                if process.orphaned() {
                    r.draw_char(Colour::Default, ')', 1);
                }
            }
        }
    }

    /// One-line description for the event log and the `tree` command.
    pub fn describe(&self, tree: &ProcessTree, owner: ProcessId) -> String {
        let pid = tree.get(owner).pid();
        match &self.kind {
            EventKind::Fork { child } => {
                format!("{} forked {}", pid, tree.get(*child).pid())
            }
            EventKind::Wait(wait) => describe_wait(pid, wait),
            EventKind::Reap { child, wait } => {
                let target = wait_target(wait.waited_id);
                let death = tree
                    .death_event(*child)
                    .map(|event| event.describe(tree, *child))
                    .unwrap_or_else(|| format!("{}", tree.get(*child).pid()));
                if wait.nohang {
                    format!("{pid} reaped {death} {{waited for {target} (WNOHANG)}}")
                } else {
                    format!("{pid} reaped {death} {{waited for {target}}}")
                }
            }
            EventKind::Exec { calls, args } => {
                let call = calls.last().expect("exec event with no calls");
                let mut s = if call.errcode == 0 {
                    format!("{} execed {} [ {} ]", pid, call.file, join(args))
                } else if call.file.is_empty() {
                    format!("{} failed to exec: {}", pid, errno_name(call.errcode))
                } else {
                    format!(
                        "{} failed to exec {}: {}",
                        pid,
                        call.file,
                        errno_name(call.errcode)
                    )
                };
                if calls.len() > 1 {
                    s.push_str(&format!(" ({} attempts)", calls.len()));
                }
                s
            }
            EventKind::Raise {
                killed_id,
                signal,
                to_thread,
            } => {
                let name = signal_name(*signal);
                if *killed_id == -1 {
                    format!("{pid} sent {name} ({signal}) to everyone")
                } else if *killed_id == 0 {
                    format!("{pid} sent {name} ({signal}) to their group")
                } else {
                    let kind = if *to_thread { "thread" } else { "process" };
                    if *killed_id == pid {
                        format!("{pid} sent {name} ({signal}) to themself {{as a {kind}}}")
                    } else {
                        format!("{pid} sent {name} ({signal}) to {killed_id} {{as a {kind}}}")
                    }
                }
            }
            EventKind::Kill { info, sender } => {
                let (src, dest) = if *sender {
                    (pid, tree.get(info.dest).pid())
                } else {
                    (tree.get(info.source).pid(), pid)
                };
                format!(
                    "{} sent {} ({}) to {} {{as a {}}}",
                    src,
                    signal_name(info.signal),
                    info.signal,
                    dest,
                    if info.to_thread { "thread" } else { "process" }
                )
            }
            EventKind::Signal {
                origin,
                signal,
                killed,
            } => {
                let action = if *killed { "killed by" } else { "received" };
                let name = signal_name(*signal);
                if *origin == -1 {
                    format!("{pid} {action} {name} ({signal}) {{unknown sender}}")
                } else if *origin == 0 || *origin == pid {
                    format!("{pid} {action} {name} ({signal}) {{raised by self}}")
                } else if *origin == std::process::id() as i32 {
                    format!("{pid} {action} {name} ({signal}) {{sent by tracer}}")
                } else {
                    format!("{pid} {action} {name} ({signal}) {{sent by {origin}}}")
                }
            }
            EventKind::Exit { status } => format!("{pid} exited {status}"),
        }
    }
}

fn wait_target(waited_id: i32) -> String {
    if waited_id == -1 {
        "any child".to_owned()
    } else if waited_id > 0 {
        format!("{waited_id}")
    } else if waited_id == 0 {
        "their group".to_owned()
    } else {
        format!("group {}", -waited_id)
    }
}

fn describe_wait(pid: i32, wait: &WaitData) -> String {
    let target = wait_target(wait.waited_id);
    match (wait.nohang, wait.error) {
        (true, 0) => format!("{pid} waited for {target} (WNOHANG) {{returned 0}}"),
        (true, e) => format!(
            "{pid} waited for {target} (WNOHANG) {{failed: {}}}",
            errno_name(e)
        ),
        (false, 0) => format!("{pid} started waiting for {target}"),
        (false, e) => format!("{pid} waited for {target} {{failed: {}}}", errno_name(e)),
    }
}
