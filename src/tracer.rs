//! The ptrace event driver.
//!
//! One `Tracer` owns the process tree and a map of active tracees, where
//! "active" means running or not-yet-reaped (the pid can't be recycled
//! while the entry exists). The driver is single-threaded; the only state
//! shared with the collaborator threads (the orphan-pipe reader and the
//! SIGINT waiter) lives in [`Control`].
//!
//! The ptrace protocol guarantees strict sequencing within one tracee:
//! entry-stop, then any event-stops, then the exit-stop. The syscall
//! handlers below lean on that by resuming and waiting on the same tracee
//! mid-handler. Across tracees, events interleave arbitrarily; nothing
//! here synchronizes them (the diagram builder does that at layout time).

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{wait, waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::cmd::Command;
use crate::error::{Error, Result};
use crate::event::SourceLocation;
use crate::process::{Ended, ProcessId, ProcessTree};
use crate::syscalls::{self, describe_status};
use crate::{mem, regs};

/// State shared with the collaborator threads. Everything else in the
/// tracer is touched only by the step loop.
pub struct Control {
    /// Orphan pids reported by the reaper helper, drained by the driver
    /// between step iterations. Ordering is not significant.
    orphans: Mutex<VecDeque<i32>>,

    /// Process groups of every leader we started, for nuking.
    leader_pgids: Mutex<Vec<i32>>,

    nuke_requested: AtomicBool,
    done: AtomicBool,

    /// Whether a reaper helper is delivering orphan notifications at all.
    reaper_active: bool,
}

impl Control {
    pub fn new(reaper_active: bool) -> Arc<Self> {
        Arc::new(Self {
            orphans: Mutex::new(VecDeque::new()),
            leader_pgids: Mutex::new(Vec::new()),
            nuke_requested: AtomicBool::new(false),
            done: AtomicBool::new(false),
            reaper_active,
        })
    }

    pub fn notify_orphan(&self, pid: i32) {
        self.orphans.lock().unwrap().push_back(pid);
    }

    fn take_orphans(&self) -> Vec<i32> {
        self.orphans.lock().unwrap().drain(..).collect()
    }

    fn add_leader(&self, pgid: i32) {
        self.leader_pgids.lock().unwrap().push(pgid);
    }

    /// SIGKILL every leader's process group. Thread-safe; called from the
    /// SIGINT waiter. The step loop then drains naturally to an empty map.
    pub fn nuke(&self) {
        self.nuke_requested.store(true, Ordering::SeqCst);
        for pgid in self.leader_pgids.lock().unwrap().iter() {
            let _ = killpg(Pid::from_raw(*pgid), Signal::SIGKILL);
        }
    }

    pub fn nuke_requested(&self) -> bool {
        self.nuke_requested.swap(false, Ordering::SeqCst)
    }

    pub fn set_done(&self) {
        self.done.store(true, Ordering::SeqCst);
    }

    pub fn done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TraceeState {
    Running,
    Stopped,
    Dead,
}

/// Per-tracee bookkeeping.
struct Tracee {
    state: TraceeState,

    /// The syscall we're inside, read at the entry-stop. `None` outside a
    /// syscall; this is how entry-stops and exit-stops are told apart.
    syscall: Option<i64>,

    /// Signal to inject at the next resume (0 = none).
    signal: i32,

    process: ProcessId,

    /// In-flight blocking call, finalized at the exit-stop.
    blocking_call: Option<WaitCall>,
}

impl Tracee {
    fn new(process: ProcessId) -> Self {
        Self {
            state: TraceeState::Running,
            syscall: None,
            signal: 0,
            process,
            blocking_call: None,
        }
    }
}

struct Leader {
    execed: bool,
}

pub struct Tracer {
    tree: ProcessTree,
    tracees: HashMap<i32, Tracee>,
    leaders: HashMap<i32, Leader>,

    /// Pids whose old incarnation was reaped-and-orphaned faster than the
    /// orphan notification reached us. The next notification for such a
    /// pid is discarded once.
    recycled: Vec<i32>,

    control: Arc<Control>,
}

impl Tracer {
    pub fn new(control: Arc<Control>, merge_execs: bool) -> Self {
        Self {
            tree: ProcessTree::new(merge_execs),
            tracees: HashMap::new(),
            leaders: HashMap::new(),
            recycled: Vec::new(),
            control,
        }
    }

    pub fn tree(&self) -> &ProcessTree {
        &self.tree
    }

    pub fn set_merge_execs(&mut self, enabled: bool) {
        self.tree.merge_execs = enabled;
    }

    /// The process node for a live tracee pid, if any.
    pub fn find(&self, pid: i32) -> Option<ProcessId> {
        self.tracees.get(&pid).map(|t| t.process)
    }

    pub fn tracees_alive(&self) -> bool {
        self.tracees.values().any(|t| t.state != TraceeState::Dead)
    }

    /// One line per active tracee, for the `list` command.
    pub fn list_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .tracees
            .iter()
            .map(|(pid, t)| {
                let node = self.tree.get(t.process);
                format!("{} {} {}", pid, node.state_name(), node.command_line(None))
            })
            .collect();
        lines.sort();
        lines.push(format!("total: {}", self.tracees.len()));
        lines
    }

    /// Start a new leader. The program is searched on $PATH; `argv`
    /// includes argv[0]. Returns once the leader's first exec succeeds,
    /// handing back the root of the new process tree.
    pub fn start(&mut self, program: &str, argv: Vec<String>) -> Result<ProcessId> {
        let pid = Command::new(program, &argv)?.spawn_stopped()?;
        let process = self.tree.new_root(pid.as_raw(), program.to_owned(), argv);
        self.leaders.insert(pid.as_raw(), Leader { execed: false });
        self.control.add_leader(pid.as_raw());
        self.add_tracee(pid, process);
        self.tracees.get_mut(&pid.as_raw()).unwrap().state = TraceeState::Stopped;

        while !self.leaders[&pid.as_raw()].execed {
            // Look the tracee up fresh each round; it may have ended and
            // been dropped from the map.
            if !self.tracees.contains_key(&pid.as_raw()) {
                return Err(Error::Startup("tracee ended before it could exec".into()));
            }
            if !self.resume(pid)? {
                self.expect_ended(pid)?;
                return Err(Error::Startup("tracee failed to exec".into()));
            }
            let status = waitpid(pid, None).map_err(Error::system("waitpid"))?;
            self.handle_wait_notification(pid, status)?;
        }
        Ok(process)
    }

    /// Resume every stopped tracee, drain the orphan queue, then block in
    /// wait(-1) handling notifications until everything has stopped again
    /// (or died). Returns true while any entries remain in the map.
    pub fn step(&mut self) -> Result<bool> {
        if self.tracees.is_empty() {
            return Ok(false);
        }
        let pids: Vec<i32> = self.tracees.keys().copied().collect();
        for pid in pids {
            self.resume(Pid::from_raw(pid))?;
        }
        self.collect_orphans();

        // Only block in wait if something can actually report. If every
        // tracee is an unreaped corpse we are waiting on the reaper.
        while self.any_running() {
            let status = match wait() {
                Ok(status) => status,
                Err(Errno::ECHILD) => break,
                Err(errno) => return Err(Error::system("wait")(errno)),
            };
            let Some(pid) = status.pid() else { continue };
            if !self.tracees.contains_key(&pid.as_raw()) {
                warn!(
                    "got wait status \"{}\" for unknown PID {}",
                    describe_status(&status),
                    pid
                );
                continue;
            }
            if let Err(err) = self.handle_wait_notification(pid, status) {
                self.recover(pid, err)?;
            }
            self.collect_orphans();
            if self.all_dead() {
                break;
            }
            if !self.any_running() {
                return Ok(true);
            }
        }

        if self.all_dead() && !self.tracees.is_empty() {
            if self.control.reaper_active {
                // The remaining corpses leave the map when the reaper
                // notifies us; don't spin flat out while we wait.
                std::thread::sleep(Duration::from_millis(2));
            } else {
                // No reaper means no orphan notifications will ever come.
                return Ok(false);
            }
        }
        Ok(!self.tracees.is_empty())
    }

    /// Drain any queued orphan notifications. The shell calls this between
    /// commands so orphans are honoured even when nothing is stepping.
    pub fn check_orphans(&mut self) {
        self.collect_orphans();
    }

    /// Error recovery per the taxonomy: a protocol violation drops the
    /// tracee and the trace carries on; a process-tree complaint is a bug
    /// worth reporting but not fatal either. Everything else propagates.
    fn recover(&mut self, _pid: Pid, err: Error) -> Result<()> {
        match err {
            Error::BadTrace { pid: bad, msg } => {
                error!("bad trace (pid {bad}): {msg}");
                error!("dropping tracee {bad} from the trace");
                self.tracees.remove(&bad);
                Ok(())
            }
            Error::ProcessTree(msg) => {
                error!("process tree: {msg} (this is a bug)");
                Ok(())
            }
            err => Err(err),
        }
    }

    fn any_running(&self) -> bool {
        self.tracees.values().any(|t| t.state == TraceeState::Running)
    }

    fn all_dead(&self) -> bool {
        self.tracees.values().all(|t| t.state == TraceeState::Dead)
    }

    fn add_tracee(&mut self, pid: Pid, process: ProcessId) {
        if self.tracees.remove(&pid.as_raw()).is_some() {
            // A new tracee with the pid of an old one: the old one was
            // reaped and the pid recycled before the orphan notification
            // reached us. Remember to discard that notification.
            self.recycled.push(pid.as_raw());
        }
        self.tracees.insert(pid.as_raw(), Tracee::new(process));
    }

    fn collect_orphans(&mut self) {
        for pid in self.control.take_orphans() {
            if let Some(pos) = self.recycled.iter().position(|p| *p == pid) {
                self.recycled.remove(pos);
                continue;
            }
            match self.tracees.get(&pid) {
                None => warn!("unknown PID {pid} was orphaned"),
                Some(t) if t.state != TraceeState::Dead => {
                    error!("an alive tracee ({pid}) was orphaned; dropping it");
                    self.tracees.remove(&pid);
                }
                Some(t) => {
                    info!("{pid} orphaned");
                    let process = t.process;
                    if let Err(err) = self.tree.notify_orphaned(process) {
                        error!("{err} (this is a bug)");
                    }
                    self.tracees.remove(&pid);
                }
            }
        }
    }

    /// Resume a stopped tracee with PTRACE_SYSCALL, delivering any pending
    /// signal. Returns false if the tracee has vanished (its exit
    /// notification is still queued for us).
    fn resume(&mut self, pid: Pid) -> Result<bool> {
        let Some(tracee) = self.tracees.get_mut(&pid.as_raw()) else {
            return Ok(true);
        };
        if tracee.state != TraceeState::Stopped {
            debug!("{pid} not stopped, so not resuming it");
            return Ok(true);
        }
        let signal = tracee.signal;
        tracee.signal = 0;
        tracee.state = TraceeState::Running;

        // Raw ptrace so arbitrary (e.g. realtime) signal numbers can be
        // reinjected, not just the ones nix can name.
        let res = unsafe { libc::ptrace(libc::PTRACE_SYSCALL, pid.as_raw(), 0, signal) };
        if res == -1 {
            match Errno::last() {
                Errno::ESRCH => {
                    debug!("resume({pid}) failed, tracee is gone");
                    return Ok(false);
                }
                errno => return Err(Error::System {
                    errno,
                    cause: "ptrace(PTRACE_SYSCALL)",
                }),
            }
        }
        debug!("resumed tracee {pid}");
        Ok(true)
    }

    /// Wait for the next stop of this particular tracee. If it turns out
    /// to have ended instead, the notification is handled and `None` is
    /// returned.
    fn wait_for_stop(&mut self, pid: Pid) -> Result<Option<WaitStatus>> {
        let status = match waitpid(pid, None) {
            Ok(status) => status,
            Err(Errno::ECHILD) => {
                return Err(Error::bad_trace(
                    pid,
                    "waited for tracee to stop but it doesn't exist",
                ))
            }
            Err(errno) => return Err(Error::system("waitpid")(errno)),
        };
        if is_stop(&status) {
            self.tracees.get_mut(&pid.as_raw()).unwrap().state = TraceeState::Stopped;
            Ok(Some(status))
        } else {
            self.handle_wait_notification(pid, status)?;
            Ok(None)
        }
    }

    /// Wait on a tracee that should have ended, and consume the exit
    /// notification. Used after some call reported ESRCH.
    fn expect_ended(&mut self, pid: Pid) -> Result<()> {
        let status = match waitpid(pid, None) {
            Ok(status) => status,
            Err(Errno::ECHILD) => {
                return Err(Error::bad_trace(
                    pid,
                    "expected tracee to have ended but it doesn't exist",
                ))
            }
            Err(errno) => return Err(Error::system("waitpid")(errno)),
        };
        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                self.handle_wait_notification(pid, status)
            }
            status => Err(self.diagnose(pid, &status, "expected tracee to have ended, but it hasn't")),
        }
    }

    fn handle_wait_notification(&mut self, pid: Pid, status: WaitStatus) -> Result<()> {
        let Some(tracee) = self.tracees.get(&pid.as_raw()) else {
            warn!("notification for untracked PID {pid}");
            return Ok(());
        };
        if tracee.state == TraceeState::Dead {
            return Err(self.diagnose(pid, &status, "got event for dead tracee"));
        }
        match status {
            WaitStatus::Exited(_, code) => self.tracee_ended(pid, Ended::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => {
                self.tracee_ended(pid, Ended::Signaled(signal as i32))
            }
            status if is_stop(&status) => {
                self.tracees.get_mut(&pid.as_raw()).unwrap().state = TraceeState::Stopped;
                self.handle_stopped(pid, status)
            }
            status => {
                Err(self.diagnose(pid, &status, "tracee hasn't ended but also hasn't stopped"))
            }
        }
    }

    fn tracee_ended(&mut self, pid: Pid, how: Ended) -> Result<()> {
        let process = self.tracees[&pid.as_raw()].process;
        self.tree.notify_ended(process, how)?;
        if self.leaders.contains_key(&pid.as_raw()) {
            info!("leader {pid} ended");
            // We're the parent, so this ptrace notification doubles as the
            // reap; nobody else is going to observe this corpse.
            self.tracees.remove(&pid.as_raw());
        } else {
            // Keep the entry until a reap or orphan notification arrives.
            self.tracees.get_mut(&pid.as_raw()).unwrap().state = TraceeState::Dead;
        }
        Ok(())
    }

    fn handle_stopped(&mut self, pid: Pid, status: WaitStatus) -> Result<()> {
        match status {
            WaitStatus::PtraceSyscall(_) => {
                if self.tracees[&pid.as_raw()].syscall.is_none() {
                    // Entry-stop: find out what's being called.
                    let Some((syscall, args)) = regs::which_syscall(pid)? else {
                        return self.expect_ended(pid);
                    };
                    self.handle_syscall_entry(pid, syscall, args)
                } else {
                    self.handle_syscall_exit(pid)
                }
            }
            WaitStatus::PtraceEvent(..) => {
                // fork/clone/exec events are consumed by the handlers that
                // provoke them; one arriving here is out of sequence.
                Err(self.diagnose(pid, &status, "got event at a weird time"))
            }
            WaitStatus::Stopped(_, signal) => self.handle_signal_stop(pid, signal),
            _ => unreachable!("handle_stopped called for a non-stop"),
        }
    }

    fn handle_syscall_entry(
        &mut self,
        pid: Pid,
        syscall: i64,
        args: [u64; regs::SYS_ARG_MAX],
    ) -> Result<()> {
        self.tracees.get_mut(&pid.as_raw()).unwrap().syscall = Some(syscall);
        debug!("{} entered syscall {}", pid, syscalls::name(syscall));
        match syscall {
            syscalls::FORK => self.handle_fork(pid),
            syscalls::CLONE if syscalls::clone_is_fork_like(&args) => self.handle_fork(pid),
            syscalls::EXECVE => self.handle_exec(pid, args[0], args[1]),
            syscalls::EXECVEAT => self.handle_exec(pid, args[1], args[2]),
            syscalls::WAIT4 => self.initiate_wait(
                pid,
                WaitCall::wait4(args[0] as i32, args[1], args[2] as i32),
            ),
            syscalls::WAITID => self.initiate_wait(
                pid,
                WaitCall::waitid(args[0] as u32, args[1] as u32, args[2], args[3] as i32),
            ),
            syscalls::KILL => self.handle_kill(pid, args[0] as i32, args[1] as i32, false),
            syscalls::TKILL => self.handle_kill(pid, args[0] as i32, args[1] as i32, true),
            syscalls::TGKILL => self.handle_kill(pid, args[1] as i32, args[2] as i32, true),
            syscalls::LOCATION => self.handle_new_location(pid, args[0] as u32, args[1], args[2]),
            syscalls::PTRACE
            | syscalls::SETPGID
            | syscalls::SETSID
            | syscalls::VFORK
            | syscalls::CLONE
            | syscalls::CLONE3 => self.ban_syscall(pid, syscall),
            _ => {
                self.resume(pid)?;
                Ok(())
            }
        }
    }

    /// Rewrite a banned syscall's number to the no-op sentinel so the call
    /// fails with ENOSYS, then carry on. Covers tracee-initiated ptrace,
    /// process-group games, vfork and thread-flavoured clones.
    fn ban_syscall(&mut self, pid: Pid, syscall: i64) -> Result<()> {
        error!(
            "tracee {} tried to execute banned syscall {}",
            pid,
            syscalls::name(syscall)
        );
        if regs::set_syscall(pid, syscalls::NONE)?.is_none() {
            return self.expect_ended(pid);
        }
        self.resume(pid)?;
        Ok(())
    }

    fn handle_syscall_exit(&mut self, pid: Pid) -> Result<()> {
        let call = self.tracees.get_mut(&pid.as_raw()).unwrap().blocking_call.take();
        if let Some(mut call) = call {
            // The exit-stop of a blocking call we prepared at entry.
            if !call.finalize(self, pid)? {
                return self.expect_ended(pid);
            }
            let syscall = self.tracees[&pid.as_raw()].syscall.unwrap_or(syscalls::NONE);
            debug!("{} exited blocking syscall {}", pid, syscalls::name(syscall));
        } else if let Some(syscall) = self.tracees[&pid.as_raw()].syscall {
            debug!("{} exited syscall {}", pid, syscalls::name(syscall));
        }
        self.resume(pid)?;
        self.tracees.get_mut(&pid.as_raw()).unwrap().syscall = None;
        Ok(())
    }

    /// Handle fork and fork-flavoured clone from the entry-stop. The happy
    /// sequence is fork-event, then the child's initial SIGSTOP, then the
    /// parent's exit-stop; a syscall-exit-stop instead means the fork
    /// failed.
    fn handle_fork(&mut self, pid: Pid) -> Result<()> {
        if !self.resume(pid)? {
            return Ok(());
        }
        let Some(status) = self.wait_for_stop(pid)? else {
            return Ok(());
        };

        match status {
            WaitStatus::PtraceEvent(_, _, event)
                if event == libc::PTRACE_EVENT_FORK || event == libc::PTRACE_EVENT_CLONE =>
            {
                let child_pid = match ptrace::getevent(pid) {
                    Ok(msg) => Pid::from_raw(msg as i32),
                    Err(Errno::ESRCH) => return self.expect_ended(pid),
                    Err(errno) => {
                        return Err(Error::System {
                            errno,
                            cause: "ptrace(PTRACE_GETEVENTMSG)",
                        })
                    }
                };

                let parent_process = self.tracees[&pid.as_raw()].process;
                let child_process = self.tree.new_child(child_pid.as_raw(), parent_process);
                self.add_tracee(child_pid, child_process);
                self.tree.notify_forked(parent_process, child_process)?;

                // Our ptrace options deliver SIGSTOP to the child on attach.
                let Some(child_status) = self.wait_for_stop(child_pid)? else {
                    return Ok(());
                };
                if !matches!(child_status, WaitStatus::Stopped(_, Signal::SIGSTOP)) {
                    return Err(self.diagnose(
                        child_pid,
                        &child_status,
                        "expected SIGSTOP after fork",
                    ));
                }

                // Run the parent to its syscall-exit-stop.
                if !self.resume(pid)? {
                    return Ok(());
                }
                let Some(status) = self.wait_for_stop(pid)? else {
                    return Ok(());
                };
                if !matches!(status, WaitStatus::PtraceSyscall(_)) {
                    return Err(self.diagnose(pid, &status, "expected syscall-exit-stop after fork"));
                }
                self.tracees.get_mut(&pid.as_raw()).unwrap().syscall = None;
                Ok(())
            }
            WaitStatus::PtraceSyscall(_) => {
                self.tracees.get_mut(&pid.as_raw()).unwrap().syscall = None;
                self.handle_failed_fork(pid)
            }
            status => Err(self.diagnose(pid, &status, "expected syscall-exit-stop after bad fork")),
        }
    }

    /// A fork reached its exit-stop without a fork-event. An interrupted
    /// fork (ERESTARTNOINTR) gets restarted by the kernel and will
    /// re-dispatch at the next entry-stop; any other failure kills the
    /// whole session. That's the fork-bomb safeguard: we exit, and
    /// PTRACE_O_EXITKILL takes every tracee down with us.
    fn handle_failed_fork(&mut self, pid: Pid) -> Result<()> {
        let Some(retval) = regs::return_value(pid)? else {
            return self.expect_ended(pid);
        };
        let err = -(retval as i64);
        if err == syscalls::ERESTARTNOINTR as i64 {
            info!("{pid} fork interrupted (to be resumed)");
            self.resume(pid)?;
            return Ok(());
        }
        error!("{} failed fork: {}", pid, syscalls::errno_name(err as i32));
        error!("nuking everything with SIGKILL and giving up");
        std::process::exit(1);
    }

    /// Handle execve/execveat from the entry-stop. The path and argv must
    /// be copied out now, before the old image is gone; a fault here is
    /// fine since the exec will fail on it anyway.
    fn handle_exec(&mut self, pid: Pid, path_addr: u64, argv_addr: u64) -> Result<()> {
        let process = self.tracees[&pid.as_raw()].process;

        let args = match mem::read_string_array(pid, argv_addr) {
            Ok(Some(args)) => args,
            Ok(None) => return self.expect_ended(pid),
            Err(Error::IoFault { .. }) => Vec::new(),
            Err(err) => return Err(err),
        };
        let file = match mem::read_cstring(pid, path_addr) {
            Ok(Some(file)) => file,
            Ok(None) => return self.expect_ended(pid),
            Err(Error::IoFault { .. }) => String::new(),
            Err(err) => return Err(err),
        };

        if !self.resume(pid)? {
            return Ok(());
        }
        let Some(status) = self.wait_for_stop(pid)? else {
            return Ok(());
        };

        match status {
            WaitStatus::PtraceEvent(_, _, event) if event == libc::PTRACE_EVENT_EXEC => {
                // Success; drive on to the syscall-exit-stop.
                if !self.resume(pid)? {
                    return Ok(());
                }
                let Some(status) = self.wait_for_stop(pid)? else {
                    return Ok(());
                };
                if !matches!(status, WaitStatus::PtraceSyscall(_)) {
                    return Err(self.diagnose(pid, &status, "expected syscall-exit-stop after exec"));
                }
                self.tracees.get_mut(&pid.as_raw()).unwrap().syscall = None;
                self.tree.notify_exec(process, file, args, 0)?;

                if let Some(leader) = self.leaders.get_mut(&pid.as_raw()) {
                    leader.execed = true;
                }
                Ok(())
            }
            WaitStatus::PtraceSyscall(_) => {
                // The exec failed; the return value says why.
                self.tracees.get_mut(&pid.as_raw()).unwrap().syscall = None;
                let Some(retval) = regs::return_value(pid)? else {
                    return self.expect_ended(pid);
                };
                let err = -(retval as i64) as i32;
                self.tree.notify_exec(process, file, args, err)?;
                Ok(())
            }
            status => {
                Err(self.diagnose(pid, &status, "expected syscall-exit-stop after failed exec"))
            }
        }
    }

    /// Handle kill/tkill/tgkill from the entry-stop.
    fn handle_kill(&mut self, pid: Pid, target: i32, signal: i32, to_thread: bool) -> Result<()> {
        if !self.resume(pid)? {
            return Ok(());
        }

        // Not wait_for_stop: a tracee SIGKILLing itself never reaches an
        // exit-stop, and we still want to credit it with the send.
        let status = match waitpid(pid, None) {
            Ok(status) => status,
            Err(Errno::ECHILD) => {
                return Err(Error::bad_trace(
                    pid,
                    "waited for tracee (after it called kill et al), but it doesn't exist",
                ))
            }
            Err(errno) => return Err(Error::system("waitpid")(errno)),
        };

        if !is_stop(&status) {
            if !matches!(status, WaitStatus::Signaled(_, Signal::SIGKILL, _)) {
                return Err(Error::bad_trace(pid, "expected tracee to have been SIGKILL'ed"));
            }
            let me = pid.as_raw();
            if (target == 0 || target == me || target == -me) && signal == libc::SIGKILL {
                // It SIGKILL'ed itself or its own group: a valid send even
                // though no exit-stop will ever confirm it. (Another
                // process could in principle have delivered SIGKILL inside
                // the same tiny window, but siginfo can't tell us: ptrace
                // can't see into a SIGKILL'ed corpse.)
                self.on_sent_signal(pid, target, signal, to_thread)?;
            }
            return self.handle_wait_notification(pid, status);
        }

        if !matches!(status, WaitStatus::PtraceSyscall(_)) {
            return Err(self.diagnose(pid, &status, "expected syscall-exit-stop after kill et al"));
        }
        {
            let tracee = self.tracees.get_mut(&pid.as_raw()).unwrap();
            tracee.state = TraceeState::Stopped;
            tracee.syscall = None;
        }

        let Some(retval) = regs::return_value(pid)? else {
            return self.expect_ended(pid);
        };
        if signal == 0 || retval != 0 {
            // Existence probes and failed sends aren't events.
            self.resume(pid)?;
            return Ok(());
        }
        self.on_sent_signal(pid, target, signal, to_thread)
    }

    fn on_sent_signal(&mut self, pid: Pid, target: i32, signal: i32, to_thread: bool) -> Result<()> {
        let source = self.tracees[&pid.as_raw()].process;
        let dest = self.tracees.get(&target).map(|t| t.process);
        self.tree
            .notify_sent_signal(target, source, dest, signal, to_thread)
    }

    /// The reserved syscall from the injection header: consume the source
    /// location it smuggles in and park it on the process.
    fn handle_new_location(
        &mut self,
        pid: Pid,
        line: u32,
        func_addr: u64,
        file_addr: u64,
    ) -> Result<()> {
        let process = self.tracees[&pid.as_raw()].process;
        let func = match mem::read_cstring(pid, func_addr) {
            Ok(Some(func)) => func,
            Ok(None) => return self.expect_ended(pid),
            Err(Error::IoFault { .. }) => {
                self.resume(pid)?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let file = match mem::read_cstring(pid, file_addr) {
            Ok(Some(file)) => file,
            Ok(None) => return self.expect_ended(pid),
            Err(Error::IoFault { .. }) => {
                self.resume(pid)?;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.tree
            .update_location(process, SourceLocation { file, func, line });
        self.resume(pid)?;
        Ok(())
    }

    fn handle_signal_stop(&mut self, pid: Pid, signal: Signal) -> Result<()> {
        let (pending, process) = {
            let tracee = &self.tracees[&pid.as_raw()];
            (tracee.signal, tracee.process)
        };
        if pending != 0 {
            // Linux delivers signals one at a time to a ptraced process;
            // two before a resume means the sequencing is broken.
            return Err(Error::bad_trace(
                pid,
                "tracee delivered a signal while another was already pending",
            ));
        }
        if signal == Signal::SIGTTIN {
            return Err(Error::bad_trace(
                pid,
                "tracee tried to read from the terminal, which isn't supported",
            ));
        }

        let info = match ptrace::getsiginfo(pid) {
            Ok(info) => info,
            Err(Errno::ESRCH) => return self.expect_ended(pid),
            Err(errno) => {
                return Err(Error::System {
                    errno,
                    cause: "ptrace(PTRACE_GETSIGINFO)",
                })
            }
        };
        let origin = unsafe { info.si_pid() };

        self.tree.notify_signaled(process, origin, signal as i32)?;
        // Deliver it for real at the next resume.
        self.tracees.get_mut(&pid.as_raw()).unwrap().signal = signal as i32;
        Ok(())
    }

    fn initiate_wait(&mut self, pid: Pid, mut call: WaitCall) -> Result<()> {
        if !call.prepare(self, pid)? {
            return self.expect_ended(pid);
        }
        // Leave the tracee stopped at its entry-stop holding the call; the
        // next step resumes it into the (possibly blocking) wait.
        self.tracees.get_mut(&pid.as_raw()).unwrap().blocking_call = Some(call);
        Ok(())
    }

    /// Build a protocol-violation error that describes the wait status we
    /// saw and, when it's safe, probes the tracee's registers for more.
    fn diagnose(&self, pid: Pid, status: &WaitStatus, msg: &str) -> Error {
        let mut full = format!("{msg} ({})", describe_status(status));
        if let Some(tracee) = self.tracees.get(&pid.as_raw()) {
            if let Some(syscall) = tracee.syscall {
                full.push_str(&format!(" (syscall={})", syscalls::name(syscall)));
            }
        }
        if matches!(status, WaitStatus::PtraceSyscall(_)) {
            // Careful interpreting this: at an exit-stop the register can
            // hold anything.
            match regs::which_syscall(pid) {
                Ok(Some((syscall, _))) => {
                    full.push_str(&format!(" (reg={})", syscalls::name(syscall)))
                }
                Ok(None) => full.push_str(" (got ESRCH when probing further)"),
                Err(err) => full.push_str(&format!(" (got error when probing further: {err})")),
            }
        }
        Error::bad_trace(pid, full)
    }
}

fn is_stop(status: &WaitStatus) -> bool {
    matches!(
        status,
        WaitStatus::Stopped(..) | WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(..)
    )
}

/// Translate waitid's (idtype, id) pair into the wait4-style id the event
/// model uses. Invalid idtypes map to a value no pid can match; the call
/// will fail with EINVAL on its own.
fn to_wait_id(idtype: u32, id: u32) -> i32 {
    match idtype {
        libc::P_ALL => -1,
        libc::P_PID => id as i32,
        libc::P_PGID => -(id as i32),
        _ => i32::MAX,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WaitKind {
    Wait4,
    WaitId,
}

/// An in-flight wait4/waitid call.
///
/// The interesting part is observing the result even when the tracee
/// passed NULL for it: `prepare` points the syscall at scratch space in
/// the tracee (a page-aligned address derived from its frame pointer),
/// after snapshotting the bytes there; `finalize` reads the result back
/// and restores the snapshot. A tracee that passed a garbage pointer
/// instead gets to keep it: the call runs uninstrumented and fails.
struct WaitCall {
    kind: WaitKind,
    waited_id: i32,
    nohang: bool,

    /// The result pointer the tracee passed (0 for NULL).
    user_addr: u64,

    /// Where the result will actually be written.
    result_addr: u64,

    /// Snapshot of the scratch bytes, for restoration.
    saved: Option<Vec<u8>>,

    /// Set when instrumentation failed; the call runs untouched and we
    /// only learn its return value.
    unobserved: bool,
}

impl WaitCall {
    fn wait4(target: i32, status_addr: u64, flags: i32) -> Self {
        Self {
            kind: WaitKind::Wait4,
            waited_id: target,
            nohang: flags & libc::WNOHANG != 0,
            user_addr: status_addr,
            result_addr: status_addr,
            saved: None,
            unobserved: false,
        }
    }

    fn waitid(idtype: u32, id: u32, infop: u64, flags: i32) -> Self {
        Self {
            kind: WaitKind::WaitId,
            waited_id: to_wait_id(idtype, id),
            nohang: flags & libc::WNOHANG != 0,
            user_addr: infop,
            result_addr: infop,
            saved: None,
            unobserved: false,
        }
    }

    fn result_size(&self) -> usize {
        match self.kind {
            WaitKind::Wait4 => std::mem::size_of::<i32>(),
            WaitKind::WaitId => std::mem::size_of::<libc::siginfo_t>(),
        }
    }

    fn zero_the_result(&self) -> bool {
        // waitid with WNOHANG succeeds without touching the siginfo when
        // no child is ready; zeroing first lets us tell the difference.
        self.kind == WaitKind::WaitId
    }

    fn result_arg_index(&self) -> usize {
        match self.kind {
            WaitKind::Wait4 => 1,
            WaitKind::WaitId => 2,
        }
    }

    /// Set the call up at its entry-stop and record the pending WaitEvent.
    /// Returns false if the tracee died under us.
    fn prepare(&mut self, tracer: &mut Tracer, pid: Pid) -> Result<bool> {
        if self.result_addr == 0 {
            // NULL result pointer: repoint the call at scratch space.
            let Some(scratch) = regs::result_scratch_addr(pid)? else {
                return Ok(false);
            };
            match mem::copy_from(pid, scratch, self.result_size()) {
                Ok(Some(bytes)) => {
                    if regs::set_arg(pid, self.result_arg_index(), scratch)?.is_none() {
                        return Ok(false);
                    }
                    self.saved = Some(bytes);
                    self.result_addr = scratch;
                }
                Ok(None) => return Ok(false),
                Err(Error::IoFault { .. }) => self.unobserved = true,
                Err(err) => return Err(err),
            }
        }
        if self.zero_the_result() && !self.unobserved {
            match mem::memset(pid, self.result_addr, 0, self.result_size()) {
                Ok(Some(())) => {}
                Ok(None) => return Ok(false),
                // A garbage user pointer: let the call fail on it.
                Err(Error::IoFault { .. }) => self.unobserved = true,
                Err(err) => return Err(err),
            }
        }
        let process = tracer.tracees[&pid.as_raw()].process;
        tracer.tree.notify_waiting(process, self.waited_id, self.nohang)?;
        Ok(true)
    }

    /// At the exit-stop: read the outcome, restore any scratch bytes, and
    /// update the tree (reap promotion or failure). Returns false if the
    /// tracee died under us.
    fn finalize(&mut self, tracer: &mut Tracer, pid: Pid) -> Result<bool> {
        let Some(retval) = regs::return_value(pid)? else {
            return Ok(false);
        };
        let rv = retval as i64;

        let mut result: Option<Vec<u8>> = None;
        if !self.unobserved {
            match mem::copy_from(pid, self.result_addr, self.result_size()) {
                Ok(Some(bytes)) => result = Some(bytes),
                Ok(None) => return Ok(false),
                Err(Error::IoFault { .. }) => self.unobserved = true,
                Err(err) => return Err(err),
            }
        }

        if let Some(saved) = self.saved.take() {
            match mem::copy_to(pid, self.result_addr, &saved) {
                Ok(Some(())) => {}
                Ok(None) => return Ok(false),
                Err(Error::IoFault { .. }) => {
                    warn!("{pid}: couldn't restore scratch bytes after wait")
                }
                Err(err) => return Err(err),
            }
            // Put the NULL argument back; some callers re-inspect it.
            if regs::set_arg(pid, self.result_arg_index(), self.user_addr)?.is_none() {
                return Ok(false);
            }
        }

        match self.kind {
            WaitKind::Wait4 => {
                if rv < 0 {
                    self.on_failure(tracer, pid, (-rv) as i32)?;
                } else if rv > 0 {
                    // wait4 returning a pid means a reap, unless the status
                    // says the child merely stopped or continued.
                    let reaped = match &result {
                        Some(bytes) => {
                            let status = i32::from_ne_bytes(bytes[..4].try_into().unwrap());
                            libc::WIFEXITED(status) || libc::WIFSIGNALED(status)
                        }
                        None => true, // unobserved: trust the return value
                    };
                    if reaped {
                        self.on_success(tracer, pid, rv as i32)?;
                    }
                }
            }
            WaitKind::WaitId => {
                if rv < 0 {
                    self.on_failure(tracer, pid, (-rv) as i32)?;
                } else if let Some(bytes) = &result {
                    // waitid returns 0 even when WNOHANG found nothing; the
                    // (pre-zeroed) si_pid tells us whether a child was
                    // actually collected.
                    let info: libc::siginfo_t =
                        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const _) };
                    let child = unsafe { info.si_pid() };
                    let code = info.si_code;
                    if child != 0
                        && (code == libc::CLD_EXITED
                            || code == libc::CLD_KILLED
                            || code == libc::CLD_DUMPED)
                    {
                        self.on_success(tracer, pid, child)?;
                    }
                }
            }
        }
        Ok(true)
    }

    fn on_success(&self, tracer: &mut Tracer, pid: Pid, reaped: i32) -> Result<()> {
        let Some(child) = tracer.tracees.get(&reaped) else {
            return Err(Error::bad_trace(
                pid,
                format!("tracee reaped an unknown child ({reaped})"),
            ));
        };
        if child.state != TraceeState::Dead {
            return Err(Error::bad_trace(
                pid,
                format!("tracee reaped a child ({reaped}) that wasn't dead"),
            ));
        }
        let child_process = child.process;
        let waiter = tracer.tracees[&pid.as_raw()].process;
        tracer.tree.notify_reaped(waiter, child_process)?;
        tracer.tracees.remove(&reaped);
        Ok(())
    }

    fn on_failure(&self, tracer: &mut Tracer, pid: Pid, error: i32) -> Result<()> {
        let process = tracer.tracees[&pid.as_raw()].process;
        tracer.tree.notify_failed_wait(process, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waitid_translation() {
        assert_eq!(to_wait_id(libc::P_ALL, 42), -1);
        assert_eq!(to_wait_id(libc::P_PID, 42), 42);
        assert_eq!(to_wait_id(libc::P_PGID, 42), -42);
        // Unknown idtypes translate to a pid nothing can match; the call
        // fails with EINVAL and never produces a reap.
        assert_eq!(to_wait_id(99, 42), i32::MAX);
    }

    #[test]
    fn wait4_flags_decode() {
        let call = WaitCall::wait4(-1, 0, libc::WNOHANG);
        assert!(call.nohang);
        assert_eq!(call.waited_id, -1);
        assert_eq!(call.result_size(), 4);
        assert_eq!(call.result_arg_index(), 1);
        assert!(!call.zero_the_result());

        let call = WaitCall::waitid(libc::P_PGID, 7, 0, 0);
        assert!(!call.nohang);
        assert_eq!(call.waited_id, -7);
        assert_eq!(call.result_size(), std::mem::size_of::<libc::siginfo_t>());
        assert_eq!(call.result_arg_index(), 2);
        assert!(call.zero_the_result());
    }
}
