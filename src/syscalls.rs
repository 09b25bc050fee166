//! The x86_64 syscall table and the handful of syscall numbers the tracer
//! dispatches on, plus helpers for describing signals and wait statuses.
//!
//! Syscall numbers come from strace's syscallent tables. The tool only
//! supports x86_64 Linux; the register layout lives in [`crate::regs`].

use std::collections::BTreeMap;
use std::sync::OnceLock;

use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

// The syscalls the driver cares about. Everything else is resumed blindly.
pub const CLONE: i64 = 56; // called by glibc for fork() and by pthreads
pub const FORK: i64 = 57; // obsolete; modern fork() wrappers call clone()
pub const VFORK: i64 = 58; // banned
pub const EXECVE: i64 = 59; // the only exec that is actually a syscall
pub const WAIT4: i64 = 61; // underlying syscall for wait & waitpid
pub const KILL: i64 = 62; // signal an entire thread group
pub const PTRACE: i64 = 101; // banned - would confuse us
pub const SETPGID: i64 = 109; // banned - we rely on the group layout
pub const SETSID: i64 = 112; // banned - also modifies the PGID
pub const TKILL: i64 = 200; // signal a specific thread (obsolete)
pub const TGKILL: i64 = 234; // signal a specific thread (recommended)
pub const WAITID: i64 = 247; // cover all our bases
pub const EXECVEAT: i64 = 322; // execve with extra features
pub const CLONE3: i64 = 435; // banned; callers fall back to plain clone

/// Reserved number used by the injection header to smuggle source locations
/// to the tracer. Fails with ENOSYS in normal operation.
pub const LOCATION: i64 = -2;

/// Sentinel for "no syscall". Rewriting a tracee's syscall number to this
/// makes the call fail with ENOSYS.
pub const NONE: i64 = -1;

/// Kernel-internal errno, visible only to ptracers: the call was interrupted
/// by a signal and will be restarted by the kernel.
pub const ERESTARTSYS: i32 = 512;

/// As above, but restarted unconditionally (fork returns this instead of
/// ERESTARTSYS).
pub const ERESTARTNOINTR: i32 = 513;

/// A fork-flavoured clone passes SIGCHLD in the low byte of its flags.
/// Anything else (threads, CLONE_PARENT games) is out of scope.
pub fn clone_is_fork_like(args: &[u64; 6]) -> bool {
    (args[0] & 0xff) == libc::SIGCHLD as u64
}

struct SyscallInfo {
    name: &'static str,
    arg_count: u8,
}

// Generated from strace's linux/x86_64/syscallent.h.
const TABLE: &str = include_str!("data/syscalls_x86_64.tsv");

fn table() -> &'static BTreeMap<i64, SyscallInfo> {
    static TABLE_MAP: OnceLock<BTreeMap<i64, SyscallInfo>> = OnceLock::new();
    TABLE_MAP.get_or_init(|| {
        let mut map = BTreeMap::new();
        for line in TABLE.split_terminator('\n') {
            let mut cols = line.split('\t');
            let number: i64 = cols.next().unwrap().parse().unwrap();
            let name = cols.next().unwrap();
            let arg_count: u8 = cols.next().unwrap().parse().unwrap();
            map.insert(number, SyscallInfo { name, arg_count });
        }
        map
    })
}

/// The name for a syscall number, or `"?????"` if we don't know it.
pub fn name(syscall: i64) -> &'static str {
    if syscall == LOCATION {
        return "forktrace";
    }
    match table().get(&syscall) {
        Some(info) => info.name,
        None => "?????",
    }
}

/// How many arguments a syscall takes, if the number is valid.
pub fn arg_count(syscall: i64) -> Option<u8> {
    table().get(&syscall).map(|info| info.arg_count)
}

const SIGNALS: [&str; 32] = [
    "None", "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT",
    "SIGBUS", "SIGFPE", "SIGKILL", "SIGUSR1", "SIGSEGV", "SIGUSR2", "SIGPIPE",
    "SIGALRM", "SIGTERM", "SIGSTKFLT", "SIGCHLD", "SIGCONT", "SIGSTOP",
    "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG", "SIGXCPU", "SIGXFSZ",
    "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGIO", "SIGPWR", "SIGSYS",
];

pub fn signal_name(signal: i32) -> &'static str {
    if signal >= 0 && (signal as usize) < SIGNALS.len() {
        SIGNALS[signal as usize]
    } else {
        "?????"
    }
}

/// strerror for regular errnos, plus the tracer-only restart codes.
pub fn errno_name(error: i32) -> String {
    match error {
        ERESTARTSYS => "ERESTARTSYS".to_owned(),
        ERESTARTNOINTR => "ERESTARTNOINTR".to_owned(),
        e => nix::errno::Errno::from_i32(e).desc().to_owned(),
    }
}

/// Describe a raw wait(2) status in words. Used by `--status` and when
/// building protocol-violation diagnoses.
pub fn diagnose_wait_status(status: i32) -> String {
    match WaitStatus::from_raw(Pid::from_raw(0), status) {
        Ok(WaitStatus::Exited(_, code)) => format!("exited with status {code}"),
        Ok(WaitStatus::Signaled(_, sig, core)) => format!(
            "killed by {} ({}){}",
            sig,
            sig as i32,
            if core { ", dumped core" } else { "" }
        ),
        Ok(WaitStatus::Stopped(_, sig)) => {
            format!("stopped by {} ({})", sig, sig as i32)
        }
        Ok(WaitStatus::PtraceEvent(_, _, event)) => {
            format!("ptrace {} event stop", ptrace_event_name(event))
        }
        Ok(WaitStatus::PtraceSyscall(_)) => "syscall-stop".to_owned(),
        Ok(WaitStatus::Continued(_)) => "continued".to_owned(),
        Ok(WaitStatus::StillAlive) => "no change of state".to_owned(),
        Err(_) => format!("unintelligible status {status:#x}"),
    }
}

pub fn ptrace_event_name(event: i32) -> &'static str {
    match event {
        libc::PTRACE_EVENT_FORK => "fork",
        libc::PTRACE_EVENT_VFORK => "vfork",
        libc::PTRACE_EVENT_CLONE => "clone",
        libc::PTRACE_EVENT_EXEC => "exec",
        libc::PTRACE_EVENT_EXIT => "exit",
        libc::PTRACE_EVENT_VFORK_DONE => "vfork-done",
        libc::PTRACE_EVENT_SECCOMP => "seccomp",
        libc::PTRACE_EVENT_STOP => "stop",
        _ => "unknown",
    }
}

/// Describe a `WaitStatus` we already hold (same wording as
/// [`diagnose_wait_status`], minus the re-parse).
pub fn describe_status(status: &WaitStatus) -> String {
    match status {
        WaitStatus::Exited(_, code) => format!("exited with status {code}"),
        WaitStatus::Signaled(_, sig, core) => format!(
            "killed by {} ({}){}",
            sig,
            *sig as i32,
            if *core { ", dumped core" } else { "" }
        ),
        WaitStatus::Stopped(_, sig) => format!("stopped by {} ({})", sig, *sig as i32),
        WaitStatus::PtraceEvent(_, _, event) => {
            format!("ptrace {} event stop", ptrace_event_name(*event))
        }
        WaitStatus::PtraceSyscall(_) => "syscall-stop".to_owned(),
        WaitStatus::Continued(_) => "continued".to_owned(),
        WaitStatus::StillAlive => "no change of state".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_knows_the_dispatch_set() {
        assert_eq!(name(FORK), "fork");
        assert_eq!(name(CLONE), "clone");
        assert_eq!(name(EXECVE), "execve");
        assert_eq!(name(EXECVEAT), "execveat");
        assert_eq!(name(WAIT4), "wait4");
        assert_eq!(name(WAITID), "waitid");
        assert_eq!(name(TGKILL), "tgkill");
        assert_eq!(arg_count(WAIT4), Some(4));
        assert_eq!(arg_count(WAITID), Some(5));
    }

    #[test]
    fn unknown_numbers_are_shrugged_at() {
        assert_eq!(name(9999), "?????");
        assert_eq!(name(NONE), "?????");
        assert_eq!(arg_count(9999), None);
    }

    #[test]
    fn location_syscall_has_a_name() {
        assert_eq!(name(LOCATION), "forktrace");
    }

    #[test]
    fn clone_flags_classification() {
        let fork_like = [libc::SIGCHLD as u64, 0, 0, 0, 0, 0];
        assert!(clone_is_fork_like(&fork_like));
        let thread = [0x00010000 | 0x00000100, 0, 0, 0, 0, 0]; // CLONE_THREAD|CLONE_VM
        assert!(!clone_is_fork_like(&thread));
    }

    #[test]
    fn wait_status_diagnosis() {
        assert_eq!(diagnose_wait_status(0), "exited with status 0");
        assert_eq!(diagnose_wait_status(0x0100), "exited with status 1");
        assert_eq!(diagnose_wait_status(9), "killed by SIGKILL (9)");
    }
}
