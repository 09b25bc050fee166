use std::ffi::CString;
use std::os::raw::c_char;

use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, raise, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, setpgid, ForkResult, Pid};

use crate::error::{Error, Result};

/// The ptrace options every tracee is configured with:
///
/// - `EXITKILL`: if we die, everything we trace is SIGKILL'ed.
/// - `TRACESYSGOOD`: disambiguates syscall-stops from signal stops.
/// - `TRACEEXEC`: stop at each successful exec.
/// - `TRACEFORK` / `TRACECLONE`: auto-attach forked/cloned children.
pub const TRACE_OPTIONS: Options = Options::PTRACE_O_EXITKILL
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACECLONE);

/// Command to spawn as the traced leader process.
#[derive(Clone, Debug)]
pub struct Command {
    /// The program. Passed to `execvp()`, so $PATH applies.
    program: CString,

    /// Argument vector, including argv[0].
    argv: Vec<CString>,
}

impl Command {
    pub fn new(program: &str, argv: &[String]) -> Result<Self> {
        let program = CString::new(program)
            .map_err(|_| Error::Parse("program name contains a NUL byte".into()))?;
        let argv = argv
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::Parse("argument contains a NUL byte".into()))?;
        Ok(Self { program, argv })
    }

    /// Fork and exec the leader, leaving it in a ptrace-stop with
    /// [`TRACE_OPTIONS`] applied and its own process group established.
    ///
    /// The child syncs with us twice before exec: once right after
    /// `PTRACE_TRACEME` and once after `setpgid()`, each time by raising
    /// SIGSTOP. Errors on the child side are smuggled back through the exit
    /// status (see `errno_to_exit_status`).
    pub fn spawn_stopped(self) -> Result<Pid> {
        // These heap-allocate, and so must happen before forking.
        let argv = NullTerminatedPointerArray::new(&self.argv);

        let child = match unsafe { fork() }.map_err(Error::system("fork"))? {
            ForkResult::Child => {
                // In the child everything must be async-signal-safe: no
                // allocation, errors reported via _exit only.
                setup_child(&self.program, &argv);
                /* NOTREACHED */
            }
            ForkResult::Parent { child } => child,
        };

        // Sync #1: the child stops itself right after PTRACE_TRACEME.
        expect_sigstop(child, "ptrace(PTRACE_TRACEME)")?;
        if let Err(errno) = ptrace::cont(child, None) {
            kill_and_reap(child);
            return Err(Error::system("ptrace(PTRACE_CONT)")(errno));
        }

        // Sync #2: the child stops again after moving to its own group.
        expect_sigstop(child, "setpgid")?;
        if let Err(errno) = ptrace::setoptions(child, TRACE_OPTIONS) {
            kill_and_reap(child);
            return Err(Error::system("ptrace(PTRACE_SETOPTIONS)")(errno));
        }

        Ok(child)
    }
}

fn setup_child(program: &CString, argv: &NullTerminatedPointerArray) -> ! {
    // Don't inherit our blocked signals (we block SIGINT for the sigwaiter).
    let everything = SigSet::all();
    let _ = signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&everything), None);

    if ptrace::traceme().is_err() {
        unsafe { libc::_exit(errno_to_exit_status(Errno::last())) };
    }
    if raise(Signal::SIGSTOP).is_err() {
        unsafe { libc::_exit(7) };
    }
    if setpgid(Pid::from_raw(0), Pid::from_raw(0)).is_err() {
        unsafe { libc::_exit(errno_to_exit_status(Errno::last())) };
    }
    if raise(Signal::SIGSTOP).is_err() {
        unsafe { libc::_exit(7) };
    }

    // The raw call: the nix wrapper allocates, which is off-limits here.
    unsafe {
        libc::execvp(program.as_ptr(), argv.as_ptr());
        // The tracer learns the cause of failure through ptrace.
        libc::_exit(1);
    }
}

/// Wait for one of the startup SIGSTOP syncs. Anything else means the child
/// failed before exec; decode its report and clean up.
fn expect_sigstop(child: Pid, site: &'static str) -> Result<()> {
    let status = waitpid(child, None).map_err(Error::system("waitpid"))?;
    match status {
        WaitStatus::Stopped(_, Signal::SIGSTOP) => Ok(()),
        WaitStatus::Exited(_, code) => match exit_status_to_errno(code) {
            Some(errno) => Err(Error::System { errno, cause: site }),
            None => Err(Error::Startup("tracee exited during startup".into())),
        },
        WaitStatus::Signaled(..) => {
            Err(Error::Startup("tracee killed by an unexpected signal".into()))
        }
        WaitStatus::Stopped(..) => {
            kill_and_reap(child);
            Err(Error::Startup("tracee stopped by an unexpected signal".into()))
        }
        _ => {
            kill_and_reap(child);
            Err(Error::Startup("unexpected change of state by tracee".into()))
        }
    }
}

/// SIGKILL a child of ours and consume its exit notification so it doesn't
/// linger as a zombie. Fails silently; this only runs on error paths.
fn kill_and_reap(pid: Pid) {
    let _ = signal::kill(pid, Signal::SIGKILL);
    while waitpid(pid, None).is_ok() {}
}

// How the child reports a pre-exec errno back to the parent. We don't want
// to pass raw errno values through _exit since they can collide with real
// exit statuses the shell reserves.
fn errno_to_exit_status(errno: Errno) -> i32 {
    match errno {
        Errno::EBUSY => 1,
        Errno::EFAULT => 2,
        Errno::EINVAL => 3,
        Errno::EIO => 4,
        Errno::EPERM => 5,
        Errno::ESRCH => 6,
        _ => 7,
    }
}

fn exit_status_to_errno(status: i32) -> Option<Errno> {
    match status {
        1 => Some(Errno::EBUSY),
        2 => Some(Errno::EFAULT),
        3 => Some(Errno::EINVAL),
        4 => Some(Errno::EIO),
        5 => Some(Errno::EPERM),
        6 => Some(Errno::ESRCH),
        _ => None,
    }
}

// View of a slice of `CString` values as a NULL-terminated array of
// pointers, for handing to `execvp()` post-fork.
struct NullTerminatedPointerArray<'a> {
    array: Vec<*const c_char>,

    // Pointers in `array` are valid only while we hold this borrow.
    _data: &'a [CString],
}

impl<'a> NullTerminatedPointerArray<'a> {
    fn new(data: &'a [CString]) -> Self {
        let mut array: Vec<_> = data.iter().map(|s| s.as_ptr()).collect();
        array.push(std::ptr::null());
        Self { array, _data: data }
    }

    fn as_ptr(&self) -> *const *const c_char {
        self.array.as_ptr()
    }
}
