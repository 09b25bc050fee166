//! Orphan intake.
//!
//! Orphaned tracees are collected by the `forktrace-reaper` helper, which
//! must sit *above* us in the process tree: so at startup we fork, the
//! parent execs the helper, and the original program carries on as the
//! child. The helper marks itself a sub-reaper and writes each pid it
//! reaps down a pipe as raw native bytes; a background thread reads them
//! into the shared orphan queue.
//!
//! A second background thread sigwaits on SIGINT (blocked in every other
//! thread) and nukes the tracees when it fires.

use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::thread::JoinHandleExt;
use std::sync::Arc;
use std::thread::JoinHandle;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{close, dup2, fork, getpid, pipe, ForkResult, Pid};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::tracer::Control;

/// Fork the reaper helper around us. On return *we are the child*: our
/// pid has changed, the helper is our parent, and the returned file is
/// the read end of the pid pipe. Returns an error if the plumbing failed
/// (the caller can then run without orphan tracking).
pub fn start_reaper() -> Result<File> {
    let (read_fd, write_fd) = pipe().map_err(Error::system("pipe"))?;

    // The read end must not leak into the helper, nor into the tracees we
    // fork-exec later on.
    set_cloexec(read_fd).inspect_err(|_| {
        let _ = close(read_fd);
        let _ = close(write_fd);
    })?;

    match unsafe { fork() }.map_err(Error::system("fork"))? {
        ForkResult::Parent { child } => {
            // The parent becomes the reaper; this never returns.
            exec_reaper(child, write_fd);
        }
        ForkResult::Child => {
            let _ = close(write_fd);

            // If the helper dies, we die, and EXITKILL takes the tracees.
            let res = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGHUP) };
            if res == -1 {
                let _ = close(read_fd);
                return Err(Error::system("prctl(PR_SET_PDEATHSIG)")(Errno::last()));
            }

            Ok(unsafe { File::from_raw_fd(read_fd) })
        }
    }
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD).map_err(Error::system("fcntl(F_GETFD)"))?;
    let flags = FdFlag::from_bits_truncate(flags) | FdFlag::FD_CLOEXEC;
    fcntl(fd, FcntlArg::F_SETFD(flags)).map_err(Error::system("fcntl(F_SETFD)"))?;
    Ok(())
}

/// Exec the helper with the pipe's write end as its stdout. On failure,
/// take the child (the real forktrace) down with us.
fn exec_reaper(child: Pid, write_fd: RawFd) -> ! {
    if dup2(write_fd, libc::STDOUT_FILENO).is_err() {
        error!("dup2: {}", Errno::last());
        let _ = signal::kill(child, Signal::SIGHUP);
        let _ = waitpid(child, None);
        std::process::exit(1);
    }
    let _ = close(write_fd);

    let helper = std::ffi::CString::new("forktrace-reaper").unwrap();
    let argv = [helper.as_ptr(), std::ptr::null()];
    unsafe {
        // $PATH first, then next to our own binary.
        libc::execvp(helper.as_ptr(), argv.as_ptr());
        if let Ok(path) = std::env::current_exe() {
            if let Some(dir) = path.parent() {
                if let Ok(sibling) =
                    std::ffi::CString::new(dir.join("forktrace-reaper").to_string_lossy().as_bytes())
                {
                    libc::execv(sibling.as_ptr(), argv.as_ptr());
                }
            }
        }
    }
    error!("couldn't exec forktrace-reaper: {}", Errno::last());
    let _ = signal::kill(child, Signal::SIGHUP);
    let _ = waitpid(child, None);
    std::process::exit(1);
}

/// Read orphan pids off the reaper pipe onto the queue until EOF or
/// cancellation.
pub fn spawn_reader(control: Arc<Control>, mut pipe: File) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut buf = [0u8; std::mem::size_of::<libc::pid_t>()];
        loop {
            match pipe.read_exact(&mut buf) {
                Ok(()) => {}
                Err(err) => {
                    debug!("reaper pipe closed: {err}");
                    break;
                }
            }
            if control.done() {
                break;
            }
            control.notify_orphan(i32::from_ne_bytes(buf));
        }
    })
}

/// Cancel and join the reader thread: make future reads fail fast with
/// O_NONBLOCK, then interrupt the current one with SIGUSR1 (whose handler
/// is installed without SA_RESTART exactly so reads abort with EINTR).
pub fn join_reader(reader: JoinHandle<()>, pipe_fd: RawFd) {
    let flags = match fcntl(pipe_fd, FcntlArg::F_GETFL) {
        Ok(flags) => flags,
        Err(errno) => {
            error!("couldn't cancel reaper thread: fcntl: {errno}");
            return; // leak the thread, we're exiting anyway
        }
    };
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    if let Err(errno) = fcntl(pipe_fd, FcntlArg::F_SETFL(flags)) {
        error!("couldn't cancel reaper thread: fcntl: {errno}");
        return;
    }
    unsafe {
        libc::pthread_kill(reader.as_pthread_t(), libc::SIGUSR1);
    }
    let _ = reader.join();
}

/// Block SIGINT in this (and every future) thread so only the sigwaiter
/// sees it. Call before spawning any threads.
pub fn block_sigint() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    signal::pthread_sigmask(signal::SigmaskHow::SIG_BLOCK, Some(&set), None)
        .map_err(Error::system("pthread_sigmask"))?;
    Ok(())
}

/// Wait for Ctrl+C and nuke the tracees when it arrives.
pub fn spawn_sigwaiter(control: Arc<Control>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut set = SigSet::empty();
        set.add(Signal::SIGINT);
        while set.wait().is_ok() {
            if control.done() {
                return;
            }
            control.nuke();
        }
    })
}

/// Wake and join the sigwaiter. The self-signal queues even if the thread
/// isn't blocked right now.
pub fn join_sigwaiter(sigwaiter: JoinHandle<()>) {
    let _ = signal::kill(getpid(), Signal::SIGINT);
    let _ = sigwaiter.join();
}

extern "C" fn fatal_signal_handler(signal: libc::c_int) {
    // Async-signal-safe: a raw write and an immediate exit.
    let msg = b"[forktrace] caught a fatal signal, exiting\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::_exit(128 + signal);
    }
}

extern "C" fn noop_handler(_signal: libc::c_int) {}

/// Install the process-wide signal handling: fatal signals report and
/// exit, and SIGUSR1 gets an empty non-restarting handler so it can break
/// the reader thread out of a blocking read.
pub fn register_signals() {
    let fatal = SigAction::new(
        SigHandler::Handler(fatal_signal_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [
        Signal::SIGHUP,
        Signal::SIGABRT,
        Signal::SIGTERM,
        Signal::SIGQUIT,
        Signal::SIGSEGV,
        Signal::SIGILL,
        Signal::SIGFPE,
        Signal::SIGPIPE,
    ] {
        unsafe {
            let _ = signal::sigaction(signal, &fatal);
        }
    }

    // Deliberately no SA_RESTART: interrupted reads must fail with EINTR.
    let noop = SigAction::new(
        SigHandler::Handler(noop_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        let _ = signal::sigaction(Signal::SIGUSR1, &noop);
    }
}
