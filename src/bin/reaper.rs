//! The sub-reaper helper.
//!
//! Sits above the tracer in the process tree, adopts every orphan below
//! it, and reports each pid it reaps to the tracer by writing the raw
//! native bytes to stdout (which the tracer has plumbed to a pipe). The
//! tracer already knows the exit statuses, so pids are all we send.

use std::io::Write;

use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{wait, WaitStatus};

fn fail(what: &str, errno: Errno) -> ! {
    eprintln!("forktrace-reaper: {what}: {errno}");
    std::process::exit(1);
}

fn main() {
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1) } == -1 {
        fail("prctl", Errno::last());
    }
    // The tracer may quit before us; writes then see EPIPE, not SIGPIPE.
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }

    let mut out = std::io::stdout();
    loop {
        let pid = match wait() {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, ..)) => pid,
            Ok(_) => continue,
            Err(Errno::ECHILD) => break, // everyone is gone
            Err(Errno::EINTR) => continue,
            Err(errno) => fail("wait", errno),
        };

        let bytes = pid.as_raw().to_ne_bytes();
        if let Err(err) = out.write_all(&bytes).and_then(|_| out.flush()) {
            if err.raw_os_error() == Some(libc::EPIPE) {
                continue; // nobody listening; keep reaping regardless
            }
            fail("writing pid", Errno::from_i32(err.raw_os_error().unwrap_or(0)));
        }
    }
}
