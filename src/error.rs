use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An OS call failed. `cause` names the syscall and call site.
    #[error("{cause}: {errno}")]
    System { errno: Errno, cause: &'static str },

    /// The ptrace protocol was violated: an event arrived out of order or at
    /// a strange time. The offending tracee should be dropped from the map.
    #[error("bad trace (pid {pid}): {msg}")]
    BadTrace { pid: i32, msg: String },

    /// An event notification violated the process tree's own invariants.
    /// Indicates a tracer bug; never fatal to the program.
    #[error("process tree: {0}")]
    ProcessTree(String),

    /// Invalid number/bool/command argument.
    #[error("{0}")]
    Parse(String),

    /// EFAULT/EIO from tracee memory I/O: the tracee handed us an address we
    /// cannot read or write. Always recovered locally.
    #[error("tracee {pid} gave an unusable address {addr:#x}")]
    IoFault { pid: i32, addr: u64 },

    /// The leader could not be brought up to its first successful exec.
    #[error("failed to start tracee: {0}")]
    Startup(String),
}

impl Error {
    /// Build a `System` error from a nix errno, tagging the failed call.
    pub fn system(cause: &'static str) -> impl FnOnce(Errno) -> Error {
        move |errno| Error::System { errno, cause }
    }

    pub fn bad_trace(pid: nix::unistd::Pid, msg: impl Into<String>) -> Error {
        Error::BadTrace {
            pid: pid.as_raw(),
            msg: msg.into(),
        }
    }
}
