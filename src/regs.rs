//! Register-level access to tracees on x86_64.
//!
//! Syscall numbers and arguments are read in bulk with `PTRACE_GETREGS`;
//! individual registers are patched through the `USER` area with
//! `PEEKUSER`/`POKEUSER`, whose offsets we compute with `memoffset` (the
//! kernel does not treat them as real pointer offsets).
//!
//! Every function returns `Ok(None)` when the tracee has vanished (ESRCH),
//! per the convention described in [`crate::mem`].

use memoffset::offset_of;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// No Linux syscall has more than six arguments.
pub const SYS_ARG_MAX: usize = 6;

fn user_regs_offset(reg: usize) -> u64 {
    (offset_of!(libc::user, regs) + reg) as u64
}

fn rax_offset() -> u64 {
    user_regs_offset(offset_of!(libc::user_regs_struct, rax))
}

fn orig_rax_offset() -> u64 {
    user_regs_offset(offset_of!(libc::user_regs_struct, orig_rax))
}

fn rbp_offset() -> u64 {
    user_regs_offset(offset_of!(libc::user_regs_struct, rbp))
}

// Linux syscall argument registers, in order.
fn arg_offset(index: usize) -> u64 {
    let regs = [
        offset_of!(libc::user_regs_struct, rdi),
        offset_of!(libc::user_regs_struct, rsi),
        offset_of!(libc::user_regs_struct, rdx),
        offset_of!(libc::user_regs_struct, r10),
        offset_of!(libc::user_regs_struct, r8),
        offset_of!(libc::user_regs_struct, r9),
    ];
    user_regs_offset(regs[index])
}

fn peek_user(pid: Pid, offset: u64, cause: &'static str) -> Result<Option<u64>> {
    // SAFETY: the offset is not used as a pointer offset by the kernel.
    Errno::clear();
    let value = unsafe {
        libc::ptrace(
            libc::PTRACE_PEEKUSER,
            pid.as_raw(),
            offset,
            0,
        )
    };
    if value == -1 {
        match Errno::last() {
            Errno::UnknownErrno => {} // the register really held -1
            Errno::ESRCH => return Ok(None),
            errno => return Err(Error::System { errno, cause }),
        }
    }
    Ok(Some(value as u64))
}

fn poke_user(pid: Pid, offset: u64, value: u64, cause: &'static str) -> Result<Option<()>> {
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid.as_raw(),
            offset,
            value,
        )
    };
    if res == -1 {
        match Errno::last() {
            Errno::ESRCH => return Ok(None),
            errno => return Err(Error::System { errno, cause }),
        }
    }
    Ok(Some(()))
}

/// Read the syscall number and argument registers. Only meaningful at a
/// syscall-entry-stop.
pub fn which_syscall(pid: Pid) -> Result<Option<(i64, [u64; SYS_ARG_MAX])>> {
    let regs = match ptrace::getregs(pid) {
        Ok(regs) => regs,
        Err(Errno::ESRCH) => return Ok(None),
        Err(errno) => {
            return Err(Error::System {
                errno,
                cause: "ptrace(PTRACE_GETREGS)",
            })
        }
    };
    let args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];
    Ok(Some((regs.orig_rax as i64, args)))
}

/// Read the syscall return value. Only meaningful at a syscall-exit-stop.
pub fn return_value(pid: Pid) -> Result<Option<u64>> {
    peek_user(pid, rax_offset(), "ptrace(PTRACE_PEEKUSER, rax)")
}

/// Overwrite one syscall argument. Only valid at a syscall-entry-stop.
pub fn set_arg(pid: Pid, index: usize, value: u64) -> Result<Option<()>> {
    assert!(index < SYS_ARG_MAX);
    poke_user(pid, arg_offset(index), value, "ptrace(PTRACE_POKEUSER, arg)")
}

/// Rewrite the syscall number about to be executed. Rewriting to
/// [`crate::syscalls::NONE`] makes the call fail with ENOSYS.
pub fn set_syscall(pid: Pid, syscall: i64) -> Result<Option<()>> {
    poke_user(
        pid,
        orig_rax_offset(),
        syscall as u64,
        "ptrace(PTRACE_POKEUSER, orig_rax)",
    )
}

/// A page-aligned address in the tracee that is almost certainly mapped
/// read-write: the frame pointer rounded down to its page. Used as scratch
/// space when a tracee passes NULL for a wait result argument.
pub fn result_scratch_addr(pid: Pid) -> Result<Option<u64>> {
    let page = page_size();
    match peek_user(pid, rbp_offset(), "ptrace(PTRACE_PEEKUSER, rbp)")? {
        Some(rbp) => Ok(Some(rbp & !(page - 1))),
        None => Ok(None),
    }
}

pub fn page_size() -> u64 {
    // sysconf(_SC_PAGESIZE) cannot fail on Linux.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}
