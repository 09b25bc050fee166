//! Tracee memory I/O.
//!
//! Everything here works in machine words through `PTRACE_PEEKDATA` and
//! `PTRACE_POKEDATA`. Writes that end mid-word read-modify-write the
//! trailing word so the untouched bytes survive. There are faster routes
//! (process_vm_readv, /proc/pid/mem) but the amounts moved here are tiny.
//!
//! Return convention, used by every function in this module and relied on
//! by the driver:
//!
//! - `Ok(Some(..))` - success.
//! - `Ok(None)` - the tracee no longer exists (ESRCH). The caller is
//!   responsible for consuming its exit notification.
//! - `Err(Error::IoFault)` - the tracee-supplied address is unreadable or
//!   unwritable (EFAULT/EIO). Callers that are preparing or observing a
//!   syscall recover from this by letting the syscall fail on its own.
//! - `Err(Error::System)` - anything else; a real problem.

use nix::errno::Errno;
use nix::unistd::Pid;

use crate::error::{Error, Result};

const WORD: usize = std::mem::size_of::<u64>();

fn peek(pid: Pid, addr: u64) -> Result<Option<u64>> {
    Errno::clear();
    let word = unsafe { libc::ptrace(libc::PTRACE_PEEKDATA, pid.as_raw(), addr, 0) };
    if word == -1 {
        match Errno::last() {
            Errno::UnknownErrno => {} // the word really was -1
            Errno::ESRCH => return Ok(None),
            Errno::EFAULT | Errno::EIO => {
                return Err(Error::IoFault {
                    pid: pid.as_raw(),
                    addr,
                })
            }
            errno => {
                return Err(Error::System {
                    errno,
                    cause: "ptrace(PTRACE_PEEKDATA)",
                })
            }
        }
    }
    Ok(Some(word as u64))
}

fn poke(pid: Pid, addr: u64, word: u64) -> Result<Option<()>> {
    let res = unsafe { libc::ptrace(libc::PTRACE_POKEDATA, pid.as_raw(), addr, word) };
    if res == -1 {
        match Errno::last() {
            Errno::ESRCH => return Ok(None),
            Errno::EFAULT | Errno::EIO => {
                return Err(Error::IoFault {
                    pid: pid.as_raw(),
                    addr,
                })
            }
            errno => {
                return Err(Error::System {
                    errno,
                    cause: "ptrace(PTRACE_POKEDATA)",
                })
            }
        }
    }
    Ok(Some(()))
}

/// Copy `len` bytes out of the tracee.
pub fn copy_from(pid: Pid, src: u64, len: usize) -> Result<Option<Vec<u8>>> {
    let mut out = Vec::with_capacity(len);
    let mut addr = src;
    while out.len() + WORD <= len {
        match peek(pid, addr)? {
            Some(word) => out.extend_from_slice(&word.to_ne_bytes()),
            None => return Ok(None),
        }
        addr += WORD as u64;
    }
    let rem = len - out.len();
    if rem != 0 {
        match peek(pid, addr)? {
            Some(word) => out.extend_from_slice(&word.to_ne_bytes()[..rem]),
            None => return Ok(None),
        }
    }
    Ok(Some(out))
}

/// Copy bytes into the tracee, preserving the bytes of any trailing
/// partially-covered word.
pub fn copy_to(pid: Pid, dest: u64, data: &[u8]) -> Result<Option<()>> {
    let mut addr = dest;
    let mut chunks = data.chunks_exact(WORD);
    for chunk in &mut chunks {
        let word = u64::from_ne_bytes(chunk.try_into().unwrap());
        if poke(pid, addr, word)?.is_none() {
            return Ok(None);
        }
        addr += WORD as u64;
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let Some(old) = peek(pid, addr)? else {
            return Ok(None);
        };
        let mut bytes = old.to_ne_bytes();
        bytes[..rem.len()].copy_from_slice(rem);
        if poke(pid, addr, u64::from_ne_bytes(bytes))?.is_none() {
            return Ok(None);
        }
    }
    Ok(Some(()))
}

/// Fill `len` bytes of tracee memory with `value`.
pub fn memset(pid: Pid, dest: u64, value: u8, len: usize) -> Result<Option<()>> {
    let word = u64::from_ne_bytes([value; WORD]);
    let mut addr = dest;
    let mut remaining = len;
    while remaining >= WORD {
        if poke(pid, addr, word)?.is_none() {
            return Ok(None);
        }
        addr += WORD as u64;
        remaining -= WORD;
    }
    if remaining != 0 {
        let Some(old) = peek(pid, addr)? else {
            return Ok(None);
        };
        let mut bytes = old.to_ne_bytes();
        bytes[..remaining].fill(value);
        if poke(pid, addr, u64::from_ne_bytes(bytes))?.is_none() {
            return Ok(None);
        }
    }
    Ok(Some(()))
}

/// Copy a NUL-terminated string out of the tracee. Invalid UTF-8 is
/// replaced rather than rejected; tracees get to pick their own argv.
pub fn read_cstring(pid: Pid, src: u64) -> Result<Option<String>> {
    let mut bytes = Vec::new();
    let mut addr = src;
    loop {
        let Some(word) = peek(pid, addr)? else {
            return Ok(None);
        };
        for byte in word.to_ne_bytes() {
            if byte == 0 {
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }
            bytes.push(byte);
        }
        addr += WORD as u64;
    }
}

/// Copy a NULL-terminated array of C strings (argv, envp) out of the tracee.
pub fn read_string_array(pid: Pid, array: u64) -> Result<Option<Vec<String>>> {
    let mut out = Vec::new();
    let mut slot = array;
    loop {
        let Some(ptr) = peek(pid, slot)? else {
            return Ok(None);
        };
        if ptr == 0 {
            return Ok(Some(out));
        }
        match read_cstring(pid, ptr)? {
            Some(s) => out.push(s),
            None => return Ok(None),
        }
        slot += WORD as u64;
    }
}
