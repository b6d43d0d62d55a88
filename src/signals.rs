// src/signals.rs
//
// Signal bridge: SIGALRM and SIGTERM are forwarded as single bytes down a
// non-blocking self-pipe, so the only work in handler context is one write
// and all real handling happens on the reactor thread. SIGPIPE is ignored
// process-wide.

use std::io;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::c_int;

use crate::syscalls;

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(sig: c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    unsafe {
        // Handler context: preserve errno around the write.
        let saved = *libc::__errno_location();
        let byte = sig as u8;
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *libc::__errno_location() = saved;
    }
}

/// Install the bridge. Returns the pipe's read end for epoll registration.
pub fn install() -> io::Result<c_int> {
    let (read_fd, write_fd) = syscalls::create_pipe()?;
    PIPE_WRITE_FD.store(write_fd, Ordering::SeqCst);

    add_handler(libc::SIGALRM)?;
    add_handler(libc::SIGTERM)?;
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    Ok(read_fd)
}

fn add_handler(sig: c_int) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(c_int) = forward_signal;
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Arm (or re-arm) the periodic SIGALRM.
pub fn arm_alarm(secs: u64) {
    unsafe {
        libc::alarm(secs as libc::c_uint);
    }
}

/// Drain pending signal bytes from the pipe's read end.
pub fn drain(read_fd: c_int) -> Vec<c_int> {
    let mut buf = [0u8; 1024];
    match syscalls::read_nonblocking(read_fd, &mut buf) {
        Ok(Some(n)) if n > 0 => buf[..n].iter().map(|&b| b as c_int).collect(),
        _ => Vec::new(),
    }
}
