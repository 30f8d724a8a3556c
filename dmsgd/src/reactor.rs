// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! `poll(2)` reactor wiring one `dmsg_core::IOCom` to a real TCP socket, a
//! self-pipe for cross-thread wakeups, and an optional alternate fd --
//! modeled directly on `dmsg_iocom_core`'s loop shape (see
//! `examples/original_source/lib/libdmsg/msg.c`) rather than Redox's
//! `EventQueue`, the way `nvme-driver`'s `main.rs` wires `nvme-core` to IRQ
//! files instead.

use std::fs::File;
use std::io::{self, Read};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use dmsg_core::{Disposition, IOCom};
use log::{debug, error, warn};
use parking_lot::Mutex;

/// Matches the protocol-level bound on a single message's aux-data length
/// (spec §6); `dmsgd` doesn't currently allow configuring it below that,
/// only enforcing a tighter ceiling is meaningful here.
pub const DEFAULT_AUX_CAP: u32 = 1 << 20;

const POLL_TIMEOUT_MS: i32 = 5000;
const READ_CHUNK: usize = 64 * 1024;

/// The self-pipe (spec's cross-thread wakeup mechanism): other threads
/// call `kick()` right after `IOCom::post` to get the loop thread to
/// notice `PWORK` promptly instead of waiting out the poll timeout.
pub struct Wakeup {
    r: File,
    w: RawFd,
}

impl Wakeup {
    pub fn new() -> io::Result<Self> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            libc::fcntl(fds[0], libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(fds[1], libc::F_SETFL, libc::O_NONBLOCK);
        }
        Ok(Wakeup {
            r: unsafe { File::from_raw_fd(fds[0]) },
            w: fds[1],
        })
    }

    fn raw_read_fd(&self) -> RawFd {
        self.r.as_raw_fd()
    }

    pub fn kick(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.w, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 4096];
        loop {
            match self.r.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }
}

impl Drop for Wakeup {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.w);
        }
    }
}

/// Runs one connection's `dmsg_iocom_core`-shaped loop to completion
/// (until the `IOCom` reaches `EOF` or the socket hard-fails). `iocom` is
/// shared with whatever thread originates outbound traffic via `post`;
/// that thread should call `wakeup.kick()` after posting so this loop
/// doesn't sit out the rest of the poll timeout.
pub fn run(iocom: Arc<Mutex<IOCom>>, mut stream: TcpStream, mut wakeup: Wakeup) -> io::Result<()> {
    stream.set_nonblocking(true)?;
    let sock_fd = stream.as_raw_fd();

    loop {
        if iocom.lock().is_eof() {
            break;
        }

        let has_pending = {
            let g = iocom.lock();
            g.has_pending_work() || g.has_inbox_work()
        };

        if !has_pending {
            let want_write = iocom.lock().egress_wants_write();
            let mut fds = [
                libc::pollfd {
                    fd: wakeup.raw_read_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: sock_fd,
                    events: libc::POLLIN | if want_write { libc::POLLOUT } else { 0 },
                    revents: 0,
                },
            ];
            let rc = unsafe {
                libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if fds[0].revents & libc::POLLIN != 0 {
                wakeup.drain();
            }
        }

        // PWORK: move anything `post` queued onto the egress ring.
        iocom.lock().drain_inbox();

        // WWORK
        if iocom.lock().egress_wants_write() {
            let mut g = iocom.lock();
            if let Err(e) = g.flush(&mut stream) {
                if e.kind() != io::ErrorKind::WouldBlock {
                    error!("dmsg: socket write failed: {}", e);
                    return Err(e);
                }
            }
        }

        // RWORK: drain whatever the socket currently has into the ingress
        // FIFO, then let the transaction state machine run over it.
        let mut buf = [0u8; READ_CHUNK];
        let mut saw_eof = false;
        loop {
            match stream.read(&mut buf) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => {
                    iocom.lock().feed_rx(&buf[..n]);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("dmsg: socket read failed: {}", e);
                    return Err(e);
                }
            }
        }

        {
            let mut g = iocom.lock();
            g.process_rx(|_iocom, msg, disp| match disp {
                Disposition::Created(sid) => {
                    debug!("dmsg: msgid {} created state {:?}", msg.header.msgid, sid)
                }
                Disposition::Stream(sid) => {
                    debug!("dmsg: stream data on state {:?} ({} aux bytes)", sid, msg.aux.len())
                }
                Disposition::Closed { state, freed } => {
                    debug!("dmsg: state {:?} closed (freed={})", state, freed)
                }
            });
        }

        if saw_eof {
            debug!("dmsg: peer closed connection");
            iocom.lock().on_socket_eof();
        }
    }

    Ok(())
}
