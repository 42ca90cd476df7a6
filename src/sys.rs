//! Blocking OS primitives behind a mockable trait.
//!
//! Everything the worker, server, and conductor need from the host — pipes,
//! loopback sockets, readiness waits, child processes — goes through [`Sys`]
//! so the concurrency fabric can be exercised in tests against an in-memory
//! fake. [`HostSys`] is the POSIX implementation.

#[cfg(test)]
pub(crate) mod fake;

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::os::fd::IntoRawFd;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A file descriptor as handed out by the [`Sys`] implementation. Plain
/// integer so the fake can mint its own.
pub type Fd = i32;

/// Opaque child process identifier (the pid on POSIX).
pub type ChildId = u32;

/// One slot in a [`Sys::wait_readable`] call. The caller fills `fd`, the
/// implementation fills the event flags.
#[derive(Debug, Clone, Copy)]
pub struct WaitFd {
    pub fd: Fd,
    pub readable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl WaitFd {
    pub fn new(fd: Fd) -> Self {
        WaitFd {
            fd,
            readable: false,
            hangup: false,
            error: false,
        }
    }

    pub fn signalled(&self) -> bool {
        self.readable || self.hangup || self.error
    }
}

/// Result of a socket receive. A connection reset counts as `Closed`; only
/// genuinely unexpected failures surface as errors.
#[derive(Debug)]
pub enum Recv {
    Data(usize),
    Closed,
}

/// A freshly spawned child with the parent-side ends of its stdio pipes.
#[derive(Debug)]
pub struct SpawnedChild {
    pub child: ChildId,
    pub stdin: Fd,
    pub stdout: Fd,
}

/// The host capability surface.
///
/// Contracts the rest of the daemon relies on:
/// * `wait_readable` reports a hangup on any descriptor whose peer closed,
///   so a wait can be cancelled from another thread by closing (or writing
///   to) a dedicated wake descriptor included in the set;
/// * `recv` and `accept` distinguish a cleanly closed peer from a hard
///   error; `ECONNRESET` maps to [`Recv::Closed`];
/// * descriptors handed out here are never inherited by spawned children.
pub trait Sys: Send + Sync + 'static {
    fn pipe(&self) -> io::Result<(Fd, Fd)>;
    fn close(&self, fd: Fd);
    fn read(&self, fd: Fd, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&self, fd: Fd, buf: &[u8]) -> io::Result<usize>;

    /// Block until at least one descriptor has an event, or the timeout
    /// elapses. Returns the number of descriptors with events; zero means a
    /// timeout or spurious wakeup and the caller should re-check its state.
    fn wait_readable(&self, fds: &mut [WaitFd], timeout: Option<Duration>) -> io::Result<usize>;

    /// Bind a TCP listener on the loopback interface with an OS-chosen
    /// port. Returns the listening descriptor and the port.
    fn listen_local(&self) -> io::Result<(Fd, u16)>;
    fn accept(&self, listener: Fd) -> io::Result<Fd>;
    fn recv(&self, socket: Fd, buf: &mut [u8]) -> io::Result<Recv>;
    fn send(&self, socket: Fd, buf: &[u8]) -> io::Result<usize>;

    /// Spawn `path` with `args`, stdin and stdout redirected through fresh
    /// pipes. Stderr is inherited from the daemon.
    fn spawn_child(&self, path: &str, args: &[String]) -> io::Result<SpawnedChild>;

    /// Wait up to `timeout` for the child to exit. `Ok(true)` once it has;
    /// the child is reaped as a side effect.
    fn wait_child(&self, child: ChildId, timeout: Duration) -> io::Result<bool>;
    fn terminate_child(&self, child: ChildId) -> io::Result<()>;
    fn interrupt_child(&self, child: ChildId) -> io::Result<()>;

    /// Drop any bookkeeping for a child that will not be waited on again.
    fn release_child(&self, child: ChildId);
}

/// POSIX implementation of [`Sys`].
pub struct HostSys {
    children: Mutex<HashMap<ChildId, std::process::Child>>,
}

impl HostSys {
    pub fn new() -> Arc<Self> {
        Arc::new(HostSys {
            children: Mutex::new(HashMap::new()),
        })
    }
}

fn set_cloexec(fd: Fd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn poll_timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(duration) => duration.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

impl Sys for HostSys {
    fn pipe(&self) -> io::Result<(Fd, Fd)> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            if let Err(err) = set_cloexec(fd) {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
        Ok((fds[0], fds[1]))
    }

    fn close(&self, fd: Fd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let result = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(result as usize);
        }
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> io::Result<usize> {
        loop {
            let result = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(result as usize);
        }
    }

    fn wait_readable(&self, fds: &mut [WaitFd], timeout: Option<Duration>) -> io::Result<usize> {
        let mut pollfds: Vec<libc::pollfd> = fds
            .iter()
            .map(|entry| libc::pollfd {
                fd: entry.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let timeout_ms = poll_timeout_ms(timeout);
        let ready = loop {
            let result = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            break result as usize;
        };

        for (entry, pollfd) in fds.iter_mut().zip(&pollfds) {
            entry.readable = pollfd.revents & libc::POLLIN != 0;
            entry.hangup = pollfd.revents & libc::POLLHUP != 0;
            entry.error = pollfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0;
        }
        Ok(ready)
    }

    fn listen_local(&self) -> io::Result<(Fd, u16)> {
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, libc::IPPROTO_TCP);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let enable: libc::c_int = 1;
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&enable as *const libc::c_int).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            if let Err(err) = set_cloexec(fd) {
                libc::close(fd);
                return Err(err);
            }

            let mut addr: libc::sockaddr_in = std::mem::zeroed();
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = 0;
            addr.sin_addr.s_addr = u32::from(Ipv4Addr::LOCALHOST).to_be();
            if libc::bind(
                fd,
                (&addr as *const libc::sockaddr_in).cast(),
                size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            let mut bound: libc::sockaddr_in = std::mem::zeroed();
            let mut bound_len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
            if libc::getsockname(
                fd,
                (&mut bound as *mut libc::sockaddr_in).cast(),
                &mut bound_len,
            ) < 0
            {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }
            let port = u16::from_be(bound.sin_port);

            if libc::listen(fd, libc::SOMAXCONN) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err);
            }

            Ok((fd, port))
        }
    }

    fn accept(&self, listener: Fd) -> io::Result<Fd> {
        loop {
            let fd = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            set_cloexec(fd)?;
            return Ok(fd);
        }
    }

    fn recv(&self, socket: Fd, buf: &mut [u8]) -> io::Result<Recv> {
        loop {
            let result = unsafe { libc::recv(socket, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if result == 0 {
                return Ok(Recv::Closed);
            }
            if result < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::ConnectionReset => return Ok(Recv::Closed),
                    _ => return Err(err),
                }
            }
            return Ok(Recv::Data(result as usize));
        }
    }

    fn send(&self, socket: Fd, buf: &[u8]) -> io::Result<usize> {
        loop {
            let result = unsafe { libc::send(socket, buf.as_ptr().cast(), buf.len(), 0) };
            if result < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(result as usize);
        }
    }

    fn spawn_child(&self, path: &str, args: &[String]) -> io::Result<SpawnedChild> {
        let mut child = Command::new(path)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout unavailable"))?;

        let spawned = SpawnedChild {
            child: child.id(),
            stdin: stdin.into_raw_fd(),
            stdout: stdout.into_raw_fd(),
        };
        self.children
            .lock()
            .unwrap()
            .insert(spawned.child, child);
        Ok(spawned)
    }

    fn wait_child(&self, child: ChildId, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut children = self.children.lock().unwrap();
                let Some(handle) = children.get_mut(&child) else {
                    return Ok(true);
                };
                if handle.try_wait()?.is_some() {
                    children.remove(&child);
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    fn terminate_child(&self, child: ChildId) -> io::Result<()> {
        send_signal(child, libc::SIGTERM)
    }

    fn interrupt_child(&self, child: ChildId) -> io::Result<()> {
        send_signal(child, libc::SIGINT)
    }

    fn release_child(&self, child: ChildId) {
        self.children.lock().unwrap().remove(&child);
    }
}

fn send_signal(child: ChildId, signal: libc::c_int) -> io::Result<()> {
    let result = unsafe { libc::kill(child as libc::pid_t, signal) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // Already gone is as good as delivered.
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}
