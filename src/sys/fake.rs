//! In-memory [`Sys`] implementation for tests.
//!
//! Pipes and sockets are modeled as byte streams guarded by one mutex and
//! condition variable, so blocking reads and readiness waits behave like the
//! real thing without touching the host. Children are scriptable: tests push
//! bytes into a child's stdout, inspect what was written to its stdin, and
//! decide whether it exits when its stdin closes.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{ChildId, Fd, Recv, SpawnedChild, Sys, WaitFd};

struct StreamState {
    data: VecDeque<u8>,
    write_closed: bool,
    read_closed: bool,
}

impl StreamState {
    fn new() -> Self {
        StreamState {
            data: VecDeque::new(),
            write_closed: false,
            read_closed: false,
        }
    }
}

enum FdEntry {
    Stream {
        read: Option<usize>,
        write: Option<usize>,
    },
    Listener {
        pending: VecDeque<Fd>,
        port: u16,
    },
}

struct FakeChild {
    path: String,
    args: Vec<String>,
    stdin_stream: usize,
    stdout_stream: usize,
    running: bool,
    stubborn: bool,
    terminations: u32,
    interrupts: u32,
}

struct FakeState {
    next_fd: Fd,
    next_child: ChildId,
    next_port: u16,
    streams: Vec<StreamState>,
    fds: HashMap<Fd, FdEntry>,
    children: HashMap<ChildId, FakeChild>,
    fail_next_spawn: Option<String>,
    last_child: Option<ChildId>,
}

impl FakeState {
    fn new_stream(&mut self) -> usize {
        self.streams.push(StreamState::new());
        self.streams.len() - 1
    }

    fn new_fd(&mut self, entry: FdEntry) -> Fd {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, entry);
        fd
    }

    /// A child that is not stubborn exits as soon as its stdin closes.
    fn propagate_child_exits(&mut self) {
        let exiting: Vec<ChildId> = self
            .children
            .iter()
            .filter(|(_, child)| {
                child.running && !child.stubborn && self.streams[child.stdin_stream].write_closed
            })
            .map(|(id, _)| *id)
            .collect();
        for id in exiting {
            self.exit_child(id);
        }
    }

    fn exit_child(&mut self, id: ChildId) {
        if let Some(child) = self.children.get_mut(&id) {
            child.running = false;
            self.streams[child.stdout_stream].write_closed = true;
        }
    }
}

pub(crate) struct FakeSys {
    state: Mutex<FakeState>,
    cv: Condvar,
}

impl FakeSys {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeSys {
            state: Mutex::new(FakeState {
                next_fd: 100,
                next_child: 9000,
                next_port: 50000,
                streams: Vec::new(),
                fds: HashMap::new(),
                children: HashMap::new(),
                fail_next_spawn: None,
                last_child: None,
            }),
            cv: Condvar::new(),
        })
    }

    // --- test-side controls ---------------------------------------------

    /// Open a client connection to a bound fake listener. Returns the
    /// client-side descriptor; the server side shows up on `accept`.
    pub(crate) fn client_connect(&self, port: u16) -> Fd {
        let mut state = self.state.lock().unwrap();
        let to_server = state.new_stream();
        let to_client = state.new_stream();
        let server_fd = state.new_fd(FdEntry::Stream {
            read: Some(to_server),
            write: Some(to_client),
        });
        let client_fd = state.new_fd(FdEntry::Stream {
            read: Some(to_client),
            write: Some(to_server),
        });
        let listener = state
            .fds
            .values_mut()
            .find_map(|entry| match entry {
                FdEntry::Listener { pending, port: p } if *p == port => Some(pending),
                _ => None,
            })
            .expect("no fake listener bound on that port");
        listener.push_back(server_fd);
        self.cv.notify_all();
        client_fd
    }

    pub(crate) fn child_emit(&self, child: ChildId, bytes: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let stream = state.children[&child].stdout_stream;
        state.streams[stream].data.extend(bytes);
        self.cv.notify_all();
    }

    /// Everything the daemon has written to the child's stdin so far.
    pub(crate) fn child_written(&self, child: ChildId) -> Vec<u8> {
        let mut state = self.state.lock().unwrap();
        let stream = state.children[&child].stdin_stream;
        state.streams[stream].data.drain(..).collect()
    }

    pub(crate) fn child_exit(&self, child: ChildId) {
        let mut state = self.state.lock().unwrap();
        state.exit_child(child);
        self.cv.notify_all();
    }

    /// A stubborn child ignores stdin closing and keeps running until it is
    /// terminated.
    pub(crate) fn set_stubborn(&self, child: ChildId) {
        let mut state = self.state.lock().unwrap();
        state.children.get_mut(&child).unwrap().stubborn = true;
    }

    pub(crate) fn fail_next_spawn(&self, message: &str) {
        self.state.lock().unwrap().fail_next_spawn = Some(message.to_string());
    }

    pub(crate) fn last_child(&self) -> ChildId {
        self.state
            .lock()
            .unwrap()
            .last_child
            .expect("no child spawned yet")
    }

    pub(crate) fn spawn_argv(&self, child: ChildId) -> (String, Vec<String>) {
        let state = self.state.lock().unwrap();
        let record = &state.children[&child];
        (record.path.clone(), record.args.clone())
    }

    pub(crate) fn terminations(&self, child: ChildId) -> u32 {
        self.state.lock().unwrap().children[&child].terminations
    }

    pub(crate) fn interrupts(&self, child: ChildId) -> u32 {
        self.state.lock().unwrap().children[&child].interrupts
    }

    pub(crate) fn child_running(&self, child: ChildId) -> bool {
        self.state.lock().unwrap().children[&child].running
    }

    /// Test-side receive with a deadline so a broken daemon fails the test
    /// instead of hanging it.
    pub(crate) fn recv_deadline(
        &self,
        socket: Fd,
        buf: &mut [u8],
        timeout: Duration,
    ) -> io::Result<Recv> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match read_stream_of(&mut state, socket)? {
                StreamRead::Data(bytes) => {
                    let n = bytes.len().min(buf.len());
                    for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(Recv::Data(n));
                }
                StreamRead::Eof => return Ok(Recv::Closed),
                StreamRead::Empty => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "recv deadline"));
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, deadline.saturating_duration_since(now))
                .unwrap();
            state = next;
        }
    }

    /// Send a length-prefixed frame from a test client.
    pub(crate) fn send_frame(&self, socket: Fd, payload: &[u8]) {
        let framed = crate::framing::encode(payload);
        let mut written = 0;
        while written < framed.len() {
            written += self.send(socket, &framed[written..]).expect("send frame");
        }
    }

    /// Receive one length-prefixed frame on a test client, with a deadline.
    pub(crate) fn recv_frame_deadline(&self, socket: Fd, timeout: Duration) -> io::Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut prefix = [0u8; crate::framing::LENGTH_PREFIX];
        self.recv_exact_deadline(socket, &mut prefix, deadline)?;
        let mut payload = vec![0u8; crate::framing::payload_length(prefix)];
        self.recv_exact_deadline(socket, &mut payload, deadline)?;
        Ok(payload)
    }

    fn recv_exact_deadline(
        &self,
        socket: Fd,
        buf: &mut [u8],
        deadline: Instant,
    ) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_deadline(socket, &mut buf[filled..], remaining)? {
                Recv::Data(n) => filled += n,
                Recv::Closed => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed mid-frame",
                    ));
                }
            }
        }
        Ok(())
    }
}

enum StreamRead<'a> {
    Data(&'a mut VecDeque<u8>),
    Eof,
    Empty,
}

fn read_stream_of(state: &mut FakeState, fd: Fd) -> io::Result<StreamRead<'_>> {
    let stream = match state.fds.get(&fd) {
        Some(FdEntry::Stream { read: Some(id), .. }) => *id,
        Some(_) => return Err(io::Error::other("descriptor is not readable")),
        None => return Err(io::Error::other("read from closed descriptor")),
    };
    let stream = &mut state.streams[stream];
    if !stream.data.is_empty() {
        return Ok(StreamRead::Data(&mut stream.data));
    }
    if stream.write_closed {
        return Ok(StreamRead::Eof);
    }
    Ok(StreamRead::Empty)
}

fn write_stream_of(state: &mut FakeState, fd: Fd) -> io::Result<usize> {
    match state.fds.get(&fd) {
        Some(FdEntry::Stream {
            write: Some(id), ..
        }) => Ok(*id),
        Some(_) => Err(io::Error::other("descriptor is not writable")),
        None => Err(io::Error::other("write to closed descriptor")),
    }
}

impl Sys for FakeSys {
    fn pipe(&self) -> io::Result<(Fd, Fd)> {
        let mut state = self.state.lock().unwrap();
        let stream = state.new_stream();
        let read_fd = state.new_fd(FdEntry::Stream {
            read: Some(stream),
            write: None,
        });
        let write_fd = state.new_fd(FdEntry::Stream {
            read: None,
            write: Some(stream),
        });
        Ok((read_fd, write_fd))
    }

    fn close(&self, fd: Fd) {
        let mut state = self.state.lock().unwrap();
        match state.fds.remove(&fd) {
            Some(FdEntry::Stream { read, write }) => {
                if let Some(id) = read {
                    state.streams[id].read_closed = true;
                }
                if let Some(id) = write {
                    state.streams[id].write_closed = true;
                }
                state.propagate_child_exits();
            }
            Some(FdEntry::Listener { .. }) | None => {}
        }
        self.cv.notify_all();
    }

    fn read(&self, fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        loop {
            match read_stream_of(&mut state, fd)? {
                StreamRead::Data(bytes) => {
                    let n = bytes.len().min(buf.len());
                    for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
                StreamRead::Eof => return Ok(0),
                StreamRead::Empty => {}
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    fn write(&self, fd: Fd, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let stream = write_stream_of(&mut state, fd)?;
        if state.streams[stream].read_closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "reader closed the stream",
            ));
        }
        state.streams[stream].data.extend(buf);
        self.cv.notify_all();
        Ok(buf.len())
    }

    fn wait_readable(&self, fds: &mut [WaitFd], timeout: Option<Duration>) -> io::Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            let mut ready = 0;
            for entry in fds.iter_mut() {
                entry.readable = false;
                entry.hangup = false;
                entry.error = false;
                match state.fds.get(&entry.fd) {
                    Some(FdEntry::Stream { read: Some(id), .. }) => {
                        let stream = &state.streams[*id];
                        entry.readable = !stream.data.is_empty();
                        entry.hangup = stream.write_closed;
                    }
                    Some(FdEntry::Stream { write: Some(id), .. }) => {
                        entry.error = state.streams[*id].read_closed;
                    }
                    Some(FdEntry::Stream { .. }) => {}
                    Some(FdEntry::Listener { pending, .. }) => {
                        entry.readable = !pending.is_empty();
                    }
                    None => entry.error = true,
                }
                if entry.signalled() {
                    ready += 1;
                }
            }
            if ready > 0 {
                return Ok(ready);
            }
            match deadline {
                None => state = self.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    let (next, _) = self
                        .cv
                        .wait_timeout(state, deadline.saturating_duration_since(now))
                        .unwrap();
                    state = next;
                }
            }
        }
    }

    fn listen_local(&self) -> io::Result<(Fd, u16)> {
        let mut state = self.state.lock().unwrap();
        let port = state.next_port;
        state.next_port += 1;
        let fd = state.new_fd(FdEntry::Listener {
            pending: VecDeque::new(),
            port,
        });
        Ok((fd, port))
    }

    fn accept(&self, listener: Fd) -> io::Result<Fd> {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.fds.get_mut(&listener) {
                Some(FdEntry::Listener { pending, .. }) => {
                    if let Some(fd) = pending.pop_front() {
                        return Ok(fd);
                    }
                }
                _ => return Err(io::Error::other("listener closed")),
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    fn recv(&self, socket: Fd, buf: &mut [u8]) -> io::Result<Recv> {
        let mut state = self.state.lock().unwrap();
        loop {
            match read_stream_of(&mut state, socket)? {
                StreamRead::Data(bytes) => {
                    let n = bytes.len().min(buf.len());
                    for (slot, byte) in buf.iter_mut().zip(bytes.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(Recv::Data(n));
                }
                StreamRead::Eof => return Ok(Recv::Closed),
                StreamRead::Empty => {}
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    fn send(&self, socket: Fd, buf: &[u8]) -> io::Result<usize> {
        self.write(socket, buf)
    }

    fn spawn_child(&self, path: &str, args: &[String]) -> io::Result<SpawnedChild> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next_spawn.take() {
            return Err(io::Error::other(message));
        }

        let stdin_stream = state.new_stream();
        let stdout_stream = state.new_stream();
        let stdin_fd = state.new_fd(FdEntry::Stream {
            read: None,
            write: Some(stdin_stream),
        });
        let stdout_fd = state.new_fd(FdEntry::Stream {
            read: Some(stdout_stream),
            write: None,
        });

        let child = state.next_child;
        state.next_child += 1;
        state.children.insert(
            child,
            FakeChild {
                path: path.to_string(),
                args: args.to_vec(),
                stdin_stream,
                stdout_stream,
                running: true,
                stubborn: false,
                terminations: 0,
                interrupts: 0,
            },
        );
        state.last_child = Some(child);
        self.cv.notify_all();
        Ok(SpawnedChild {
            child,
            stdin: stdin_fd,
            stdout: stdout_fd,
        })
    }

    fn wait_child(&self, child: ChildId, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match state.children.get(&child) {
                Some(record) if record.running => {}
                _ => return Ok(true),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let (next, _) = self
                .cv
                .wait_timeout(state, deadline.saturating_duration_since(now))
                .unwrap();
            state = next;
        }
    }

    fn terminate_child(&self, child: ChildId) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.children.get_mut(&child) {
            record.terminations += 1;
        }
        state.exit_child(child);
        self.cv.notify_all();
        Ok(())
    }

    fn interrupt_child(&self, child: ChildId) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.children.get_mut(&child) {
            record.interrupts += 1;
        }
        self.cv.notify_all();
        Ok(())
    }

    fn release_child(&self, _child: ChildId) {
        // Records stay around so tests can inspect them after teardown.
    }
}
