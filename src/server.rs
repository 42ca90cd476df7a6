//! TCP front-end for the editor.
//!
//! Three threads share the work: accept picks up new connections, read
//! demultiplexes framed requests from every connected client, and write
//! drains a priority queue of responses. Two wake pipes let the blocking
//! waits be cancelled from outside: the accept thread's pipe only ever
//! hangs up (shutdown), the read thread's pipe additionally carries one ACK
//! byte per newly accepted client.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::error::BridgeError;
use crate::framing;
use crate::message::{Request, Response, Verb};
use crate::sys::{Fd, Recv, Sys, WaitFd};

pub type RequestCallback = Arc<dyn Fn(Request) + Send + Sync>;
pub type ServerFailureCallback = Arc<dyn Fn(&BridgeError) + Send + Sync>;
pub type InvalidateCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Written to the read thread's wake pipe for every accepted client.
const WAKE_ACK: u8 = 0x06;

struct ResponseQueue {
    heap: BinaryHeap<Response>,
    running: bool,
}

struct ClientTable {
    /// Every accepted socket that has not been invalidated.
    clients: Vec<Fd>,
    /// Accepted sockets the read thread has not picked up yet.
    new_clients: VecDeque<Fd>,
    /// instance id -> owning socket.
    routes: HashMap<u32, Fd>,
    next_instance_id: u32,
    accept_wake_write: Option<Fd>,
    read_wake_write: Option<Fd>,
}

struct ServerShared {
    sys: Arc<dyn Sys>,
    listen_fd: Fd,
    accept_wake_read: Fd,
    read_wake_read: Fd,
    queue: Mutex<ResponseQueue>,
    queue_cv: Condvar,
    clients: Mutex<ClientTable>,
    /// Serializes whole-frame socket writes between the write thread and
    /// `unmap`, so two responses can never interleave mid-frame.
    write_mutex: Mutex<()>,
    failed: AtomicBool,
    on_failure: Vec<ServerFailureCallback>,
    on_request: Vec<RequestCallback>,
    on_invalidate: Vec<InvalidateCallback>,
}

pub struct Server {
    shared: Arc<ServerShared>,
    accept_thread: Option<JoinHandle<()>>,
    read_thread: Option<JoinHandle<()>>,
    write_thread: Option<JoinHandle<()>>,
    port: u16,
}

impl Server {
    pub fn new(
        sys: Arc<dyn Sys>,
        on_failure: Vec<ServerFailureCallback>,
        on_request: Vec<RequestCallback>,
        on_invalidate: Vec<InvalidateCallback>,
    ) -> Result<Server, BridgeError> {
        let (listen_fd, port) = sys
            .listen_local()
            .map_err(|err| BridgeError::startup("unable to bind server socket", &err))?;

        let (accept_wake_read, accept_wake_write) = match sys.pipe() {
            Ok(pipe) => pipe,
            Err(err) => {
                sys.close(listen_fd);
                return Err(BridgeError::startup(
                    "unable to create accept wake pipe",
                    &err,
                ));
            }
        };
        let (read_wake_read, read_wake_write) = match sys.pipe() {
            Ok(pipe) => pipe,
            Err(err) => {
                sys.close(listen_fd);
                sys.close(accept_wake_read);
                sys.close(accept_wake_write);
                return Err(BridgeError::startup("unable to create read wake pipe", &err));
            }
        };

        // The editor extracts the port from this exact wording.
        info!("started listening on port {port}");

        let shared = Arc::new(ServerShared {
            sys,
            listen_fd,
            accept_wake_read,
            read_wake_read,
            queue: Mutex::new(ResponseQueue {
                heap: BinaryHeap::new(),
                running: true,
            }),
            queue_cv: Condvar::new(),
            clients: Mutex::new(ClientTable {
                clients: Vec::new(),
                new_clients: VecDeque::new(),
                routes: HashMap::new(),
                next_instance_id: 0,
                accept_wake_write: Some(accept_wake_write),
                read_wake_write: Some(read_wake_write),
            }),
            write_mutex: Mutex::new(()),
            failed: AtomicBool::new(false),
            on_failure,
            on_request,
            on_invalidate,
        });

        let accept_thread = thread::spawn({
            let shared = shared.clone();
            move || accept_loop(shared)
        });
        let read_thread = thread::spawn({
            let shared = shared.clone();
            move || read_loop(shared)
        });
        let write_thread = thread::spawn({
            let shared = shared.clone();
            move || write_loop(shared)
        });

        Ok(Server {
            shared,
            accept_thread: Some(accept_thread),
            read_thread: Some(read_thread),
            write_thread: Some(write_thread),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queue a response for delivery. The write thread resolves the
    /// destination socket when it dequeues.
    pub fn enqueue(&self, response: Response) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.heap.push(response);
        }
        self.shared.queue_cv.notify_one();
    }

    /// Remove one routing entry, first writing `response` to the mapped
    /// socket on a best-effort basis so the client gets a final
    /// acknowledgment.
    pub fn unmap(&self, instance_id: u32, response: &Response) {
        let mut table = self.shared.clients.lock().unwrap();
        if let Some(&socket) = table.routes.get(&instance_id)
            && let Err(err) = write_response(&self.shared, socket, response)
        {
            // Already tearing the worker down, so delivery failures only
            // get logged.
            debug!("error writing final message to instance {instance_id}: {err}");
        }
        table.routes.remove(&instance_id);
        debug!("unmapped instance {instance_id}");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.running = false;
        }
        self.shared.queue_cv.notify_all();
        close_wake_pipes(&self.shared);

        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.read_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.write_thread.take() {
            let _ = thread.join();
        }

        let sys = &self.shared.sys;
        sys.close(self.shared.listen_fd);
        sys.close(self.shared.accept_wake_read);
        sys.close(self.shared.read_wake_read);
        let remaining: Vec<Fd> = self.shared.clients.lock().unwrap().clients.drain(..).collect();
        for socket in remaining {
            sys.close(socket);
        }
    }
}

fn close_wake_pipes(shared: &ServerShared) {
    let (accept_wake, read_wake) = {
        let mut table = shared.clients.lock().unwrap();
        (
            table.accept_wake_write.take(),
            table.read_wake_write.take(),
        )
    };
    if let Some(fd) = accept_wake {
        shared.sys.close(fd);
    }
    if let Some(fd) = read_wake {
        shared.sys.close(fd);
    }
}

/// A failure in the accept loop or the wake plumbing is fatal for the whole
/// server: stop every thread and tell the subscribers.
fn fail(shared: &ServerShared, error: BridgeError) {
    if shared.failed.swap(true, Ordering::SeqCst) {
        return;
    }
    error!("server aborting: {error}");
    {
        let mut queue = shared.queue.lock().unwrap();
        queue.running = false;
    }
    shared.queue_cv.notify_all();
    close_wake_pipes(shared);
    for callback in &shared.on_failure {
        callback(&error);
    }
}

/// Remove a client socket, unmap every instance routed to it, notify the
/// invalidate subscribers, and close the socket.
fn invalidate(shared: &ServerShared, client: Fd) {
    debug!("invalidating socket {client}");

    let removed: Vec<u32> = {
        let mut table = shared.clients.lock().unwrap();
        table.clients.retain(|socket| *socket != client);
        table.new_clients.retain(|socket| *socket != client);
        let ids: Vec<u32> = table
            .routes
            .iter()
            .filter(|(_, socket)| **socket == client)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            table.routes.remove(id);
            debug!("unmapped instance {id} from socket {client}");
        }
        ids
    };

    for id in removed {
        for callback in &shared.on_invalidate {
            callback(id);
        }
        debug!("invalidated instance {id}");
    }

    shared.sys.close(client);
}

enum ReadOutcome {
    Request(Request),
    Closed,
    Skipped,
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the peer closed.
fn recv_exact(shared: &ServerShared, socket: Fd, buf: &mut [u8]) -> Result<bool, BridgeError> {
    let mut filled = 0;
    while filled < buf.len() {
        match shared.sys.recv(socket, &mut buf[filled..]) {
            Ok(Recv::Closed) => return Ok(false),
            Ok(Recv::Data(count)) => filled += count,
            Err(err) => {
                return Err(BridgeError::transport(
                    format!("unable to read from socket {socket}"),
                    &err,
                ));
            }
        }
    }
    Ok(true)
}

/// Read one framed request. A JSON parse error is logged and skipped
/// without closing the socket.
fn read_request(shared: &ServerShared, socket: Fd) -> Result<ReadOutcome, BridgeError> {
    let mut prefix = [0u8; framing::LENGTH_PREFIX];
    if !recv_exact(shared, socket, &mut prefix)? {
        return Ok(ReadOutcome::Closed);
    }
    let length = framing::payload_length(prefix);

    trace!("reading {length} bytes from socket {socket}");
    let mut payload = vec![0u8; length];
    if !recv_exact(shared, socket, &mut payload)? {
        return Ok(ReadOutcome::Closed);
    }

    match serde_json::from_slice::<Request>(&payload) {
        Ok(request) => Ok(ReadOutcome::Request(request)),
        Err(err) => {
            warn!("json parse error on socket {socket}: {err}");
            Ok(ReadOutcome::Skipped)
        }
    }
}

fn write_response(
    shared: &ServerShared,
    socket: Fd,
    response: &Response,
) -> Result<(), BridgeError> {
    let payload = serde_json::to_vec(response)
        .map_err(|err| BridgeError::Protocol(format!("unable to serialize response: {err}")))?;
    let framed = framing::encode(&payload);

    let _guard = shared.write_mutex.lock().unwrap();
    let mut written = 0;
    while written < framed.len() {
        written += shared
            .sys
            .send(socket, &framed[written..])
            .map_err(|err| {
                BridgeError::transport(format!("unable to write to socket {socket}"), &err)
            })?;
    }
    trace!("wrote {} bytes to socket {socket}", framed.len());
    Ok(())
}

fn accept_loop(shared: Arc<ServerShared>) {
    debug!("started accept loop");

    loop {
        let mut waits = [
            WaitFd::new(shared.accept_wake_read),
            WaitFd::new(shared.listen_fd),
        ];
        match shared.sys.wait_readable(&mut waits, None) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                fail(
                    &shared,
                    BridgeError::transport("unable to wait on wake/listen descriptors", &err),
                );
                break;
            }
        }

        if waits[0].signalled() {
            debug!("received interrupt on accept loop");
            break;
        }

        if waits[1].readable {
            let client = match shared.sys.accept(shared.listen_fd) {
                Ok(client) => client,
                Err(err) => {
                    fail(
                        &shared,
                        BridgeError::transport("unable to accept a new client", &err),
                    );
                    break;
                }
            };

            debug!("accepted new client on socket {client}");
            let mut table = shared.clients.lock().unwrap();
            table.clients.push(client);
            table.new_clients.push_back(client);
            let Some(wake) = table.read_wake_write else {
                break;
            };
            // One ACK byte per client tells the read thread to refresh.
            if let Err(err) = shared.sys.write(wake, &[WAKE_ACK]) {
                drop(table);
                fail(
                    &shared,
                    BridgeError::transport("unable to write to wake pipe", &err),
                );
                break;
            }
        }
    }

    debug!("stopped accept loop");
}

fn read_loop(shared: Arc<ServerShared>) {
    debug!("started read loop");

    let mut client_fds: Vec<Fd> = Vec::new();

    'outer: loop {
        let mut waits = Vec::with_capacity(1 + client_fds.len());
        waits.push(WaitFd::new(shared.read_wake_read));
        waits.extend(client_fds.iter().map(|fd| WaitFd::new(*fd)));

        match shared.sys.wait_readable(&mut waits, None) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                fail(
                    &shared,
                    BridgeError::transport("unable to wait on wake/client descriptors", &err),
                );
                break;
            }
        }

        if waits[0].readable {
            let mut ack = [0u8; 1];
            match shared.sys.read(shared.read_wake_read, &mut ack) {
                Ok(1) => {
                    if ack[0] != WAKE_ACK {
                        warn!("read unexpected byte {:#04x} from wake pipe", ack[0]);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    fail(
                        &shared,
                        BridgeError::transport("unable to read from wake pipe", &err),
                    );
                    break;
                }
            }

            let recent = shared.clients.lock().unwrap().new_clients.pop_front();
            if let Some(client) = recent {
                debug!("received refresh for new socket {client}");
                client_fds.push(client);
            }
            continue;
        }
        if waits[0].hangup || waits[0].error {
            debug!("received interrupt on read loop");
            break;
        }

        let mut invalid: Vec<Fd> = Vec::new();
        for slot in &waits[1..] {
            if slot.readable {
                match read_request(&shared, slot.fd) {
                    Ok(ReadOutcome::Request(mut request)) => {
                        if request.verb == Verb::Create {
                            let mut table = shared.clients.lock().unwrap();
                            request.instance_id = table.next_instance_id;
                            table.next_instance_id += 1;
                            table.routes.insert(request.instance_id, slot.fd);
                            debug!(
                                "mapped instance {} to socket {}",
                                request.instance_id, slot.fd
                            );
                        }
                        for callback in &shared.on_request {
                            callback(request.clone());
                        }
                    }
                    Ok(ReadOutcome::Closed) => {
                        debug!("received shutdown on socket {} while reading", slot.fd);
                        invalid.push(slot.fd);
                    }
                    Ok(ReadOutcome::Skipped) => {}
                    Err(err) => {
                        // Fatal for the client, not for the server.
                        error!("{err}");
                        invalid.push(slot.fd);
                    }
                }
            } else if slot.hangup || slot.error {
                debug!(
                    "received {} shutdown on socket {}",
                    if slot.hangup { "soft" } else { "hard" },
                    slot.fd
                );
                invalid.push(slot.fd);
            }
            if shared.failed.load(Ordering::SeqCst) {
                break 'outer;
            }
        }

        for socket in invalid {
            invalidate(&shared, socket);
            client_fds.retain(|fd| *fd != socket);
        }
    }

    debug!("stopped read loop");
}

fn write_loop(shared: Arc<ServerShared>) {
    debug!("started write loop");

    'outer: loop {
        let response = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if !queue.running {
                    debug!("received interrupt on write loop");
                    break 'outer;
                }
                if let Some(response) = queue.heap.pop() {
                    break response;
                }
                queue = shared.queue_cv.wait(queue).unwrap();
            }
        };

        let socket = {
            let table = shared.clients.lock().unwrap();
            table.routes.get(&response.instance_id).copied()
        };
        let Some(socket) = socket else {
            // The mapping can vanish between enqueue and dequeue; the
            // response has nowhere to go.
            debug!(
                "dropping response for unmapped instance {}",
                response.instance_id
            );
            continue;
        };

        if let Err(err) = write_response(&shared, socket, &response) {
            error!("{err}");
            invalidate(&shared, socket);
        }
    }

    debug!("stopped write loop");
}
