//! One child process, driven by a reader and a writer thread.
//!
//! The reader blocks on the child's stdout together with an interrupt pipe
//! so it can be woken from outside; the writer drains a queue of messages
//! destined for the child's stdin. Both funnel failures into a single
//! idempotent `fail`, which wakes everything and notifies the registered
//! failure callbacks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use memchr::memchr_iter;
use tracing::{debug, warn};

use crate::config::PRINT0_ARG;
use crate::error::BridgeError;
use crate::sys::{ChildId, Fd, Sys, WaitFd};

/// Invoked with `(instance_id, frame)` for every complete null-terminated
/// frame the child emits, on the worker's reader thread.
pub type FrameCallback = Arc<dyn Fn(u32, &[u8]) + Send + Sync>;

/// Invoked with `(instance_id, error)` when either worker thread fails.
pub type WorkerFailureCallback = Arc<dyn Fn(u32, &BridgeError) + Send + Sync>;

const READ_BUFFER_LEN: usize = 4096;

/// How long a child gets to exit after its stdin closes before it is
/// terminated.
pub const CHILD_EXIT_GRACE: Duration = Duration::from_millis(500);

struct MessageQueue {
    messages: VecDeque<Vec<u8>>,
    running: bool,
    /// Write end of the interrupt pipe; taken exactly once, either by `fail`
    /// (closed to wake the reader) or by teardown.
    interrupt_write: Option<Fd>,
}

struct WorkerShared {
    id: u32,
    sys: Arc<dyn Sys>,
    queue: Mutex<MessageQueue>,
    cv: Condvar,
    failed: AtomicBool,
    on_failure: Vec<WorkerFailureCallback>,
    on_frame: Vec<FrameCallback>,
    child: ChildId,
    stdin_fd: Fd,
    stdout_fd: Fd,
    interrupt_read: Fd,
}

impl WorkerShared {
    fn is_running(&self) -> bool {
        self.queue.lock().unwrap().running
    }

    fn fail(&self, error: BridgeError) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("worker {} aborting: {error}", self.id);
        let interrupt_write = {
            let mut queue = self.queue.lock().unwrap();
            queue.running = false;
            queue.interrupt_write.take()
        };
        self.cv.notify_all();
        // Closing the write end hangs up the reader's wait.
        if let Some(fd) = interrupt_write {
            self.sys.close(fd);
        }
        for callback in &self.on_failure {
            callback(self.id, &error);
        }
    }
}

/// Reassembles null-terminated frames out of arbitrarily chunked reads. An
/// incomplete trailing frame is carried to the next call.
pub(crate) struct FrameParser {
    remainder: Vec<u8>,
}

impl FrameParser {
    pub(crate) fn new() -> Self {
        FrameParser {
            remainder: Vec::new(),
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8], mut on_frame: impl FnMut(&[u8])) {
        self.remainder.extend_from_slice(bytes);
        let mut consumed = 0;
        for nul in memchr_iter(0, &self.remainder) {
            on_frame(&self.remainder[consumed..nul]);
            consumed = nul + 1;
        }
        if consumed > 0 {
            self.remainder.drain(..consumed);
        }
    }
}

pub struct Worker {
    shared: Arc<WorkerShared>,
    read_thread: Option<JoinHandle<()>>,
    write_thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("id", &self.shared.id).finish()
    }
}

impl Worker {
    /// Spawn the child (with `--print0` appended to its arguments) and start
    /// both worker threads. Any step that fails undoes the ones before it.
    pub fn new(
        id: u32,
        path: &str,
        args: &[String],
        sys: Arc<dyn Sys>,
        on_failure: Vec<WorkerFailureCallback>,
        on_frame: Vec<FrameCallback>,
    ) -> Result<Worker, BridgeError> {
        let (interrupt_read, interrupt_write) = sys
            .pipe()
            .map_err(|err| BridgeError::transport("unable to create interrupt pipe", &err))?;

        let mut child_args: Vec<String> = args.to_vec();
        child_args.push(PRINT0_ARG.to_string());

        let spawned = match sys.spawn_child(path, &child_args) {
            Ok(spawned) => spawned,
            Err(err) => {
                sys.close(interrupt_read);
                sys.close(interrupt_write);
                return Err(BridgeError::transport(
                    format!("unable to start child process {path}"),
                    &err,
                ));
            }
        };

        let shared = Arc::new(WorkerShared {
            id,
            sys,
            queue: Mutex::new(MessageQueue {
                messages: VecDeque::new(),
                running: true,
                interrupt_write: Some(interrupt_write),
            }),
            cv: Condvar::new(),
            failed: AtomicBool::new(false),
            on_failure,
            on_frame,
            child: spawned.child,
            stdin_fd: spawned.stdin,
            stdout_fd: spawned.stdout,
            interrupt_read,
        });

        let read_thread = thread::spawn({
            let shared = shared.clone();
            move || read_loop(shared)
        });
        let write_thread = thread::spawn({
            let shared = shared.clone();
            move || write_loop(shared)
        });

        Ok(Worker {
            shared,
            read_thread: Some(read_thread),
            write_thread: Some(write_thread),
        })
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Queue a message for the child's stdin.
    pub fn enqueue(&self, message: Vec<u8>) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.messages.push_back(message);
        }
        self.shared.cv.notify_one();
    }

    /// Deliver an interrupt signal to the child.
    pub fn interrupt(&self) -> Result<(), BridgeError> {
        self.shared
            .sys
            .interrupt_child(self.shared.child)
            .map_err(|err| BridgeError::transport("unable to interrupt child process", &err))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let sys = &self.shared.sys;

        // Stop both threads: clear the flag, poke the writer's condvar, and
        // wake the reader with a byte on the interrupt pipe.
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.running = false;
            if let Some(fd) = queue.interrupt_write {
                let _ = sys.write(fd, &[0x01]);
            }
        }
        self.shared.cv.notify_all();

        if let Some(thread) = self.read_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.write_thread.take() {
            let _ = thread.join();
        }

        // Closing stdin asks the child to exit on its own.
        sys.close(self.shared.stdin_fd);
        sys.close(self.shared.stdout_fd);

        match sys.wait_child(self.shared.child, CHILD_EXIT_GRACE) {
            Ok(true) => debug!("worker {} child exited gracefully", self.shared.id),
            Ok(false) => {
                warn!(
                    "worker {} child still running after stdin close, terminating",
                    self.shared.id
                );
                if let Err(err) = sys.terminate_child(self.shared.child) {
                    warn!("worker {} unable to terminate child: {err}", self.shared.id);
                }
                let _ = sys.wait_child(self.shared.child, CHILD_EXIT_GRACE);
            }
            Err(err) => warn!("worker {} unable to wait for child: {err}", self.shared.id),
        }
        sys.release_child(self.shared.child);

        let interrupt_write = self.shared.queue.lock().unwrap().interrupt_write.take();
        if let Some(fd) = interrupt_write {
            sys.close(fd);
        }
        sys.close(self.shared.interrupt_read);
    }
}

fn read_loop(shared: Arc<WorkerShared>) {
    debug!("worker {} started read loop", shared.id);

    let mut buffer = vec![0u8; READ_BUFFER_LEN];
    let mut parser = FrameParser::new();

    while shared.is_running() {
        let mut waits = [
            WaitFd::new(shared.interrupt_read),
            WaitFd::new(shared.stdout_fd),
        ];
        match shared.sys.wait_readable(&mut waits, None) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(err) => {
                shared.fail(BridgeError::transport(
                    "unable to wait on worker pipes",
                    &err,
                ));
                break;
            }
        }

        if waits[0].signalled() {
            debug!("worker {} received interrupt", shared.id);
            break;
        }

        if waits[1].readable {
            match shared.sys.read(shared.stdout_fd, &mut buffer) {
                Ok(0) => {
                    shared.fail(BridgeError::Transport {
                        what: "child process closed its stdout".to_string(),
                        code: 0,
                    });
                    break;
                }
                Ok(count) => {
                    parser.extend(&buffer[..count], |frame| {
                        for callback in &shared.on_frame {
                            callback(shared.id, frame);
                        }
                    });
                }
                Err(err) => {
                    shared.fail(BridgeError::transport("unable to read from child", &err));
                    break;
                }
            }
        } else if waits[1].hangup || waits[1].error {
            shared.fail(BridgeError::Transport {
                what: "child process closed its stdout".to_string(),
                code: 0,
            });
            break;
        }
    }

    debug!("worker {} stopped read loop", shared.id);
}

fn write_loop(shared: Arc<WorkerShared>) {
    debug!("worker {} started write loop", shared.id);

    'outer: loop {
        let message = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if !queue.running {
                    break 'outer;
                }
                if let Some(message) = queue.messages.pop_front() {
                    break message;
                }
                queue = shared.cv.wait(queue).unwrap();
            }
        };

        if let Err(err) = write_all(&shared, &message) {
            shared.fail(err);
            break;
        }
    }

    debug!("worker {} stopped write loop", shared.id);
}

fn write_all(shared: &WorkerShared, message: &[u8]) -> Result<(), BridgeError> {
    let mut written = 0;
    while written < message.len() {
        written += shared
            .sys
            .write(shared.stdin_fd, &message[written..])
            .map_err(|err| BridgeError::transport("unable to write to child", &err))?;
    }
    Ok(())
}
