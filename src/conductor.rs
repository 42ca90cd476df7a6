//! The coordination thread between the server and the workers.
//!
//! The conductor owns the worker table and the server. Server callbacks
//! push requests into `in_queue`; worker callbacks push responses into
//! `out_queue`; the run loop drains both, dispatching requests on its own
//! thread so child spawning never stalls the server's read thread. Workers
//! that die or lose their client are parked in a reap list and dropped on
//! the run thread, since dropping a worker joins its threads and must never
//! happen on one of them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::CreateOptions;
use crate::error::BridgeError;
use crate::message::{Request, Response, Status, Verb};
use crate::server::{InvalidateCallback, RequestCallback, Server, ServerFailureCallback};
use crate::sys::Sys;
use crate::worker::{FrameCallback, Worker, WorkerFailureCallback};

const RUN_LOOP_TICK: Duration = Duration::from_millis(500);

struct ConductorState {
    in_queue: VecDeque<Request>,
    out_queue: VecDeque<Response>,
    /// Destroy-failure notices for dead workers; delivered through
    /// `Server::unmap` so the routing entry goes away with the worker.
    failure_notices: VecDeque<(u32, Response)>,
    workers: HashMap<u32, Worker>,
    /// Workers awaiting teardown on the run thread.
    reap: Vec<Worker>,
    next_id: u64,
    signal_received: bool,
    server_failed: bool,
}

struct ConductorShared {
    sys: Arc<dyn Sys>,
    state: Mutex<ConductorState>,
    cv: Condvar,
}

impl ConductorShared {
    /// Build a response under the lock so ids stay monotonic, and queue it
    /// for the server.
    fn push_response(
        &self,
        verb: Verb,
        instance_id: u32,
        status: Status,
        content: String,
        priority: i32,
    ) {
        {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.out_queue.push_back(Response {
                status,
                verb,
                instance_id,
                content,
                id,
                priority,
            });
        }
        self.cv.notify_all();
    }

    /// A dead worker is pulled from the table and a synthetic destroy
    /// failure is sent to whoever owned it. Runs on the worker's own
    /// thread, so the worker is only parked here and dropped later by the
    /// run loop.
    fn handle_worker_failure(&self, instance_id: u32, error: &BridgeError) {
        let mut state = self.state.lock().unwrap();
        let Some(worker) = state.workers.remove(&instance_id) else {
            // Already destroyed or reaped; nothing to report.
            return;
        };
        state.reap.push(worker);
        let id = state.next_id;
        state.next_id += 1;
        state.failure_notices.push_back((
            instance_id,
            Response {
                status: Status::Failure,
                verb: Verb::Destroy,
                instance_id,
                content: error.to_string(),
                id,
                priority: 1,
            },
        ));
        drop(state);
        self.cv.notify_all();
    }

    fn handle_child_frame(&self, instance_id: u32, frame: &[u8]) {
        self.push_response(
            Verb::Forward,
            instance_id,
            Status::Success,
            String::from_utf8_lossy(frame).into_owned(),
            0,
        );
    }
}

pub struct Conductor {
    shared: Arc<ConductorShared>,
    server: Arc<Server>,
    run_thread: Option<JoinHandle<()>>,
}

impl Conductor {
    /// Start the server and the coordination thread. A failure here means
    /// the daemon cannot run at all.
    pub fn new(sys: Arc<dyn Sys>) -> Result<Conductor, BridgeError> {
        let shared = Arc::new(ConductorShared {
            sys: sys.clone(),
            state: Mutex::new(ConductorState {
                in_queue: VecDeque::new(),
                out_queue: VecDeque::new(),
                failure_notices: VecDeque::new(),
                workers: HashMap::new(),
                reap: Vec::new(),
                next_id: 0,
                signal_received: false,
                server_failed: false,
            }),
            cv: Condvar::new(),
        });

        let on_failure: ServerFailureCallback = {
            let shared = Arc::downgrade(&shared);
            Arc::new(move |_error: &BridgeError| {
                if let Some(shared) = shared.upgrade() {
                    shared.state.lock().unwrap().server_failed = true;
                    shared.cv.notify_all();
                }
            })
        };
        let on_request: RequestCallback = {
            let shared = Arc::downgrade(&shared);
            Arc::new(move |request: Request| {
                if let Some(shared) = shared.upgrade() {
                    shared.state.lock().unwrap().in_queue.push_back(request);
                    shared.cv.notify_all();
                }
            })
        };
        let on_invalidate: InvalidateCallback = {
            let shared = Arc::downgrade(&shared);
            Arc::new(move |instance_id: u32| {
                if let Some(shared) = shared.upgrade() {
                    {
                        let mut state = shared.state.lock().unwrap();
                        if let Some(worker) = state.workers.remove(&instance_id) {
                            state.reap.push(worker);
                            debug!("destroyed worker {instance_id}");
                        }
                    }
                    shared.cv.notify_all();
                }
            })
        };

        let server = Arc::new(Server::new(
            sys,
            vec![on_failure],
            vec![on_request],
            vec![on_invalidate],
        )?);

        let run_thread = thread::spawn({
            let shared = shared.clone();
            let server = server.clone();
            move || run(shared, server)
        });

        Ok(Conductor {
            shared,
            server,
            run_thread: Some(run_thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.server.port()
    }

    /// Ask the run loop to stop. Called from the main thread on SIGINT or
    /// SIGTERM.
    pub fn notify(&self) {
        self.shared.state.lock().unwrap().signal_received = true;
        self.shared.cv.notify_all();
    }

    pub fn has_failed(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        state.server_failed || state.signal_received
    }
}

impl Drop for Conductor {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.signal_received = true;
        }
        self.shared.cv.notify_all();
        if let Some(thread) = self.run_thread.take() {
            let _ = thread.join();
        }

        // Tear down every remaining worker; each drop waits for its child.
        let workers: Vec<Worker> = {
            let mut state = self.shared.state.lock().unwrap();
            let mut workers: Vec<Worker> = state.workers.drain().map(|(_, w)| w).collect();
            workers.append(&mut state.reap);
            workers
        };
        drop(workers);
        // Dropping the server (last Arc, the run thread's clone is gone)
        // joins its three threads.
    }
}

fn run(shared: Arc<ConductorShared>, server: Arc<Server>) {
    debug!("conductor started");

    loop {
        {
            let state = shared.state.lock().unwrap();
            let (state, _) = shared
                .cv
                .wait_timeout_while(state, RUN_LOOP_TICK, |s| {
                    s.in_queue.is_empty()
                        && s.out_queue.is_empty()
                        && s.failure_notices.is_empty()
                        && s.reap.is_empty()
                        && !s.server_failed
                        && !s.signal_received
                })
                .unwrap();
            if state.server_failed {
                debug!("server failed, stopping");
                break;
            }
            if state.signal_received {
                debug!("stop flag set, stopping");
                break;
            }
        }

        // Requests are applied one at a time with the lock dropped, so
        // spawning and joining workers never blocks the server callbacks.
        loop {
            let request = shared.state.lock().unwrap().in_queue.pop_front();
            let Some(request) = request else { break };
            handle_request(&shared, &server, request);
        }

        let dead: Vec<Worker> = {
            let mut state = shared.state.lock().unwrap();
            state.reap.drain(..).collect()
        };
        drop(dead);

        let pending: Vec<Response> = {
            let mut state = shared.state.lock().unwrap();
            state.out_queue.drain(..).collect()
        };
        for response in pending {
            server.enqueue(response);
        }

        let notices: Vec<(u32, Response)> = {
            let mut state = shared.state.lock().unwrap();
            state.failure_notices.drain(..).collect()
        };
        for (instance_id, response) in notices {
            server.unmap(instance_id, &response);
        }
    }

    debug!("conductor stopped");
}

fn handle_request(shared: &Arc<ConductorShared>, server: &Server, request: Request) {
    match request.verb {
        Verb::Create => handle_create(shared, request),
        Verb::Destroy => {
            let worker = {
                let mut state = shared.state.lock().unwrap();
                state.workers.remove(&request.instance_id)
            };
            // Joins the worker threads and waits for the child.
            drop(worker);
            debug!("destroyed worker {}", request.instance_id);

            let response = {
                let mut state = shared.state.lock().unwrap();
                let id = state.next_id;
                state.next_id += 1;
                Response {
                    status: Status::Success,
                    verb: Verb::Destroy,
                    instance_id: request.instance_id,
                    content: String::new(),
                    id,
                    priority: 1,
                }
            };
            server.unmap(request.instance_id, &response);
        }
        Verb::Forward => {
            let state = shared.state.lock().unwrap();
            if let Some(worker) = state.workers.get(&request.instance_id) {
                worker.enqueue(request.content.into_bytes());
            }
            // A forward to an unknown worker has no error response.
        }
        Verb::Interrupt => {
            let state = shared.state.lock().unwrap();
            if let Some(worker) = state.workers.get(&request.instance_id)
                && let Err(err) = worker.interrupt()
            {
                warn!("unable to interrupt worker {}: {err}", request.instance_id);
            }
        }
        Verb::Stop => {
            debug!("received stop request");
            shared.state.lock().unwrap().signal_received = true;
            shared.cv.notify_all();
        }
    }
}

fn handle_create(shared: &Arc<ConductorShared>, request: Request) {
    let options = match CreateOptions::parse(&request.content) {
        Ok(options) => options,
        Err(err) => {
            warn!("rejecting create request: {err}");
            shared.push_response(
                Verb::Create,
                request.instance_id,
                Status::Failure,
                err.to_string(),
                1,
            );
            return;
        }
    };

    info!("starting child at {}", options.path);

    let on_failure: WorkerFailureCallback = {
        let shared = Arc::downgrade(shared);
        Arc::new(move |instance_id: u32, error: &BridgeError| {
            if let Some(shared) = shared.upgrade() {
                shared.handle_worker_failure(instance_id, error);
            }
        })
    };
    let on_frame: FrameCallback = {
        let shared = Arc::downgrade(shared);
        Arc::new(move |instance_id: u32, frame: &[u8]| {
            if let Some(shared) = shared.upgrade() {
                shared.handle_child_frame(instance_id, frame);
            }
        })
    };

    match Worker::new(
        request.instance_id,
        &options.path,
        &options.args,
        shared.sys.clone(),
        vec![on_failure],
        vec![on_frame],
    ) {
        Ok(worker) => {
            {
                let mut state = shared.state.lock().unwrap();
                state.workers.insert(request.instance_id, worker);
            }
            debug!("created worker {}", request.instance_id);
            shared.push_response(
                Verb::Create,
                request.instance_id,
                Status::Success,
                String::new(),
                1,
            );
        }
        Err(err) => {
            error!("unable to create worker {}: {err}", request.instance_id);
            shared.push_response(
                Verb::Create,
                request.instance_id,
                Status::Failure,
                err.to_string(),
                1,
            );
        }
    }
}
