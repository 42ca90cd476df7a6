use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// An action the client can ask the daemon to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    /// Spawn a new worker; the server assigns the instance id.
    Create,
    /// Tear down a worker and its child process.
    Destroy,
    /// Write the request content to the worker's child.
    Forward,
    /// Send an interrupt signal to the worker's child.
    Interrupt,
    /// Shut the daemon down.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// A request received from the editor front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub verb: Verb,
    pub instance_id: u32,
    pub content: String,
}

/// A response sent back to the editor front-end.
///
/// `id` and `priority` drive the ordering of the server's outbound queue and
/// never appear on the wire. A success status only means the request was
/// applied by the daemon; it says nothing about what the child process
/// thought of any forwarded content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    pub verb: Verb,
    pub instance_id: u32,
    pub content: String,
    #[serde(skip)]
    pub id: u64,
    #[serde(skip)]
    pub priority: i32,
}

// Responses order by (priority, id): a max-heap then yields higher priority
// first, and within one priority the lowest id, so enqueue order is preserved
// per band while emergency responses jump the line.
impl Ord for Response {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Response {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Response {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl Eq for Response {}
