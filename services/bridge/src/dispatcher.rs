//! Outbound request bookkeeping: sequence numbers and response correlation.
//!
//! Every request gets a monotonic `seq`; the domain tag travels with it so
//! the matching response can be routed without re-parsing the command name.
//! Requests that never get a response are retired by the periodic timeout
//! sweep.

use nb_protocol::{Command, CommandTag, WireRequest};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Pending {
    tag: CommandTag,
    name: &'static str,
    issued_at: Instant,
}

/// A request retired by the timeout sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOut {
    pub seq: u32,
    pub tag: CommandTag,
    pub name: &'static str,
}

#[derive(Debug, Default)]
pub struct RequestDispatcher {
    next_seq: u32,
    pending: HashMap<u32, Pending>,
}

impl RequestDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a translated command into a wire request, assigning the next
    /// sequence number and recording the in-flight tag.
    pub fn make_request(&mut self, cmd: Command) -> WireRequest {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.pending.insert(
            seq,
            Pending {
                tag: cmd.tag,
                name: cmd.name,
                issued_at: Instant::now(),
            },
        );
        WireRequest {
            seq,
            command: cmd.name.to_owned(),
            arguments: cmd.arguments,
        }
    }

    /// Correlate a response. Returns `None` for unknown sequence numbers
    /// (stale responses to requests already retired by the sweep).
    pub fn complete(&mut self, request_seq: u32) -> Option<CommandTag> {
        self.pending.remove(&request_seq).map(|p| p.tag)
    }

    /// Drop a request that was never written to the socket.
    pub fn forget(&mut self, seq: u32) {
        self.pending.remove(&seq);
    }

    /// Retire every request older than `timeout`.
    pub fn sweep(&mut self, timeout: Duration) -> Vec<TimedOut> {
        let now = Instant::now();
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.issued_at) >= timeout)
            .map(|(seq, _)| *seq)
            .collect();
        let mut out: Vec<TimedOut> = expired
            .into_iter()
            .filter_map(|seq| {
                self.pending.remove(&seq).map(|p| TimedOut {
                    seq,
                    tag: p.tag,
                    name: p.name,
                })
            })
            .collect();
        out.sort_by_key(|t| t.seq);
        out
    }

    /// Abandon all in-flight requests (session teardown). The sequence
    /// counter is not reset: seqs stay unique for the process lifetime.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }
}
