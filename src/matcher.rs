//! The pending-reply matcher: a single task that owns every outstanding
//! request and correlates it against inbound datagrams as they arrive.
//!
//! Pendings are represented as a tagged [`Expectation`] rather than a stored
//! closure — matching is a plain enum match, not a callback invocation, so
//! there is nothing here that needs boxing or dynamic dispatch. A single
//! reply is dispatched against every pending from the same peer, not just
//! the first one with a non-`NotMine` verdict: two pendings for the same
//! peer both waiting on, say, a `Neighbors` reply both resolve off one
//! inbound packet. A verdict is three-valued rather than a boolean, since a
//! reply can belong to a pending and still be wrong (`PacketMismatch`)
//! instead of simply not belonging to it at all.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::error::MatcherError;
use crate::socket::Inbound;
use crate::types::{NodeId, Packet};

pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
const CLOCK_WARP_FACTOR: u32 = 2;
const IDLE_SLEEP: Duration = Duration::from_secs(3600);

/// `expected_id`/`injected_fake` are the two domain-specific checks layered
/// on top of plain shape matching: a `ping` probe run with `validate=true`
/// rejects a pong recovered from the wrong key, and `bonded_findnode`
/// rejects a `neighbors` reply that echoes back the fake entry it injected.
#[derive(Debug, Clone, Copy)]
pub enum Expectation {
    Pong {
        ping_hash: [u8; 32],
        expected_id: Option<NodeId>,
    },
    Neighbors {
        injected_fake: Option<NodeId>,
    },
}

enum Dispatch {
    NotMine,
    Matched,
    Mismatched,
    /// Belongs to this pending, but fails a domain check beyond plain shape
    /// matching — carries the specific error to deliver.
    Rejected(MatcherError),
}

impl Expectation {
    fn check(&self, inbound: &Inbound) -> Dispatch {
        match (self, &inbound.packet) {
            (Expectation::Pong { ping_hash, expected_id }, Packet::Pong(pong)) => {
                if &pong.ping_hash != ping_hash {
                    return Dispatch::Mismatched;
                }
                if crate::crypto::is_expired(pong.expiration) {
                    return Dispatch::Rejected(MatcherError::Expired);
                }
                if let Some(expected) = expected_id {
                    let recovered = NodeId(crate::crypto::keccak256(&inbound.sender));
                    if &recovered != expected {
                        return Dispatch::Rejected(MatcherError::UnknownNode);
                    }
                    debug!("recovery callback: recovered sender id {recovered} matches expected target");
                }
                Dispatch::Matched
            }
            (Expectation::Pong { .. }, _) => Dispatch::NotMine,
            (Expectation::Neighbors { injected_fake }, Packet::Neighbors(neighbors)) => {
                if crate::crypto::is_expired(neighbors.expiration) {
                    return Dispatch::Rejected(MatcherError::Expired);
                }
                if let Some(fake) = injected_fake {
                    let poisoned = neighbors.nodes.iter().any(|n| &n.node_id() == fake);
                    if poisoned {
                        return Dispatch::Rejected(MatcherError::CorruptDht);
                    }
                }
                Dispatch::Matched
            }
            (Expectation::Neighbors { .. }, _) => Dispatch::NotMine,
        }
    }
}

struct Pending {
    from: SocketAddr,
    expectation: Expectation,
    deadline: Instant,
    reply: oneshot::Sender<Result<Packet, MatcherError>>,
}

enum Command {
    Add {
        from: SocketAddr,
        expectation: Expectation,
        timeout: Duration,
        reply: oneshot::Sender<Result<Packet, MatcherError>>,
    },
    ContinuousTimeouts(oneshot::Sender<u32>),
}

/// A cheaply-cloneable handle to the running matcher task.
#[derive(Clone)]
pub struct MatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl MatcherHandle {
    /// Registers interest in a reply from `from` matching `expectation`,
    /// and waits up to `timeout` for it. Returns `Err(ClockWarp)`
    /// immediately, without registering anything, if `timeout` is more than
    /// twice [`RESPONSE_TIMEOUT`] — a sane caller never needs a deadline
    /// that far out, so one this large signals a miscomputed wall-clock
    /// value rather than a real request.
    pub async fn wait_for(
        &self,
        from: SocketAddr,
        expectation: Expectation,
        timeout: Duration,
    ) -> Result<Packet, MatcherError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Add {
                from,
                expectation,
                timeout,
                reply,
            })
            .map_err(|_| MatcherError::Closed)?;
        rx.await.map_err(|_| MatcherError::Closed)?
    }

    /// Number of replies timed out in a row with no success in between —
    /// exposed for scenarios that assert on repeated non-responsiveness.
    pub async fn continuous_timeouts(&self) -> Result<u32, MatcherError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ContinuousTimeouts(reply))
            .map_err(|_| MatcherError::Closed)?;
        rx.await.map_err(|_| MatcherError::Closed)
    }
}

struct Matcher {
    pendings: VecDeque<Pending>,
    continuous_timeouts: u32,
}

impl Matcher {
    fn next_deadline(&self) -> Option<Instant> {
        self.pendings.iter().map(|p| p.deadline).min()
    }

    fn handle_add(
        &mut self,
        from: SocketAddr,
        expectation: Expectation,
        timeout: Duration,
        reply: oneshot::Sender<Result<Packet, MatcherError>>,
    ) {
        if timeout > RESPONSE_TIMEOUT * CLOCK_WARP_FACTOR {
            warn!("refusing to schedule a {timeout:?} deadline, clock warp suspected");
            let _ = reply.send(Err(MatcherError::ClockWarp));
            return;
        }
        let deadline = Instant::now() + timeout;
        self.pendings.push_back(Pending {
            from,
            expectation,
            deadline,
            reply,
        });
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let mut remaining = VecDeque::with_capacity(self.pendings.len());
        let mut delivered = false;

        for pending in self.pendings.drain(..) {
            if pending.from != inbound.from {
                remaining.push_back(pending);
                continue;
            }
            match pending.expectation.check(&inbound) {
                Dispatch::NotMine => remaining.push_back(pending),
                Dispatch::Matched => {
                    delivered = true;
                    trace!("matched reply from {}", inbound.from);
                    let _ = pending.reply.send(Ok(inbound.packet.clone()));
                }
                Dispatch::Mismatched => {
                    delivered = true;
                    debug!("reply from {} did not match the pending expectation", inbound.from);
                    let _ = pending.reply.send(Err(MatcherError::PacketMismatch));
                }
                Dispatch::Rejected(e) => {
                    delivered = true;
                    debug!("reply from {} rejected: {e}", inbound.from);
                    let _ = pending.reply.send(Err(e));
                }
            }
        }
        self.pendings = remaining;

        if delivered {
            self.continuous_timeouts = 0;
        } else {
            debug!("unsolicited reply from {}, no pending request", inbound.from);
        }
    }

    fn handle_timeout(&mut self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.pendings.len());
        for pending in self.pendings.drain(..) {
            if pending.deadline <= now {
                expired.push(pending);
            } else {
                remaining.push_back(pending);
            }
        }
        self.pendings = remaining;
        for pending in expired {
            self.continuous_timeouts += 1;
            let _ = pending.reply.send(Err(MatcherError::Timeout));
        }
    }
}

/// Spawns the matcher loop as its own task and returns a handle to it. The
/// task exits once every `MatcherHandle` clone and the `inbound` sender have
/// been dropped.
pub fn spawn(mut inbound: mpsc::UnboundedReceiver<Inbound>) -> MatcherHandle {
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    let handle = MatcherHandle {
        commands: commands_tx,
    };

    tokio::spawn(async move {
        let mut matcher = Matcher {
            pendings: VecDeque::new(),
            continuous_timeouts: 0,
        };
        let sleep = time::sleep(IDLE_SLEEP);
        tokio::pin!(sleep);

        loop {
            let next_deadline = matcher.next_deadline().unwrap_or_else(|| Instant::now() + IDLE_SLEEP);
            sleep.as_mut().reset(next_deadline);

            tokio::select! {
                cmd = commands_rx.recv() => match cmd {
                    Some(Command::Add { from, expectation, timeout, reply }) => {
                        matcher.handle_add(from, expectation, timeout, reply);
                    }
                    Some(Command::ContinuousTimeouts(reply)) => {
                        let _ = reply.send(matcher.continuous_timeouts);
                    }
                    None => return,
                },
                maybe_inbound = inbound.recv() => match maybe_inbound {
                    Some(packet) => matcher.handle_inbound(packet),
                    None => return,
                },
                () = &mut sleep => {
                    matcher.handle_timeout();
                }
            }
        }
    });

    handle
}
