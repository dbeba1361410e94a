//! Request/reply correlation: the transaction table.
//!
//! Every outgoing command is registered here keyed by (command id, sequence
//! number); every incoming envelope is matched against the table. The table
//! owns the retry, timeout and duplicate-suppression policy:
//!
//! - a client-initiated transaction keeps a copy of its wire bytes and a
//!   retry budget; the periodic scan resends it until the budget runs out,
//!   at which point an *important* transaction (token, login, keep-alive)
//!   takes the connection down and anything else is silently dropped;
//! - a server-initiated command is stored with a zero budget purely so that
//!   server retransmissions can be recognized and discarded and, for
//!   important ones, answered again with the previously cached reply;
//! - before login completes, server-initiated commands are queued here and
//!   replayed to the dispatcher in arrival order once login succeeds.
//!
//! At most one live transaction exists per (cmd, seq) pair.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::core::consts::cmd_desc;
use crate::protocol::command::UpdateClass;

/// Scans a transaction must survive before its retry budget is touched,
/// to avoid false timeouts on transient delay.
const SCAN_GRACE: u8 = 2;

/// Default retry budget for client-initiated transactions.
pub const DEFAULT_RETRIES: u8 = 3;

#[derive(Debug)]
struct Transaction {
    server_initiated: bool,
    important: bool,
    /// Wire bytes: the original envelope for resend (client-initiated) or
    /// our cached reply for re-acknowledgement (server-initiated).
    wire: Vec<u8>,
    retries_left: u8,
    rcv_count: u32,
    scan_count: u8,
    class: UpdateClass,
    ship: u32,
}

/// Outcome of matching one incoming envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// First time this (cmd, seq) was seen; proceed to dispatch.
    FirstReply { class: UpdateClass, ship: u32 },
    /// Protocol retransmission; discard without re-dispatching. For an
    /// important server-initiated repeat this carries our cached reply to
    /// send again.
    Duplicate { replay_ack: Option<Vec<u8>> },
    /// No transaction known for this pair.
    Unmatched,
}

/// One action produced by a timer scan.
#[derive(Debug, PartialEq, Eq)]
pub enum ScanAction {
    /// Put these bytes back on the wire.
    Resend(Vec<u8>),
    /// Retry budget exhausted; `important` means the link is lost.
    Expired { cmd: u16, seq: u16, important: bool },
}

#[derive(Default)]
pub struct TransactionTracker {
    live: HashMap<(u16, u16), Transaction>,
    /// Registration order of the live keys; the scan walks this so resends
    /// within one tick go out in the order the transactions were sent.
    order: Vec<(u16, u16)>,
    /// Server packets that arrived before login completed, in arrival order.
    pending_server: VecDeque<(u16, u16, Bytes)>,
    default_retries: u8,
}

impl TransactionTracker {
    pub fn new(default_retries: u8) -> Self {
        Self {
            live: HashMap::new(),
            order: Vec::new(),
            pending_server: VecDeque::new(),
            default_retries,
        }
    }

    /// Store a new client-initiated transaction.
    pub fn register(
        &mut self,
        cmd: u16,
        seq: u16,
        wire: Vec<u8>,
        important: bool,
        class: UpdateClass,
        ship: u32,
    ) {
        let prev = self.live.insert(
            (cmd, seq),
            Transaction {
                server_initiated: false,
                important,
                wire,
                retries_left: self.default_retries,
                rcv_count: 0,
                scan_count: 0,
                class,
                ship,
            },
        );
        if prev.is_some() {
            warn!(cmd, seq, "sequence reused while transaction outstanding");
        } else {
            self.order.push((cmd, seq));
        }
    }

    /// Store a server-initiated command for dedup; `reply` is the wire bytes
    /// of the acknowledgement we sent, kept so an important repeat can be
    /// re-acknowledged without touching the feature handlers.
    pub fn observe_server(&mut self, cmd: u16, seq: u16, important: bool, reply: Vec<u8>) {
        let prev = self.live.insert(
            (cmd, seq),
            Transaction {
                server_initiated: true,
                important,
                wire: reply,
                retries_left: 0,
                rcv_count: 1,
                scan_count: 0,
                class: UpdateClass::None,
                ship: 0,
            },
        );
        if prev.is_none() {
            self.order.push((cmd, seq));
        }
    }

    /// Match one incoming envelope after decryption.
    pub fn match_reply(&mut self, cmd: u16, seq: u16) -> MatchOutcome {
        let Some(trans) = self.live.get_mut(&(cmd, seq)) else {
            return MatchOutcome::Unmatched;
        };
        trans.rcv_count += 1;
        if !trans.server_initiated && trans.rcv_count == 1 {
            return MatchOutcome::FirstReply {
                class: trans.class,
                ship: trans.ship,
            };
        }
        debug!(cmd, seq, desc = cmd_desc(cmd), "duplicate packet, discarding");
        let replay_ack = if trans.server_initiated && trans.important && !trans.wire.is_empty() {
            Some(trans.wire.clone())
        } else {
            None
        };
        MatchOutcome::Duplicate { replay_ack }
    }

    /// Periodic scan. Received transactions are dropped; unanswered ones are
    /// resent once their grace period is over, until the budget is gone.
    pub fn scan(&mut self) -> Vec<ScanAction> {
        let mut actions = Vec::new();
        let mut remove = Vec::new();

        for &(cmd, seq) in &self.order {
            let Some(trans) = self.live.get_mut(&(cmd, seq)) else {
                continue;
            };
            if trans.rcv_count > 0 {
                remove.push((cmd, seq));
                continue;
            }
            trans.scan_count = trans.scan_count.saturating_add(1);
            if trans.scan_count < SCAN_GRACE {
                continue;
            }
            if trans.retries_left > 0 {
                trans.retries_left -= 1;
                debug!(
                    cmd,
                    seq,
                    desc = cmd_desc(cmd),
                    retries_left = trans.retries_left,
                    "resending unanswered transaction"
                );
                actions.push(ScanAction::Resend(trans.wire.clone()));
            } else {
                if trans.important {
                    warn!(cmd, seq, desc = cmd_desc(cmd), "important packet lost");
                } else {
                    warn!(cmd, seq, desc = cmd_desc(cmd), "packet lost");
                }
                actions.push(ScanAction::Expired {
                    cmd,
                    seq,
                    important: trans.important,
                });
                remove.push((cmd, seq));
            }
        }

        for key in remove {
            self.live.remove(&key);
        }
        self.order.retain(|key| self.live.contains_key(key));
        actions
    }

    /// Queue a server-initiated packet that arrived before login completed.
    pub fn push_pending(&mut self, cmd: u16, seq: u16, payload: Bytes) {
        self.pending_server.push_back((cmd, seq, payload));
    }

    /// Drain the pre-login queue in arrival order.
    pub fn drain_pending(&mut self) -> Vec<(u16, u16, Bytes)> {
        self.pending_server.drain(..).collect()
    }

    /// Drop every transaction and queued packet; used on teardown. No
    /// callback ever fires for a transaction after this.
    pub fn clear(&mut self) {
        self.live.clear();
        self.order.clear();
        self.pending_server.clear();
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}
