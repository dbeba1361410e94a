//! Post-login packet routing.
//!
//! Once the handshake completes every decrypted envelope lands here. Replies
//! to our own transactions are routed by the update class the transaction was
//! registered with; server-initiated packets are deduplicated, acknowledged
//! where the protocol demands it and surfaced to the embedding application
//! as [`Event`]s with their payloads left opaque.
//!
//! The dispatcher also owns the bootstrap chain: the fixed sequence of
//! follow-up requests (own info, online status, friends list, room list,
//! levels, friends online) fired right after login, each step issued when
//! the previous one answers.

use bytes::{Buf, Bytes};
use tracing::{debug, warn};

use crate::core::consts::cmd_desc;
use crate::protocol::command::{BootstrapStep, Command, UpdateClass};
use crate::session::Session;

/// End marker in a paged friends-list reply.
const FRIEND_LIST_END: u16 = 0xFFFF;
/// End marker in a paged friends-online reply.
const FRIEND_ONLINE_END: u8 = 0xFF;

/// Something the service loop must put on the wire for the dispatcher.
#[derive(Debug, PartialEq, Eq)]
pub struct SendRequest {
    pub command: Command,
    pub payload: Vec<u8>,
    pub class: UpdateClass,
    pub important: bool,
}

/// What the embedding application sees. Payloads are raw decrypted bodies;
/// this crate routes and correlates but does not parse feature formats.
#[derive(Debug, PartialEq, Eq)]
pub enum Event {
    /// An instant message arrived (already acknowledged on the wire).
    InstantMessage { seq: u16, payload: Bytes },
    /// A system notice arrived.
    SystemMessage { payload: Bytes },
    /// A contact changed status.
    FriendStatusChanged { payload: Bytes },
    /// Own account details, from the bootstrap chain.
    OwnInfo { payload: Bytes },
    /// One page of the friends list.
    FriendsListPage { payload: Bytes },
    /// The room list.
    RoomList { payload: Bytes },
    /// Contact level data.
    Levels { payload: Bytes },
    /// One page of currently-online friends.
    FriendsOnlinePage { payload: Bytes },
    /// A reply scoped to one room; `room` is the id the request carried.
    RoomReply { room: u32, payload: Bytes },
    /// A reply the dispatcher has no routing for.
    Unhandled { cmd: u16, payload: Bytes },
    /// The whole post-login chain has answered.
    BootstrapComplete,
}

/// One routing decision.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Send(SendRequest),
    Emit(Event),
}

#[derive(Default)]
pub struct Dispatcher;

impl Dispatcher {
    pub fn new() -> Self {
        Self
    }

    /// Kick off the bootstrap chain; called right after login succeeds.
    pub fn start_bootstrap(&self, session: &Session) -> SendRequest {
        bootstrap_request(session, BootstrapStep::OwnInfo)
    }

    /// Route the reply to one of our own transactions.
    pub fn on_reply(
        &self,
        session: &Session,
        class: UpdateClass,
        ship: u32,
        command: Command,
        payload: Bytes,
    ) -> Vec<Action> {
        match class {
            UpdateClass::Bootstrap(step) => self.on_bootstrap_reply(session, step, payload),
            UpdateClass::Room => vec![Action::Emit(Event::RoomReply {
                room: ship,
                payload,
            })],
            UpdateClass::None => match command {
                Command::KeepAlive => {
                    debug!("keep-alive acknowledged");
                    Vec::new()
                }
                other => vec![Action::Emit(Event::Unhandled {
                    cmd: other.id(),
                    payload,
                })],
            },
        }
    }

    fn on_bootstrap_reply(
        &self,
        session: &Session,
        step: BootstrapStep,
        payload: Bytes,
    ) -> Vec<Action> {
        let mut actions = Vec::new();

        match step {
            BootstrapStep::OwnInfo => {
                actions.push(Action::Emit(Event::OwnInfo { payload }));
            }
            BootstrapStep::OnlineStatus => {
                debug!("online status set");
            }
            BootstrapStep::FriendsList => {
                // First two bytes are the next page position; the terminal
                // page carries the end marker.
                let next = page_position_u16(&payload);
                actions.push(Action::Emit(Event::FriendsListPage { payload }));
                if let Some(position) = next {
                    actions.push(Action::Send(SendRequest {
                        command: Command::GetFriendsList,
                        payload: friends_list_body(position),
                        class: UpdateClass::Bootstrap(step),
                        important: false,
                    }));
                    return actions;
                }
            }
            BootstrapStep::GroupList => {
                actions.push(Action::Emit(Event::RoomList { payload }));
            }
            BootstrapStep::Levels => {
                actions.push(Action::Emit(Event::Levels { payload }));
            }
            BootstrapStep::FriendsOnline => {
                let next = page_position_u8(&payload);
                actions.push(Action::Emit(Event::FriendsOnlinePage { payload }));
                if let Some(position) = next {
                    actions.push(Action::Send(SendRequest {
                        command: Command::GetFriendsOnline,
                        payload: friends_online_body(position),
                        class: UpdateClass::Bootstrap(step),
                        important: false,
                    }));
                    return actions;
                }
            }
        }

        match step.next() {
            Some(next) => actions.push(Action::Send(bootstrap_request(session, next))),
            None => actions.push(Action::Emit(Event::BootstrapComplete)),
        }
        actions
    }

    /// Route a server-initiated packet. A duplicate inside the sequence
    /// window produces no actions at all.
    pub fn on_server_packet(
        &self,
        session: &mut Session,
        command: Command,
        seq: u16,
        payload: Bytes,
    ) -> Vec<Action> {
        if session.is_dup(seq) {
            debug!(cmd = command.id(), seq, "duplicate server packet in window");
            return Vec::new();
        }

        match command {
            Command::RecvIm => {
                vec![
                    Action::Send(im_ack(&payload)),
                    Action::Emit(Event::InstantMessage { seq, payload }),
                ]
            }
            Command::RecvMsgSys => vec![Action::Emit(Event::SystemMessage { payload })],
            Command::FriendChangeStatus => {
                vec![Action::Emit(Event::FriendStatusChanged { payload })]
            }
            other => {
                warn!(
                    cmd = other.id(),
                    desc = cmd_desc(other.id()),
                    seq,
                    "unexpected server-initiated command"
                );
                vec![Action::Emit(Event::Unhandled {
                    cmd: other.id(),
                    payload,
                })]
            }
        }
    }
}

/// An instant message is acknowledged by echoing its header back; the
/// server resends the message until it sees this.
fn im_ack(payload: &Bytes) -> SendRequest {
    let echo = payload.len().min(16);
    SendRequest {
        command: Command::RecvIm,
        payload: payload[..echo].to_vec(),
        class: UpdateClass::None,
        important: false,
    }
}

fn bootstrap_request(session: &Session, step: BootstrapStep) -> SendRequest {
    let payload = match step {
        // Own info is requested by decimal id string.
        BootstrapStep::OwnInfo => session.uid.to_string().into_bytes(),
        BootstrapStep::OnlineStatus => vec![session.login_mode],
        BootstrapStep::FriendsList => friends_list_body(0),
        BootstrapStep::GroupList => {
            let mut body = vec![0x01, 0x02];
            body.extend_from_slice(&0u32.to_be_bytes());
            body
        }
        BootstrapStep::Levels => {
            let mut body = vec![0x00];
            body.extend_from_slice(&session.uid.to_be_bytes());
            body
        }
        BootstrapStep::FriendsOnline => friends_online_body(0),
    };
    SendRequest {
        command: step.command(),
        payload,
        class: UpdateClass::Bootstrap(step),
        important: false,
    }
}

fn friends_list_body(position: u16) -> Vec<u8> {
    let mut body = position.to_be_bytes().to_vec();
    body.push(0x00);
    body
}

fn friends_online_body(position: u8) -> Vec<u8> {
    vec![0x02, position]
}

fn page_position_u16(payload: &Bytes) -> Option<u16> {
    if payload.len() < 2 {
        return None;
    }
    let next = (&payload[..]).get_u16();
    (next != FRIEND_LIST_END).then_some(next)
}

fn page_position_u8(payload: &Bytes) -> Option<u8> {
    let next = *payload.first()?;
    (next != FRIEND_ONLINE_END).then_some(next)
}
