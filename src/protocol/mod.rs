//! Protocol logic above the wire format: command ids, transaction
//! correlation, the login handshake and post-login routing. Everything in
//! here is sans-IO; the service layer owns the sockets and timers.

pub mod command;
pub mod dispatcher;
pub mod login;
pub mod transact;
