//! Getting bytes to and from the server: name resolution, optional HTTP
//! CONNECT tunnelling, the TCP/UDP link and the server-rotation policy.

pub mod connection;
pub mod proxy;
pub mod resolver;
