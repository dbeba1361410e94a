//! The runnable client: a single task owning the link, the timers and all
//! protocol state, talking to the embedding application over channels.

pub mod client;
