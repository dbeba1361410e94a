//! Wire-level building blocks: constants, the envelope, stream reassembly
//! and the payload cipher.

pub mod codec;
pub mod consts;
pub mod crypt;
pub mod packet;
