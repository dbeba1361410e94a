//! Per-login session state.
//!
//! One `Session` is created when a login starts and carries everything the
//! handshake and the post-login traffic need: the owner id, password hashes,
//! the per-login seed key, the derived session key material, the opaque
//! server-issued tokens, the outgoing sequence counter and the duplicate
//! window for server-initiated packets. There is deliberately no global
//! state anywhere in the crate; every component receives the session it
//! works on.
//!
//! Key material is zeroed when the session is torn down and again on drop.

use md5::{Digest, Md5};
use rand::Rng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::consts::KEY_LENGTH;

/// All secrets of a login, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct KeyMaterial {
    /// Single MD5 of the account password.
    pub pw_hash: [u8; KEY_LENGTH],
    /// Double MD5 of the account password; key for the login block core and
    /// the first decrypt attempt on login replies.
    pub pw_key: [u8; KEY_LENGTH],
    /// Random per-login seed key the login block is encrypted under.
    pub seed_key: [u8; KEY_LENGTH],
    /// Session key issued by the server in the login-OK reply.
    pub session_key: [u8; KEY_LENGTH],
    /// MD5 over (owner id ++ session key); some commands encrypt with this.
    pub session_md5: [u8; KEY_LENGTH],
    /// Opaque anti-automation token from the token request.
    pub token: Vec<u8>,
    /// Opaque continuation token from a captcha challenge.
    pub token_ex: Vec<u8>,
}

/// A pending captcha challenge surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captcha {
    /// Image bytes as delivered by the server (the engine never decodes them).
    pub image: Vec<u8>,
    /// Continuation token to send back with the user's code.
    pub token: Vec<u8>,
}

/// Login phase marker; the full transition logic lives in `protocol::login`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginPhase {
    #[default]
    Idle,
    Resolving,
    Connecting,
    ServerSelect,
    TokenRequested,
    CaptchaChallenge,
    PasswordChecked,
    LoginSent,
    Connected,
}

pub struct Session {
    /// Session-owner numeric id.
    pub uid: u32,
    pub keys: KeyMaterial,
    pub captcha: Option<Captcha>,
    pub phase: LoginPhase,
    pub logged_in: bool,
    /// Login mode byte placed into the login block (normal/invisible).
    pub login_mode: u8,
    send_seq: u16,
    /// One bit per possible sequence number, for dedup of server-initiated
    /// packets the server may retransmit.
    dup_window: Box<[u8]>,
}

/// Login mode byte: visible to contacts.
pub const LOGIN_MODE_NORMAL: u8 = 0x0A;
/// Login mode byte: invisible.
pub const LOGIN_MODE_HIDDEN: u8 = 0x28;

impl Session {
    /// Start a new session for `uid`, deriving the password hashes and
    /// seeding the outgoing sequence counter with a random 16-bit value.
    pub fn new(uid: u32, password: &str) -> Self {
        let pw_hash: [u8; KEY_LENGTH] = Md5::digest(password.as_bytes()).into();
        let pw_key: [u8; KEY_LENGTH] = Md5::digest(pw_hash).into();

        let mut rng = rand::rng();
        // Struct-update syntax cannot be used here: the zeroize-on-drop
        // impl makes KeyMaterial a Drop type, so fields must be assigned.
        let mut keys = KeyMaterial::default();
        keys.pw_hash = pw_hash;
        keys.pw_key = pw_key;
        rng.fill(&mut keys.seed_key[..]);

        Self {
            uid,
            keys,
            captcha: None,
            phase: LoginPhase::Idle,
            logged_in: false,
            login_mode: LOGIN_MODE_NORMAL,
            send_seq: rng.random::<u16>(),
            dup_window: vec![0u8; 8192].into_boxed_slice(),
        }
    }

    /// Next outgoing sequence number. Wraps at 16 bits; the tracker
    /// guarantees a number is not reused while its transaction is live.
    pub fn next_seq(&mut self) -> u16 {
        self.send_seq = self.send_seq.wrapping_add(1);
        self.send_seq
    }

    /// Test-and-set the duplicate window for a server-chosen sequence
    /// number. Returns true when the number was already seen.
    pub fn is_dup(&mut self, seq: u16) -> bool {
        let byte = &mut self.dup_window[(seq / 8) as usize];
        let mask = 1u8 << (seq % 8);
        if *byte & mask != 0 {
            return true;
        }
        *byte |= mask;
        false
    }

    /// Install the server-issued session key and derive its MD5 companion.
    pub fn adopt_session_key(&mut self, session_key: [u8; KEY_LENGTH]) {
        self.keys.session_key = session_key;
        let mut src = [0u8; 4 + KEY_LENGTH];
        src[..4].copy_from_slice(&self.uid.to_be_bytes());
        src[4..].copy_from_slice(&session_key);
        self.keys.session_md5 = Md5::digest(src).into();
        src.zeroize();
    }

    /// Pick a fresh random seed key for a (re)attempted login.
    pub fn refresh_seed_key(&mut self) {
        rand::rng().fill(&mut self.keys.seed_key[..]);
    }

    /// Teardown for redirect/disconnect: zero all key material, drop tokens
    /// and the captcha, clear the duplicate window. Keeps the password
    /// hashes usable for the next connection attempt only when `rejoining`.
    pub fn teardown(&mut self, rejoining: bool) {
        let (pw_hash, pw_key) = (self.keys.pw_hash, self.keys.pw_key);
        self.keys.zeroize();
        if rejoining {
            self.keys.pw_hash = pw_hash;
            self.keys.pw_key = pw_key;
            self.refresh_seed_key();
        }
        self.captcha = None;
        self.logged_in = false;
        self.phase = if rejoining {
            LoginPhase::Connecting
        } else {
            LoginPhase::Idle
        };
        self.dup_window.iter_mut().for_each(|b| *b = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hashes_are_single_and_double_md5() {
        let s = Session::new(10001, "hunter2");
        let once: [u8; 16] = Md5::digest(b"hunter2").into();
        let twice: [u8; 16] = Md5::digest(once).into();
        assert_eq!(s.keys.pw_hash, once);
        assert_eq!(s.keys.pw_key, twice);
    }

    #[test]
    fn seq_increments_and_wraps() {
        let mut s = Session::new(1, "x");
        let a = s.next_seq();
        let b = s.next_seq();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[test]
    fn dup_window_test_and_set() {
        let mut s = Session::new(1, "x");
        assert!(!s.is_dup(0x1234));
        assert!(s.is_dup(0x1234));
        assert!(!s.is_dup(0x1235));
    }

    #[test]
    fn session_md5_binds_uid_and_key() {
        let mut s = Session::new(10001, "x");
        s.adopt_session_key([7u8; 16]);
        let mut src = Vec::new();
        src.extend_from_slice(&10001u32.to_be_bytes());
        src.extend_from_slice(&[7u8; 16]);
        let expect: [u8; 16] = Md5::digest(&src).into();
        assert_eq!(s.keys.session_md5, expect);
    }

    #[test]
    fn teardown_zeroes_session_key_and_clears_window() {
        let mut s = Session::new(10001, "x");
        s.adopt_session_key([9u8; 16]);
        assert!(!s.is_dup(77));
        s.teardown(true);
        assert_eq!(s.keys.session_key, [0u8; 16]);
        assert!(!s.is_dup(77));
        // Password hashes survive a rejoin teardown.
        assert_ne!(s.keys.pw_key, [0u8; 16]);
        s.teardown(false);
        assert_eq!(s.keys.pw_key, [0u8; 16]);
    }
}
