//! The multi-round login handshake.
//!
//! Sans-IO: the engine consumes decrypted reply payloads and produces
//! outgoing packets plus effects; the service loop owns the socket, the
//! transaction registration and the timers. The state sequence is
//!
//! ```text
//! Idle -> Resolving -> Connecting -> (ServerSelect?) -> TokenRequested
//!      -> (CaptchaChallenge*) -> PasswordChecked -> LoginSent -> Connected
//! ```
//!
//! with Error/Redirect exits from every state. Every handshake packet is an
//! important transaction: exhausting its retry budget is always fatal.
//!
//! The login block contains several fixed byte ranges whose meaning is
//! unknown; they are required verbatim by the server and must not be
//! "fixed" (see `core::consts`).

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, Bytes};
use tracing::{debug, info, warn};

use crate::core::consts::{
    cmd, login_reply, token_reply, KEY_LENGTH, LOGIN_100_BYTES, LOGIN_23_51, LOGIN_53_68,
    LOGIN_DATA_LENGTH, LOGIN_REPLY_OK_LENGTH, LOGIN_REPLY_REDIRECT_LENGTH,
};
use crate::core::crypt;
use crate::error::{ProtocolError, Result};
use crate::session::{Captcha, LoginPhase, Session};

/// One packet the engine wants on the wire. The payload is final (already
/// encrypted where the protocol requires it); the caller wraps it in an
/// envelope, registers the transaction and writes it out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    pub cmd: u16,
    pub payload: Vec<u8>,
    pub important: bool,
}

/// What the service loop must do after feeding the engine a reply.
#[derive(Debug, PartialEq, Eq)]
pub enum LoginEffect {
    /// Put this packet on the wire (as a registered transaction).
    Send(Outgoing),
    /// Surface the captcha to the embedding application and wait.
    CaptchaNeeded(Captcha),
    /// Tear the connection down and reconnect to this address, restarting
    /// the handshake from its first step.
    Redirect(SocketAddrV4),
    /// Handshake complete; session key installed, bootstrap may begin.
    Connected,
}

/// Drives one session through the handshake. Holds no IO and no secrets of
/// its own; everything lives in the [`Session`].
pub struct LoginEngine {
    /// Ask the server which address to use before authenticating (newer
    /// protocol variants).
    server_select: bool,
}

impl LoginEngine {
    pub fn new(server_select: bool) -> Self {
        Self { server_select }
    }

    /// First packet after the socket is up.
    pub fn start(&self, session: &mut Session) -> Outgoing {
        if self.server_select {
            session.phase = LoginPhase::ServerSelect;
            let mut payload = Vec::with_capacity(5);
            payload.push(0x00);
            payload.extend_from_slice(&session.uid.to_be_bytes());
            Outgoing {
                cmd: cmd::GET_SERVER,
                payload,
                important: true,
            }
        } else {
            self.request_token(session)
        }
    }

    fn request_token(&self, session: &mut Session) -> Outgoing {
        session.phase = LoginPhase::TokenRequested;
        Outgoing {
            cmd: cmd::REQUEST_LOGIN_TOKEN,
            payload: vec![0x00],
            important: true,
        }
    }

    /// Feed one handshake reply (raw payload region of the envelope).
    /// Returns the effects to apply, or a fatal error.
    pub fn handle_reply(
        &self,
        session: &mut Session,
        command: u16,
        payload: &Bytes,
    ) -> Result<Vec<LoginEffect>> {
        match command {
            cmd::GET_SERVER => self.on_server_select(session, payload),
            cmd::REQUEST_LOGIN_TOKEN => self.on_token(session, payload),
            cmd::LOGIN | cmd::CHECK_PWD => self.on_login_class_reply(session, command, payload),
            other => {
                warn!(cmd = other, "non-handshake command during login, ignoring");
                Ok(Vec::new())
            }
        }
    }

    /// Server-select reply: `[0x00]` means authenticate right here; anything
    /// else carries the address the server nominates.
    fn on_server_select(&self, session: &mut Session, payload: &Bytes) -> Result<Vec<LoginEffect>> {
        if session.phase != LoginPhase::ServerSelect {
            warn!("server-select reply outside ServerSelect phase, ignoring");
            return Ok(Vec::new());
        }
        if payload.is_empty() {
            return Err(ProtocolError::Malformed("empty server-select reply".into()));
        }
        if payload[0] == 0x00 {
            debug!("server accepted us, requesting login token");
            return Ok(vec![LoginEffect::Send(self.request_token(session))]);
        }
        let addr = parse_addr(&payload[1..])
            .ok_or_else(|| ProtocolError::Malformed("short server-select redirect".into()))?;
        info!(%addr, "server nominated another address");
        Ok(vec![LoginEffect::Redirect(addr)])
    }

    /// Token reply, unencrypted: `[code][len][token bytes]`.
    fn on_token(&self, session: &mut Session, payload: &Bytes) -> Result<Vec<LoginEffect>> {
        if session.phase != LoginPhase::TokenRequested {
            warn!("token reply outside TokenRequested phase, ignoring");
            return Ok(Vec::new());
        }
        if payload.is_empty() {
            return Err(ProtocolError::Malformed("empty token reply".into()));
        }
        if payload[0] != token_reply::OK {
            return Err(ProtocolError::TokenRejected(payload[0]));
        }
        if payload.len() < 3 {
            return Err(ProtocolError::Malformed("token reply too short".into()));
        }
        let token = &payload[2..];
        if payload[1] as usize != token.len() {
            debug!(
                declared = payload[1],
                actual = token.len(),
                "token length field disagrees with payload, using actual"
            );
        }
        session.keys.token = token.to_vec();
        debug!(len = token.len(), token = %hex::encode(token), "got login token");

        Ok(vec![LoginEffect::Send(self.build_login(session))])
    }

    /// Build the login packet: a fixed 416-byte block encrypted under a
    /// fresh random seed key, shipped as `seed_key ++ ciphertext`.
    fn build_login(&self, session: &mut Session) -> Outgoing {
        session.refresh_seed_key();

        let mut raw = Vec::with_capacity(LOGIN_DATA_LENGTH);
        // 000-015: empty string encrypted under the double password hash.
        let probe = crypt::encrypt(b"", &session.keys.pw_key);
        debug_assert_eq!(probe.len(), 16);
        raw.extend_from_slice(&probe);
        // 016: zero.
        raw.push(0x00);
        // 017-020: used to be the client IP, now zero.
        raw.extend_from_slice(&0u32.to_be_bytes());
        // 021-022: used to be the client port, now zero.
        raw.extend_from_slice(&0u16.to_be_bytes());
        // 023-051: fixed, meaning unknown.
        raw.extend_from_slice(&LOGIN_23_51);
        // 052: login mode.
        raw.push(session.login_mode);
        // 053-068: fixed, maybe machine-related.
        raw.extend_from_slice(&LOGIN_53_68);
        // 069: token length, then the token itself.
        raw.push(session.keys.token.len() as u8);
        raw.extend_from_slice(&session.keys.token);
        // 100 fixed bytes, meaning unknown.
        raw.extend_from_slice(&LOGIN_100_BYTES);
        // Zero fill to the fixed block size.
        raw.resize(LOGIN_DATA_LENGTH, 0x00);

        let crypted = crypt::encrypt(&raw, &session.keys.seed_key);
        let mut payload = Vec::with_capacity(KEY_LENGTH + crypted.len());
        payload.extend_from_slice(&session.keys.seed_key);
        payload.extend_from_slice(&crypted);

        session.phase = LoginPhase::LoginSent;
        Outgoing {
            cmd: cmd::LOGIN,
            payload,
            important: true,
        }
    }

    /// Login and password-check replies share their body format. The outer
    /// payload decrypts under the double password hash; when that fails the
    /// server used our seed key instead (that path normally carries the
    /// wrong-password reply).
    fn on_login_class_reply(
        &self,
        session: &mut Session,
        command: u16,
        payload: &Bytes,
    ) -> Result<Vec<LoginEffect>> {
        if !matches!(
            session.phase,
            LoginPhase::LoginSent | LoginPhase::PasswordChecked
        ) {
            warn!(cmd = command, "login reply outside login phase, ignoring");
            return Ok(Vec::new());
        }

        let body = crypt::decrypt(payload, &session.keys.pw_key)
            .or_else(|_| crypt::decrypt(payload, &session.keys.seed_key))?;
        if body.is_empty() {
            return Err(ProtocolError::Malformed("empty login reply".into()));
        }

        match body[0] {
            login_reply::OK => self.on_login_ok(session, &body),
            login_reply::REDIRECT | login_reply::REDIRECT_EX => on_login_redirect(&body),
            login_reply::WRONG_PASSWORD => {
                let server_msg = String::from_utf8_lossy(&body[1..]).into_owned();
                warn!(server_msg, "login rejected: wrong password");
                Err(ProtocolError::WrongPassword(server_msg))
            }
            login_reply::NEED_ACTIVATION => Err(ProtocolError::NeedActivation),
            login_reply::CAPTCHA => on_captcha_challenge(session, &body),
            other => {
                warn!(code = other, "unknown login reply code");
                Err(ProtocolError::UnknownReply(other))
            }
        }
    }

    fn on_login_ok(&self, session: &mut Session, body: &[u8]) -> Result<Vec<LoginEffect>> {
        if body.len() < 1 + KEY_LENGTH + 4 {
            return Err(ProtocolError::Malformed("login-OK reply too short".into()));
        }
        if body.len() != LOGIN_REPLY_OK_LENGTH {
            // The server sometimes pads differently; we still go on.
            warn!(
                expect = LOGIN_REPLY_OK_LENGTH,
                got = body.len(),
                "unexpected login-OK length"
            );
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&body[1..1 + KEY_LENGTH]);
        session.adopt_session_key(key);

        let mut rest = &body[1 + KEY_LENGTH..];
        let echoed_uid = rest.get_u32();
        if echoed_uid != session.uid {
            warn!(echoed_uid, uid = session.uid, "server echoed a different uid");
        }

        session.phase = LoginPhase::Connected;
        session.logged_in = true;
        session.captcha = None;
        info!(uid = session.uid, "login reply is OK");
        Ok(vec![LoginEffect::Connected])
    }

    /// The user answered the captcha: send the verification as its own
    /// transaction. The original login packet is never resent for this.
    pub fn submit_captcha(&self, session: &mut Session, code: &str) -> Result<Outgoing> {
        if session.phase != LoginPhase::CaptchaChallenge {
            return Err(ProtocolError::Malformed(
                "captcha answer without a pending challenge".into(),
            ));
        }

        let mut raw = Vec::with_capacity(
            KEY_LENGTH + 1 + code.len() + 1 + session.keys.token_ex.len(),
        );
        raw.extend_from_slice(&session.keys.pw_key);
        raw.push(code.len() as u8);
        raw.extend_from_slice(code.as_bytes());
        raw.push(session.keys.token_ex.len() as u8);
        raw.extend_from_slice(&session.keys.token_ex);

        let crypted = crypt::encrypt(&raw, &session.keys.seed_key);
        let mut payload = Vec::with_capacity(KEY_LENGTH + crypted.len());
        payload.extend_from_slice(&session.keys.seed_key);
        payload.extend_from_slice(&crypted);

        session.phase = LoginPhase::PasswordChecked;
        session.captcha = None;
        Ok(Outgoing {
            cmd: cmd::CHECK_PWD,
            payload,
            important: true,
        })
    }

    /// The user gave up on the captcha; login aborts fatally.
    pub fn cancel_captcha(&self, session: &mut Session) -> ProtocolError {
        session.captcha = None;
        ProtocolError::CaptchaCancelled
    }
}

/// Redirect body: `[code][uid][new ip][new port]`, 11 bytes.
fn on_login_redirect(body: &[u8]) -> Result<Vec<LoginEffect>> {
    if body.len() != LOGIN_REPLY_REDIRECT_LENGTH {
        warn!(
            expect = LOGIN_REPLY_REDIRECT_LENGTH,
            got = body.len(),
            "failed parsing login redirect packet"
        );
        return Err(ProtocolError::Malformed("bad redirect reply".into()));
    }
    let addr = parse_addr(&body[5..])
        .ok_or_else(|| ProtocolError::Malformed("bad redirect address".into()))?;
    info!(%addr, "login reply is redirect");
    Ok(vec![LoginEffect::Redirect(addr)])
}

/// Captcha body: `[code][u16 image len][image][u8 token len][token]`.
fn on_captcha_challenge(session: &mut Session, body: &[u8]) -> Result<Vec<LoginEffect>> {
    let mut rest = &body[1..];
    if rest.len() < 2 {
        return Err(ProtocolError::Malformed("short captcha reply".into()));
    }
    let image_len = rest.get_u16() as usize;
    if rest.len() < image_len + 1 {
        return Err(ProtocolError::Malformed("truncated captcha image".into()));
    }
    let image = rest[..image_len].to_vec();
    rest.advance(image_len);
    let token_len = rest.get_u8() as usize;
    if rest.len() < token_len {
        return Err(ProtocolError::Malformed("truncated captcha token".into()));
    }
    let token = rest[..token_len].to_vec();

    session.keys.token_ex = token.clone();
    let challenge = Captcha { image, token };
    session.captcha = Some(challenge.clone());
    session.phase = LoginPhase::CaptchaChallenge;
    info!(image_len, "login requires captcha");
    Ok(vec![LoginEffect::CaptchaNeeded(challenge)])
}

fn parse_addr(bytes: &[u8]) -> Option<SocketAddrV4> {
    if bytes.len() < 6 {
        return None;
    }
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Some(SocketAddrV4::new(ip, port))
}

/// Keep-alive body: just the owner id. Sent encrypted with the session key
/// on every timer tick once logged in; its loss is connection-fatal.
pub fn keep_alive_body(session: &Session) -> Vec<u8> {
    session.uid.to_be_bytes().to_vec()
}

/// Logout body: the double password hash, sent a fixed number of times with
/// a fixed sequence number and no transaction.
pub fn logout_body(session: &Session) -> Vec<u8> {
    session.keys.pw_key.to_vec()
}

/// How many times the logout packet is fired.
pub const LOGOUT_REPEAT: usize = 4;

/// Fixed sequence number used for logout packets.
pub const LOGOUT_SEQ: u16 = 0xFFFF;

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> LoginEngine {
        LoginEngine::new(false)
    }

    fn session() -> Session {
        Session::new(10001, "secret")
    }

    fn token_reply_payload(token: &[u8]) -> Bytes {
        let mut v = vec![token_reply::OK, token.len() as u8];
        v.extend_from_slice(token);
        Bytes::from(v)
    }

    /// Build a login-OK body exactly the size the server sends.
    fn login_ok_body(uid: u32, key: [u8; 16]) -> Vec<u8> {
        let mut body = vec![login_reply::OK];
        body.extend_from_slice(&key);
        body.extend_from_slice(&uid.to_be_bytes());
        body.resize(LOGIN_REPLY_OK_LENGTH, 0);
        body
    }

    fn drive_to_login_sent(eng: &LoginEngine, s: &mut Session) -> Outgoing {
        let first = eng.start(s);
        assert_eq!(first.cmd, cmd::REQUEST_LOGIN_TOKEN);
        let fx = eng
            .handle_reply(s, cmd::REQUEST_LOGIN_TOKEN, &token_reply_payload(b"tok-24-bytes"))
            .unwrap();
        match fx.into_iter().next().unwrap() {
            LoginEffect::Send(out) => {
                assert_eq!(out.cmd, cmd::LOGIN);
                assert!(out.important);
                out
            }
            other => panic!("expected Send(login), got {other:?}"),
        }
    }

    #[test]
    fn token_then_login_packet_layout() {
        let eng = engine();
        let mut s = session();
        let login = drive_to_login_sent(&eng, &mut s);

        // seed key in the clear, then the encrypted fixed-size block.
        assert_eq!(&login.payload[..16], &s.keys.seed_key);
        let block = crypt::decrypt(&login.payload[16..], &s.keys.seed_key).unwrap();
        assert_eq!(block.len(), LOGIN_DATA_LENGTH);
        // 000-015 decrypts to the empty string under pw_key.
        assert_eq!(crypt::decrypt(&block[..16], &s.keys.pw_key).unwrap(), b"");
        // The opaque ranges land where the server expects them.
        assert_eq!(&block[23..52], &LOGIN_23_51);
        assert_eq!(block[52], s.login_mode);
        assert_eq!(&block[53..69], &LOGIN_53_68);
        assert_eq!(block[69] as usize, b"tok-24-bytes".len());
        let tok_end = 70 + b"tok-24-bytes".len();
        assert_eq!(&block[70..tok_end], b"tok-24-bytes");
        assert_eq!(&block[tok_end..tok_end + 100], &LOGIN_100_BYTES);
        assert!(block[tok_end + 100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn rejected_token_is_fatal() {
        let eng = engine();
        let mut s = session();
        let _ = eng.start(&mut s);
        let err = eng
            .handle_reply(&mut s, cmd::REQUEST_LOGIN_TOKEN, &Bytes::from_static(&[0x33]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::TokenRejected(0x33)));
    }

    #[test]
    fn login_ok_installs_session_key() {
        let eng = engine();
        let mut s = session();
        let _ = drive_to_login_sent(&eng, &mut s);

        let body = login_ok_body(10001, [0x42; 16]);
        let payload = Bytes::from(crypt::encrypt(&body, &s.keys.pw_key));
        let fx = eng.handle_reply(&mut s, cmd::LOGIN, &payload).unwrap();
        assert_eq!(fx, vec![LoginEffect::Connected]);
        assert!(s.logged_in);
        assert_eq!(s.phase, LoginPhase::Connected);
        assert_eq!(s.keys.session_key, [0x42; 16]);
        assert_ne!(s.keys.session_md5, [0u8; 16]);
    }

    #[test]
    fn redirect_reply_yields_redirect_effect() {
        let eng = engine();
        let mut s = session();
        let _ = drive_to_login_sent(&eng, &mut s);

        let mut body = vec![login_reply::REDIRECT];
        body.extend_from_slice(&10001u32.to_be_bytes());
        body.extend_from_slice(&[10, 0, 0, 9]);
        body.extend_from_slice(&8000u16.to_be_bytes());
        let payload = Bytes::from(crypt::encrypt(&body, &s.keys.pw_key));

        let fx = eng.handle_reply(&mut s, cmd::LOGIN, &payload).unwrap();
        assert_eq!(
            fx,
            vec![LoginEffect::Redirect(SocketAddrV4::new(
                Ipv4Addr::new(10, 0, 0, 9),
                8000
            ))]
        );
        assert!(!s.logged_in);
    }

    #[test]
    fn wrong_password_reply_decrypts_under_seed_key() {
        let eng = engine();
        let mut s = session();
        let _ = drive_to_login_sent(&eng, &mut s);

        let mut body = vec![login_reply::WRONG_PASSWORD];
        body.extend_from_slice(b"bad password");
        // The server answers under the seed key on this path.
        let payload = Bytes::from(crypt::encrypt(&body, &s.keys.seed_key));
        let err = eng.handle_reply(&mut s, cmd::LOGIN, &payload).unwrap_err();
        match err {
            ProtocolError::WrongPassword(msg) => assert_eq!(msg, "bad password"),
            other => panic!("expected wrong password, got {other:?}"),
        }
    }

    #[test]
    fn unknown_reply_code_is_fatal_not_ignored() {
        let eng = engine();
        let mut s = session();
        let _ = drive_to_login_sent(&eng, &mut s);

        let payload = Bytes::from(crypt::encrypt(&[0x77, 0x00], &s.keys.pw_key));
        let err = eng.handle_reply(&mut s, cmd::LOGIN, &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownReply(0x77)));
    }

    #[test]
    fn captcha_round_then_ok() {
        let eng = engine();
        let mut s = session();
        let _ = drive_to_login_sent(&eng, &mut s);

        let image = vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3];
        let mut body = vec![login_reply::CAPTCHA];
        body.extend_from_slice(&(image.len() as u16).to_be_bytes());
        body.extend_from_slice(&image);
        body.push(4);
        body.extend_from_slice(b"cont");
        let payload = Bytes::from(crypt::encrypt(&body, &s.keys.pw_key));

        let fx = eng.handle_reply(&mut s, cmd::LOGIN, &payload).unwrap();
        match &fx[..] {
            [LoginEffect::CaptchaNeeded(challenge)] => {
                assert_eq!(challenge.image, image);
                assert_eq!(challenge.token, b"cont");
            }
            other => panic!("expected captcha effect, got {other:?}"),
        }
        assert_eq!(s.phase, LoginPhase::CaptchaChallenge);

        // Verification goes out as a distinct transaction, not a login resend.
        let verify = eng.submit_captcha(&mut s, "AB12").unwrap();
        assert_eq!(verify.cmd, cmd::CHECK_PWD);
        assert!(verify.important);
        let block = crypt::decrypt(&verify.payload[16..], &s.keys.seed_key).unwrap();
        assert_eq!(&block[..16], &s.keys.pw_key);
        assert_eq!(block[16] as usize, 4);
        assert_eq!(&block[17..21], b"AB12");
        assert_eq!(block[21] as usize, 4);
        assert_eq!(&block[22..26], b"cont");

        // Server accepts the verification with key material, like a login OK.
        let ok = Bytes::from(crypt::encrypt(
            &login_ok_body(10001, [0x24; 16]),
            &s.keys.pw_key,
        ));
        let fx = eng.handle_reply(&mut s, cmd::CHECK_PWD, &ok).unwrap();
        assert_eq!(fx, vec![LoginEffect::Connected]);
        assert_eq!(s.keys.session_key, [0x24; 16]);
    }

    #[test]
    fn captcha_answer_without_challenge_is_error() {
        let eng = engine();
        let mut s = session();
        assert!(eng.submit_captcha(&mut s, "x").is_err());
    }

    #[test]
    fn server_select_redirect_and_accept() {
        let eng = LoginEngine::new(true);
        let mut s = session();
        let first = eng.start(&mut s);
        assert_eq!(first.cmd, cmd::GET_SERVER);

        // Nominated elsewhere.
        let mut reply = vec![0x01, 192, 168, 0, 5];
        reply.extend_from_slice(&443u16.to_be_bytes());
        let fx = eng
            .handle_reply(&mut s, cmd::GET_SERVER, &Bytes::from(reply))
            .unwrap();
        assert!(matches!(fx[0], LoginEffect::Redirect(_)));

        // Accepted here: proceed to the token request.
        let mut s2 = session();
        let _ = eng.start(&mut s2);
        let fx = eng
            .handle_reply(&mut s2, cmd::GET_SERVER, &Bytes::from_static(&[0x00]))
            .unwrap();
        match &fx[..] {
            [LoginEffect::Send(out)] => assert_eq!(out.cmd, cmd::REQUEST_LOGIN_TOKEN),
            other => panic!("expected token request, got {other:?}"),
        }
    }

    #[test]
    fn truncated_login_reply_is_decrypt_error() {
        let eng = engine();
        let mut s = session();
        let _ = drive_to_login_sent(&eng, &mut s);
        let err = eng
            .handle_reply(&mut s, cmd::LOGIN, &Bytes::from_static(&[1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Decrypt));
    }
}
