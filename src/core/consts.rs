//! Wire-level constants of the QQ protocol.
//!
//! Everything in this file is dictated by the server side and must not be
//! changed: tags, command ids and reply codes are fixed enumerations, and the
//! login blobs are undocumented byte sequences the server expects verbatim.
//! Altering any of them is a compatibility break, not a cleanup.

/// First byte of every envelope.
pub const PACKET_TAG: u8 = 0x02;

/// Last byte of every envelope.
pub const PACKET_TAIL: u8 = 0x03;

/// Client/version tag sent in the envelope header (QQ2005 build).
pub const CLIENT_TAG: u16 = 0x0D55;

/// Header length on the datagram transport:
/// tag(1) + client(2) + cmd(2) + seq(2) + uid(4).
pub const UDP_HEADER_LENGTH: usize = 11;

/// Header length on the stream transport: a 16-bit total-envelope length
/// prefix (covering itself) comes before the datagram header.
pub const TCP_HEADER_LENGTH: usize = UDP_HEADER_LENGTH + 2;

/// Smallest possible datagram envelope: header plus tail tag.
pub const MIN_UDP_PACKET: usize = UDP_HEADER_LENGTH + 1;

/// Hard ceiling on a single envelope.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Symmetric key length used everywhere in the protocol.
pub const KEY_LENGTH: usize = 16;

/// Fixed size of the plaintext login block.
pub const LOGIN_DATA_LENGTH: usize = 416;

/// Expected size of a decrypted login-OK reply.
pub const LOGIN_REPLY_OK_LENGTH: usize = 139;

/// Expected size of a decrypted login-redirect reply.
pub const LOGIN_REPLY_REDIRECT_LENGTH: usize = 11;

/// Command ids (16-bit, network order on the wire).
pub mod cmd {
    pub const LOGOUT: u16 = 0x0001;
    pub const KEEP_ALIVE: u16 = 0x0002;
    pub const UPDATE_INFO: u16 = 0x0004;
    pub const GET_USER_INFO: u16 = 0x0006;
    pub const ADD_FRIEND_WO_AUTH: u16 = 0x0009;
    pub const DEL_FRIEND: u16 = 0x000A;
    pub const REMOVE_SELF: u16 = 0x000B;
    pub const CHANGE_STATUS: u16 = 0x000D;
    pub const SEND_IM: u16 = 0x0016;
    pub const RECV_IM: u16 = 0x0017;
    pub const GET_SERVER: u16 = 0x0021;
    pub const LOGIN: u16 = 0x0022;
    pub const GET_FRIENDS_LIST: u16 = 0x0026;
    pub const GET_FRIENDS_ONLINE: u16 = 0x0027;
    pub const GROUP_CMD: u16 = 0x0030;
    pub const GET_ALL_LIST_WITH_GROUP: u16 = 0x0058;
    pub const GET_LEVEL: u16 = 0x005C;
    pub const REQUEST_LOGIN_TOKEN: u16 = 0x0062;
    pub const RECV_MSG_SYS: u16 = 0x0080;
    pub const FRIEND_CHANGE_STATUS: u16 = 0x0081;
    pub const CHECK_PWD: u16 = 0x00DD;
}

/// Reply codes of the login command (first byte of the decrypted body).
pub mod login_reply {
    pub const OK: u8 = 0x00;
    pub const REDIRECT: u8 = 0x01;
    pub const WRONG_PASSWORD: u8 = 0x05;
    pub const NEED_ACTIVATION: u8 = 0x06;
    pub const CAPTCHA: u8 = 0x07;
    pub const REDIRECT_EX: u8 = 0x0A;
}

/// Reply codes of the token request.
pub mod token_reply {
    pub const OK: u8 = 0x00;
}

/// Login block bytes 23..51. Copied from lumaqq for the 2005 protocol;
/// meaning unknown.
pub const LOGIN_23_51: [u8; 29] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x86, 0xcc, 0x4c, 0x35,
    0x2c, 0xd3, 0x73, 0x6c, 0x14, 0xf6, 0xf6, 0xaf,
    0xc3, 0xfa, 0x33, 0xa4, 0x01,
];

/// Login block bytes 53..68. Fixed value, possibly machine-related;
/// not affected by version or mac address.
pub const LOGIN_53_68: [u8; 16] = [
    0x8D, 0x8B, 0xFA, 0xEC, 0xD5, 0x52, 0x17, 0x4A,
    0x86, 0xF9, 0xA7, 0x75, 0xE6, 0x32, 0xD1, 0x6D,
];

/// 100 trailing bytes of the login block. Meaning unknown.
pub const LOGIN_100_BYTES: [u8; 100] = [
    0x40, 0x0B, 0x04, 0x02, 0x00, 0x01, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x03, 0x09, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x01, 0xE9, 0x03, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xF3, 0x03,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xED,
    0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01,
    0xEC, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x03, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x03, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x01, 0xEE, 0x03, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x01, 0xEF, 0x03, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x01, 0xEB, 0x03, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// Human-readable name of a command id, for logs only.
pub fn cmd_desc(command: u16) -> &'static str {
    match command {
        cmd::LOGOUT => "logout",
        cmd::KEEP_ALIVE => "keep_alive",
        cmd::UPDATE_INFO => "update_info",
        cmd::GET_USER_INFO => "get_user_info",
        cmd::ADD_FRIEND_WO_AUTH => "add_friend_wo_auth",
        cmd::DEL_FRIEND => "del_friend",
        cmd::REMOVE_SELF => "remove_self",
        cmd::CHANGE_STATUS => "change_status",
        cmd::SEND_IM => "send_im",
        cmd::RECV_IM => "recv_im",
        cmd::GET_SERVER => "get_server",
        cmd::LOGIN => "login",
        cmd::GET_FRIENDS_LIST => "get_friends_list",
        cmd::GET_FRIENDS_ONLINE => "get_friends_online",
        cmd::GROUP_CMD => "group_cmd",
        cmd::GET_ALL_LIST_WITH_GROUP => "get_all_list_with_group",
        cmd::GET_LEVEL => "get_level",
        cmd::REQUEST_LOGIN_TOKEN => "request_login_token",
        cmd::RECV_MSG_SYS => "recv_msg_sys",
        cmd::FRIEND_CHANGE_STATUS => "friend_change_status",
        cmd::CHECK_PWD => "check_pwd",
        _ => "unknown",
    }
}
