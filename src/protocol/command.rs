//! Typed view over the numeric command ids.
//!
//! The engine routes on this enum instead of raw numbers so that the
//! compiler enforces exhaustive handling; ids the engine does not know get
//! the explicit `Unknown` variant rather than falling through a table.

use crate::core::consts::cmd;

/// Every command id the engine routes on, plus `Unknown` for the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Logout,
    KeepAlive,
    UpdateInfo,
    GetUserInfo,
    AddFriendWoAuth,
    DelFriend,
    RemoveSelf,
    ChangeStatus,
    SendIm,
    RecvIm,
    GetServer,
    Login,
    GetFriendsList,
    GetFriendsOnline,
    GroupCmd,
    GetAllListWithGroup,
    GetLevel,
    RequestLoginToken,
    RecvMsgSys,
    FriendChangeStatus,
    CheckPwd,
    Unknown(u16),
}

impl From<u16> for Command {
    fn from(id: u16) -> Self {
        match id {
            cmd::LOGOUT => Command::Logout,
            cmd::KEEP_ALIVE => Command::KeepAlive,
            cmd::UPDATE_INFO => Command::UpdateInfo,
            cmd::GET_USER_INFO => Command::GetUserInfo,
            cmd::ADD_FRIEND_WO_AUTH => Command::AddFriendWoAuth,
            cmd::DEL_FRIEND => Command::DelFriend,
            cmd::REMOVE_SELF => Command::RemoveSelf,
            cmd::CHANGE_STATUS => Command::ChangeStatus,
            cmd::SEND_IM => Command::SendIm,
            cmd::RECV_IM => Command::RecvIm,
            cmd::GET_SERVER => Command::GetServer,
            cmd::LOGIN => Command::Login,
            cmd::GET_FRIENDS_LIST => Command::GetFriendsList,
            cmd::GET_FRIENDS_ONLINE => Command::GetFriendsOnline,
            cmd::GROUP_CMD => Command::GroupCmd,
            cmd::GET_ALL_LIST_WITH_GROUP => Command::GetAllListWithGroup,
            cmd::GET_LEVEL => Command::GetLevel,
            cmd::REQUEST_LOGIN_TOKEN => Command::RequestLoginToken,
            cmd::RECV_MSG_SYS => Command::RecvMsgSys,
            cmd::FRIEND_CHANGE_STATUS => Command::FriendChangeStatus,
            cmd::CHECK_PWD => Command::CheckPwd,
            other => Command::Unknown(other),
        }
    }
}

impl Command {
    pub fn id(self) -> u16 {
        match self {
            Command::Logout => cmd::LOGOUT,
            Command::KeepAlive => cmd::KEEP_ALIVE,
            Command::UpdateInfo => cmd::UPDATE_INFO,
            Command::GetUserInfo => cmd::GET_USER_INFO,
            Command::AddFriendWoAuth => cmd::ADD_FRIEND_WO_AUTH,
            Command::DelFriend => cmd::DEL_FRIEND,
            Command::RemoveSelf => cmd::REMOVE_SELF,
            Command::ChangeStatus => cmd::CHANGE_STATUS,
            Command::SendIm => cmd::SEND_IM,
            Command::RecvIm => cmd::RECV_IM,
            Command::GetServer => cmd::GET_SERVER,
            Command::Login => cmd::LOGIN,
            Command::GetFriendsList => cmd::GET_FRIENDS_LIST,
            Command::GetFriendsOnline => cmd::GET_FRIENDS_ONLINE,
            Command::GroupCmd => cmd::GROUP_CMD,
            Command::GetAllListWithGroup => cmd::GET_ALL_LIST_WITH_GROUP,
            Command::GetLevel => cmd::GET_LEVEL,
            Command::RequestLoginToken => cmd::REQUEST_LOGIN_TOKEN,
            Command::RecvMsgSys => cmd::RECV_MSG_SYS,
            Command::FriendChangeStatus => cmd::FRIEND_CHANGE_STATUS,
            Command::CheckPwd => cmd::CHECK_PWD,
            Command::Unknown(other) => other,
        }
    }
}

/// Routing metadata attached to a transaction.
///
/// `Bootstrap` steps chain the fixed post-login sequence; `Room` tags which
/// group a room-scoped reply belongs to (the opaque ship value carries the
/// room id); `None` is ad hoc feature traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateClass {
    #[default]
    None,
    Bootstrap(BootstrapStep),
    Room,
}

/// The fixed chain of follow-up commands run right after login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    OwnInfo,
    OnlineStatus,
    FriendsList,
    GroupList,
    Levels,
    FriendsOnline,
}

impl BootstrapStep {
    /// Next step in the chain, or `None` once bootstrap is complete.
    pub fn next(self) -> Option<BootstrapStep> {
        match self {
            BootstrapStep::OwnInfo => Some(BootstrapStep::OnlineStatus),
            BootstrapStep::OnlineStatus => Some(BootstrapStep::FriendsList),
            BootstrapStep::FriendsList => Some(BootstrapStep::GroupList),
            BootstrapStep::GroupList => Some(BootstrapStep::Levels),
            BootstrapStep::Levels => Some(BootstrapStep::FriendsOnline),
            BootstrapStep::FriendsOnline => None,
        }
    }

    pub fn command(self) -> Command {
        match self {
            BootstrapStep::OwnInfo => Command::GetUserInfo,
            BootstrapStep::OnlineStatus => Command::ChangeStatus,
            BootstrapStep::FriendsList => Command::GetFriendsList,
            BootstrapStep::GroupList => Command::GetAllListWithGroup,
            BootstrapStep::Levels => Command::GetLevel,
            BootstrapStep::FriendsOnline => Command::GetFriendsOnline,
        }
    }
}
