//! Numeric message-type identifiers carried in frame headers.
//!
//! Only the tags the built-in handlers understand are named here; the
//! dispatch table accepts arbitrary tags registered by the embedding
//! application.

/// Error or informational text pushed to a peer.
pub const ERROR: u16 = 0;
/// Client login request.
pub const LOGIN: u16 = 2;
/// Acknowledgement of a successful login.
pub const LOGIN_ACK: u16 = 3;
/// Client version probe; answered with an empty frame of the same tag.
pub const VERSION_CHECK: u16 = 4;
/// Login combined with new-account registration.
pub const LOGIN_REGISTER: u16 = 6;
/// Nickname registration request.
pub const REGISTER_NICK: u16 = 7;
/// Nickname registration accepted.
pub const REGISTER_OK: u16 = 8;
/// Password pre-check issued before login.
pub const CHECK_PASS: u16 = 11;
/// Private message relayed between users.
pub const PRIVMSG: u16 = 205;
/// Directory statistics snapshot.
pub const STATS: u16 = 214;
/// Data-port reachability probe; accepted and ignored.
pub const PORT_CHECK: u16 = 300;
/// "No such peer" reply.
pub const NO_SUCH: u16 = 404;
/// Ping directed at the server itself.
pub const PING_SERVER: u16 = 750;
/// Ping between peers.
pub const PING: u16 = 751;
/// Pong answering a ping.
pub const PONG: u16 = 752;
/// Client capability advertisement; accepted and ignored.
pub const CLIENT_INFO: u16 = 920;
/// Client-initiated disconnect.
pub const CLIENT_QUIT: u16 = 10000;
/// Link login opening a peer-server connection.
pub const SERVER_LOGIN: u16 = 10010;
/// Link login acknowledgement completing a peer-server handshake.
pub const SERVER_LOGIN_ACK: u16 = 10011;
/// Remote user appeared on a linked server.
pub const REMOTE_LOGIN: u16 = 10012;
/// Per-tag dispatch counters, one frame per table entry.
pub const HISTOGRAM: u16 = 10123;
/// Summary line terminating a histogram dump.
pub const HISTOGRAM_END: u16 = 10124;

/// Returns true if `tag` may be dispatched on a connection that has not
/// yet registered as a user or server. Anything else arriving before
/// registration is a protocol violation and closes the connection.
pub fn allowed_unregistered(tag: u16) -> bool {
    matches!(
        tag,
        ERROR
            | LOGIN
            | VERSION_CHECK
            | LOGIN_REGISTER
            | REGISTER_NICK
            | CHECK_PASS
            | PORT_CHECK
            | CLIENT_INFO
            | SERVER_LOGIN
            | SERVER_LOGIN_ACK
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_tags_allowed_before_registration() {
        assert!(allowed_unregistered(LOGIN));
        assert!(allowed_unregistered(LOGIN_REGISTER));
        assert!(allowed_unregistered(SERVER_LOGIN));
    }

    #[test]
    fn test_session_tags_rejected_before_registration() {
        assert!(!allowed_unregistered(PRIVMSG));
        assert!(!allowed_unregistered(STATS));
        assert!(!allowed_unregistered(CLIENT_QUIT));
    }
}
