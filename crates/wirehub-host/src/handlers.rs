//! Built-in protocol handlers.
//!
//! These cover login and registration, link establishment, keepalive and
//! the small operator surface (stats, histogram). Everything else,
//! like search, channels and accounts, belongs to the embedding application,
//! which registers its own handlers through
//! [`Reactor::with_handlers`](crate::reactor::Reactor::with_handlers).
//!
//! Payloads arrive as bounded byte slices with no terminator. The text
//! commands here parse with [`String::from_utf8_lossy`] and whitespace
//! splitting; a handler must never index past the slice it was given.

use std::borrow::Cow;

use rand::Rng;
use tracing::{debug, info, warn};

use wirehub_core::tags;
use wirehub_session::ConnectionClass;

use crate::{
    dispatch::Handler,
    reactor::{ConnId, Reactor},
};

/// The handler set every reactor starts from. Ping and pong are exempt
/// from flood control: suspending them would make lag look like flooding.
pub fn builtin_handlers() -> Vec<(u16, Handler, bool)> {
    vec![
        (tags::ERROR, peer_error as Handler, false),
        (tags::LOGIN, login as Handler, false),
        (tags::VERSION_CHECK, version_check as Handler, false),
        (tags::LOGIN_REGISTER, login as Handler, false),
        (tags::REGISTER_NICK, register_nick as Handler, false),
        (tags::CHECK_PASS, ignore as Handler, false),
        (tags::PRIVMSG, privmsg as Handler, false),
        (tags::STATS, stats as Handler, false),
        (tags::PORT_CHECK, ignore as Handler, false),
        (tags::PING_SERVER, ping_server as Handler, false),
        (tags::PING, ping as Handler, true),
        (tags::PONG, pong as Handler, true),
        (tags::CLIENT_INFO, ignore as Handler, false),
        (tags::CLIENT_QUIT, client_quit as Handler, false),
        (tags::SERVER_LOGIN, server_login as Handler, false),
        (tags::SERVER_LOGIN_ACK, server_login_ack as Handler, false),
        (tags::REMOTE_LOGIN, remote_login as Handler, false),
        (tags::HISTOGRAM, histogram as Handler, false),
    ]
}

fn text(payload: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(payload)
}

fn first_word(payload: &[u8]) -> Option<String> {
    text(payload).split_whitespace().next().map(str::to_owned)
}

/// 0: the peer pushed an error or notice; log it for operators.
fn peer_error(_reactor: &mut Reactor, id: ConnId, _tag: u16, payload: &[u8]) {
    warn!(id, msg = %text(payload), "peer reported error");
}

/// 2 / 6: `<nick> <password> ...`: bind the nickname, acknowledge, and
/// tell the rest of the mesh the user is here.
fn login(reactor: &mut Reactor, id: ConnId, _tag: u16, payload: &[u8]) {
    if reactor.connection_class(id) != Some(ConnectionClass::Unregistered) {
        reactor.send_text(id, tags::ERROR, "already logged in");
        return;
    }
    let nick = match first_word(payload) {
        Some(nick) => nick,
        None => {
            reactor.send_text(id, tags::ERROR, "login: missing nickname");
            reactor.destroy(id);
            return;
        }
    };
    if !reactor.register_user(id, &nick) {
        reactor.send_text(id, tags::ERROR, &format!("{} is already active", nick));
        reactor.destroy(id);
        return;
    }
    info!(id, nick = %nick, "user logged in");
    reactor.send_text(id, tags::LOGIN_ACK, "anon@wirehub");
    let note = format!("{} {}", nick, reactor.config().server_name);
    reactor.broadcast_servers(None, tags::REMOTE_LOGIN, note.as_bytes());
}

/// 4: some clients hang forever waiting for this, so answer in kind.
fn version_check(reactor: &mut Reactor, id: ConnId, tag: u16, _payload: &[u8]) {
    if reactor.connection_class(id) == Some(ConnectionClass::User) {
        reactor.send_text(id, tag, "");
    }
}

/// 7: `<nick>`: report whether the nickname is free.
fn register_nick(reactor: &mut Reactor, id: ConnId, _tag: u16, payload: &[u8]) {
    match first_word(payload) {
        Some(nick) if reactor.lookup_user(&nick).is_none() => {
            reactor.send_text(id, tags::REGISTER_OK, "");
        }
        Some(nick) => {
            reactor.send_text(id, tags::ERROR, &format!("{} is already registered", nick));
        }
        None => reactor.send_text(id, tags::ERROR, "register: missing nickname"),
    }
}

/// Accepted for compatibility, intentionally does nothing.
fn ignore(_reactor: &mut Reactor, _id: ConnId, _tag: u16, _payload: &[u8]) {}

/// 205: `<recipient> <text>`: relay through the user directory.
fn privmsg(reactor: &mut Reactor, id: ConnId, _tag: u16, payload: &[u8]) {
    let sender = match reactor.connection_nick(id) {
        Some(nick) => nick,
        None => {
            debug!(id, "message from connection without a nickname");
            return;
        }
    };
    let body = text(payload);
    let mut parts = body.splitn(2, ' ');
    let (target, message) = match (parts.next(), parts.next()) {
        (Some(target), Some(message)) if !target.is_empty() => (target.to_owned(), message.to_owned()),
        _ => {
            reactor.send_text(id, tags::ERROR, "message: missing recipient");
            return;
        }
    };
    match reactor.lookup_user(&target) {
        Some(peer) => {
            let relayed = format!("{} {}", sender, message);
            reactor.enqueue_frame(peer, tags::PRIVMSG, relayed.as_bytes());
        }
        None => {
            reactor.send_text(id, tags::NO_SUCH, &format!("{} is not online", target));
        }
    }
}

/// 214: `<users> <files> <gigs>` snapshot. File counts belong to the
/// indexing layer, which is not part of this server.
fn stats(reactor: &mut Reactor, id: ConnId, _tag: u16, _payload: &[u8]) {
    let snapshot = format!("{} 0 0", reactor.user_count());
    reactor.send_text(id, tags::STATS, &snapshot);
}

/// 750: ping aimed at the server itself; answer with our name.
fn ping_server(reactor: &mut Reactor, id: ConnId, tag: u16, _payload: &[u8]) {
    let name = reactor.config().server_name.clone();
    reactor.send_text(id, tag, &name);
}

/// 751: echo the payload back as a pong.
fn ping(reactor: &mut Reactor, id: ConnId, _tag: u16, payload: &[u8]) {
    let echo = payload.to_vec();
    reactor.enqueue_frame(id, tags::PONG, &echo);
}

/// 752
fn pong(_reactor: &mut Reactor, id: ConnId, _tag: u16, _payload: &[u8]) {
    debug!(id, "pong");
}

/// 10000: orderly client disconnect.
fn client_quit(reactor: &mut Reactor, id: ConnId, _tag: u16, _payload: &[u8]) {
    info!(id, nick = reactor.connection_nick(id).as_deref().unwrap_or("?"), "client quit");
    reactor.destroy(id);
}

/// 10010: `<name> <nonce>`: a peer opens a link to us. The ack must
/// leave before the promotion: it travels uncompressed, and everything
/// queued after the promotion is ciphertext.
fn server_login(reactor: &mut Reactor, id: ConnId, _tag: u16, payload: &[u8]) {
    if reactor.connection_class(id) != Some(ConnectionClass::Unregistered) {
        reactor.send_text(id, tags::ERROR, "link already established");
        return;
    }
    let name = match first_word(payload) {
        Some(name) => name,
        None => {
            reactor.send_text(id, tags::ERROR, "link login: missing server name");
            reactor.destroy(id);
            return;
        }
    };
    let nonce: u64 = rand::rng().random();
    let ack = format!("{} {:016x}", reactor.config().server_name, nonce);
    reactor.send_text(id, tags::SERVER_LOGIN_ACK, &ack);
    reactor.register_server(id);
    info!(id, peer = %name, "server link registered");
}

/// 10011: the peer accepted our link login; compression starts here.
fn server_login_ack(reactor: &mut Reactor, id: ConnId, _tag: u16, payload: &[u8]) {
    if reactor.connection_class(id) != Some(ConnectionClass::Unregistered) {
        warn!(id, "unexpected link acknowledgement");
        return;
    }
    let name = first_word(payload).unwrap_or_else(|| "?".to_owned());
    reactor.register_server(id);
    info!(id, peer = %name, "server link acknowledged");
}

/// 10012: a user appeared somewhere on the mesh; pass it along so every
/// server eventually hears about it.
fn remote_login(reactor: &mut Reactor, id: ConnId, _tag: u16, payload: &[u8]) {
    if reactor.connection_class(id) != Some(ConnectionClass::Server) {
        warn!(id, "remote login from a non-server connection");
        return;
    }
    debug!(id, user = %text(payload), "remote user announced");
    reactor.broadcast_servers(Some(id), tags::REMOTE_LOGIN, payload);
}

/// 10123: one frame per dispatch entry, then a summary row carrying the
/// unknown-tag counters and the grand totals.
fn histogram(reactor: &mut Reactor, id: ConnId, _tag: u16, _payload: &[u8]) {
    let mut total_count = 0u64;
    let mut total_bytes = 0u64;
    for (tag, count, bytes) in reactor.dispatch_rows() {
        total_count += count;
        total_bytes += bytes;
        reactor.send_text(id, tags::HISTOGRAM, &format!("{} {} {}", tag, count, bytes));
    }
    let (unknown_tag, unknown_count, unknown_bytes) = reactor.unknown_counters();
    reactor.send_text(
        id,
        tags::HISTOGRAM_END,
        &format!(
            "{} {} {} {} {}",
            unknown_tag, unknown_count, unknown_bytes, total_count, total_bytes
        ),
    );
}
