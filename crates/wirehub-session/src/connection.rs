//! Per-connection state: class, buffers, flood window, output queues.

use std::{
    io::{Read, Write},
    net::SocketAddr,
    time::{Duration, Instant},
};

use tracing::debug;

use wirehub_core::{
    config::Config,
    constants::{HEADER_SIZE, READ_CHUNK},
    error::{is_transient, ErrorKind, Result},
};
use wirehub_protocol::{
    buffer::BufferChain,
    compress::{LinkCompressor, LinkDecompressor},
    recv::{FrameStatus, RecvBuffer},
};

/// The registration state of a connection. Unregistered peers may only
/// issue login traffic; the other two states are terminal until close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionClass {
    /// Connected but not yet logged in as anything.
    Unregistered,
    /// An authenticated end-user client.
    User,
    /// A linked peer server; traffic is stream-compressed.
    Server,
}

/// The pair of zlib streams wrapping a server link.
#[derive(Debug)]
struct LinkCipher {
    tx: LinkCompressor,
    rx: LinkDecompressor,
}

/// One socket peer: its stream, receive buffer, output queues and
/// rate-limiting state.
///
/// Generic over the stream type so tests can drive the state machine
/// with scripted in-memory streams; the reactor instantiates it over a
/// non-blocking TCP stream.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    class: ConnectionClass,
    recv: RecvBuffer,
    /// Wire-ready output. For server links this holds ciphertext.
    sendbuf: BufferChain,
    /// Uncompressed output awaiting compression; server links only.
    pending: BufferChain,
    cipher: Option<LinkCipher>,
    nick: Option<String>,
    flood_start: Instant,
    flood_count: u16,
    opened_at: Instant,
    connecting: bool,
    destroyed: bool,
    wants_write: bool,
    read_suspended: bool,
}

impl<S> Connection<S> {
    /// Wraps a freshly accepted or connecting stream.
    pub fn new(stream: S, peer: SocketAddr, now: Instant) -> Connection<S> {
        Connection {
            stream,
            peer,
            class: ConnectionClass::Unregistered,
            recv: RecvBuffer::new(),
            sendbuf: BufferChain::new(),
            pending: BufferChain::new(),
            cipher: None,
            nick: None,
            flood_start: now,
            flood_count: 0,
            opened_at: now,
            connecting: false,
            destroyed: false,
            wants_write: false,
            read_suspended: false,
        }
    }

    /// The peer's socket address.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current registration state.
    pub fn class(&self) -> ConnectionClass {
        self.class
    }

    /// The nickname bound at login, for user-class connections.
    pub fn nick(&self) -> Option<&str> {
        self.nick.as_deref()
    }

    /// Immutable access to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Mutable access to the underlying stream, e.g. for registration
    /// with a poller.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Promotes an unregistered connection to an authenticated user.
    pub fn promote_user(&mut self, nick: &str) {
        debug_assert_eq!(self.class, ConnectionClass::Unregistered);
        self.class = ConnectionClass::User;
        self.nick = Some(nick.to_owned());
    }

    /// Promotes a connection to a peer-server link, establishing the
    /// compression contexts for both directions. Everything already in
    /// the send queue goes out uncompressed; everything enqueued from
    /// now on is compressed.
    pub fn promote_server(&mut self, compression_level: u32) {
        self.class = ConnectionClass::Server;
        self.cipher = Some(LinkCipher {
            tx: LinkCompressor::new(compression_level),
            rx: LinkDecompressor::new(),
        });
    }

    /// True once the connection has been flagged for destruction. The
    /// object stays valid but inert until the reactor reaps it.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Flags the connection for end-of-iteration destruction.
    pub fn mark_destroyed(&mut self) {
        self.destroyed = true;
    }

    /// True while an outbound connect is still in flight.
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Marks an outbound connect as in flight / completed.
    pub fn set_connecting(&mut self, connecting: bool) {
        self.connecting = connecting;
    }

    /// True if unsent output remains and write-readiness matters.
    pub fn wants_write(&self) -> bool {
        self.wants_write
    }

    /// True while reads are suspended by flood control.
    pub fn reads_suspended(&self) -> bool {
        self.read_suspended
    }

    /// Stops reading from this peer until the flood window expires.
    pub fn suspend_reads(&mut self) {
        self.read_suspended = true;
    }

    /// Resumes reading after a flood window expired.
    pub fn resume_reads(&mut self) {
        self.read_suspended = false;
    }

    /// When the connection was accepted, for login timeouts.
    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    /// Bytes queued but not yet written, pending-uncompressed included.
    pub fn queued(&self) -> usize {
        self.sendbuf.size() + self.pending.size()
    }

    /// Detaches the receive buffer so frames can be scanned while
    /// handlers hold the reactor mutably. Pair with
    /// [`restore_recv`](Self::restore_recv).
    pub fn take_recv(&mut self) -> RecvBuffer {
        std::mem::take(&mut self.recv)
    }

    /// Reattaches the receive buffer after a scan.
    pub fn restore_recv(&mut self, recv: RecvBuffer) {
        self.recv = recv;
    }

    /// Accounts one non-exempt command against the flood window,
    /// resetting the window first if it has expired. Returns true when
    /// the command count reaches `limit` and reads must be suspended.
    pub fn flood_tick(&mut self, now: Instant, window: Duration, limit: u16) -> bool {
        if now.duration_since(self.flood_start) >= window {
            self.flood_start = now;
            self.flood_count = 0;
            false
        } else {
            self.flood_count = self.flood_count.saturating_add(1);
            self.flood_count >= limit
        }
    }

    /// True once the current flood window has run out.
    pub fn flood_expired(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.flood_start) >= window
    }

    /// When the current flood window runs out.
    pub fn flood_deadline(&self, window: Duration) -> Instant {
        self.flood_start + window
    }
}

impl<S: Read + Write> Connection<S> {
    /// Reads everything currently available from the socket into the
    /// receive buffer, decompressing on server links. Returns the raw
    /// byte count read; would-block simply ends the pass. End-of-stream
    /// and genuine I/O errors are fatal to the connection.
    pub fn fill(&mut self, config: &Config) -> Result<usize> {
        match self.class {
            ConnectionClass::Server => self.fill_compressed(),
            _ => self.fill_plain(config),
        }
    }

    /// Uncompressed discipline: size each read to the frame under
    /// construction, tolerating arbitrarily partial delivery, and bail
    /// out as soon as a header announces an oversized payload.
    fn fill_plain(&mut self, config: &Config) -> Result<usize> {
        let mut total = 0usize;
        loop {
            let want = match self.recv.peek(config.max_frame_payload) {
                FrameStatus::NeedHeader => HEADER_SIZE - self.recv.buffered(),
                FrameStatus::NeedBody { need } => need,
                // current frame complete; keep draining the socket so a
                // burst of frames lands in one pass
                FrameStatus::Ready { .. } => READ_CHUNK,
                FrameStatus::TooLarge { len } => {
                    return Err(ErrorKind::FrameTooLarge {
                        length: len,
                        limit: config.max_frame_payload,
                    })
                }
            };
            match self.recv.read_from(&mut self.stream, want) {
                Ok(0) => return Err(ErrorKind::EndOfStream),
                Ok(n) => {
                    total += n;
                    if n < want {
                        // short read: the socket queue is drained
                        return Ok(total);
                    }
                }
                Err(ErrorKind::Io(err)) if is_transient(&err) => return Ok(total),
                Err(err) => return Err(err),
            }
        }
    }

    /// Compressed discipline: pull fixed-size chunks while the socket
    /// keeps returning full reads and inflate each one straight into the
    /// receive buffer.
    fn fill_compressed(&mut self) -> Result<usize> {
        let mut total = 0usize;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = match self.stream.read(&mut chunk) {
                Ok(0) => return Err(ErrorKind::EndOfStream),
                Ok(n) => n,
                Err(err) if is_transient(&err) => break,
                Err(err) => return Err(err.into()),
            };
            total += n;
            let cipher = match self.cipher.as_mut() {
                Some(cipher) => cipher,
                None => {
                    return Err(ErrorKind::ProtocolViolation(
                        "server link has no compression context".to_owned(),
                    ))
                }
            };
            cipher.rx.decompress_into(&chunk[..n], &mut self.recv)?;
            if n < chunk.len() {
                // a short read means the queue is likely empty
                break;
            }
        }
        Ok(total)
    }

    /// Queues `bytes` for delivery. Server output always aggregates in
    /// the pending chain for compression; user output is written
    /// immediately when nothing is backlogged, queueing only the
    /// remainder a non-blocking write could not take.
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        match self.class {
            ConnectionClass::Server => self.pending.append(bytes),
            _ => {
                let mut rest = bytes;
                if self.sendbuf.is_empty() {
                    match self.stream.write(rest) {
                        Ok(n) if n == rest.len() => return Ok(()),
                        Ok(n) => rest = &rest[n..],
                        Err(err) if is_transient(&err) => {}
                        Err(err) => return Err(err.into()),
                    }
                    self.wants_write = true;
                }
                self.sendbuf.append(rest)
            }
        }
    }

    /// Drives compression (server links), writes queued output until the
    /// socket would block, and enforces the per-class queue ceiling.
    /// Returns bytes written for global accounting.
    pub fn flush(&mut self, config: &Config) -> Result<usize> {
        if self.destroyed {
            self.wants_write = false;
            return Ok(0);
        }
        if self.class == ConnectionClass::Server {
            if let Some(cipher) = self.cipher.as_mut() {
                cipher.tx.compress_chain(
                    &mut self.pending,
                    &mut self.sendbuf,
                    config.compress_batch_target,
                )?;
            }
            if config.server_write_chunk > 0 && self.sendbuf.size() < config.server_write_chunk {
                // batching policy: wait for more output before writing
                self.wants_write = false;
                self.check_ceiling(config)?;
                return Ok(0);
            }
        }

        let mut written = 0usize;
        loop {
            let n = match self.sendbuf.head() {
                None => break,
                Some(chunk) => match self.stream.write(chunk) {
                    Ok(0) => {
                        debug!(peer = %self.peer, "wrote zero bytes, retrying next pass");
                        break;
                    }
                    Ok(n) => n,
                    Err(err) if is_transient(&err) => break,
                    Err(err) => return Err(err.into()),
                },
            };
            self.sendbuf.consume(n);
            written += n;
        }

        self.check_ceiling(config)?;
        self.wants_write = !self.sendbuf.is_empty()
            || (self.class == ConnectionClass::Server && !self.pending.is_empty());
        Ok(written)
    }

    /// A slow peer may not absorb unbounded memory: past the class
    /// ceiling the connection is dropped.
    fn check_ceiling(&self, config: &Config) -> Result<()> {
        let (queued, limit) = match self.class {
            ConnectionClass::Server => (self.pending.size(), config.server_queue_limit),
            _ => (self.sendbuf.size(), config.client_queue_limit),
        };
        if queued > 0 && queued >= limit {
            return Err(ErrorKind::QueueOverflow { queued, limit });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use wirehub_protocol::frame::encode_frame;

    /// In-memory stream with scripted reads and a tunable write side.
    struct ScriptedStream {
        reads: VecDeque<Vec<u8>>,
        eof_when_empty: bool,
        written: Vec<u8>,
        /// None: accept everything. Some(0): always would-block.
        /// Some(k): accept at most k bytes per call.
        write_limit: Option<usize>,
    }

    impl ScriptedStream {
        fn new(chunks: Vec<Vec<u8>>) -> ScriptedStream {
            ScriptedStream {
                reads: chunks.into(),
                eof_when_empty: false,
                written: Vec::new(),
                write_limit: None,
            }
        }

        fn sink(write_limit: Option<usize>) -> ScriptedStream {
            ScriptedStream {
                reads: VecDeque::new(),
                eof_when_empty: false,
                written: Vec::new(),
                write_limit,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None if self.eof_when_empty => Ok(0),
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "empty")),
                Some(mut chunk) => {
                    if chunk.len() > buf.len() {
                        let rest = chunk.split_off(buf.len());
                        self.reads.push_front(rest);
                    }
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.write_limit {
                Some(0) => Err(io::Error::new(io::ErrorKind::WouldBlock, "full")),
                Some(limit) => {
                    let n = buf.len().min(limit);
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
                None => {
                    self.written.extend_from_slice(buf);
                    Ok(buf.len())
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    fn scan(conn: &mut Connection<ScriptedStream>, config: &Config) -> Vec<(u16, Vec<u8>)> {
        let mut frames = Vec::new();
        let mut recv = conn.take_recv();
        while let FrameStatus::Ready { tag, len } = recv.peek(config.max_frame_payload) {
            frames.push((tag, recv.payload(len).to_vec()));
            recv.advance(len);
        }
        recv.compact();
        conn.restore_recv(recv);
        frames
    }

    fn stream_of_frames() -> (Vec<u8>, Vec<(u16, Vec<u8>)>) {
        let expected = vec![
            (2u16, b"alice passwd".to_vec()),
            (214u16, Vec::new()),
            (205u16, b"bob hello there".to_vec()),
        ];
        let mut stream = Vec::new();
        for (tag, payload) in &expected {
            stream.extend_from_slice(&encode_frame(*tag, payload).unwrap());
        }
        (stream, expected)
    }

    #[test]
    fn test_partial_delivery_is_invariant() {
        let (stream, expected) = stream_of_frames();
        let config = Config::default();

        for chunk_size in [1usize, 2, 3, 5, 7, 16, stream.len()] {
            let chunks: Vec<Vec<u8>> =
                stream.chunks(chunk_size).map(|c| c.to_vec()).collect();
            let rounds = chunks.len() + 1;
            let mut conn = Connection::new(ScriptedStream::new(chunks), addr(), Instant::now());
            let mut frames = Vec::new();
            for _ in 0..rounds {
                conn.fill(&config).unwrap();
                frames.extend(scan(&mut conn, &config));
            }
            assert_eq!(frames, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_end_of_stream_is_fatal() {
        let mut stream = ScriptedStream::new(vec![]);
        stream.eof_when_empty = true;
        let mut conn = Connection::new(stream, addr(), Instant::now());
        assert!(matches!(
            conn.fill(&Config::default()),
            Err(ErrorKind::EndOfStream)
        ));
    }

    #[test]
    fn test_oversized_header_is_fatal() {
        // header announcing 65000 payload bytes
        let header = vec![0xe8u8, 0xfd, 0x02, 0x00];
        let mut conn =
            Connection::new(ScriptedStream::new(vec![header]), addr(), Instant::now());
        assert!(matches!(
            conn.fill(&Config::default()),
            Err(ErrorKind::FrameTooLarge { length: 65000, .. })
        ));
    }

    #[test]
    fn test_enqueue_writes_immediately_without_backlog() {
        let mut conn = Connection::new(ScriptedStream::sink(None), addr(), Instant::now());
        conn.enqueue(b"direct").unwrap();
        assert_eq!(conn.stream().written, b"direct");
        assert_eq!(conn.queued(), 0);
        assert!(!conn.wants_write());
    }

    #[test]
    fn test_enqueue_queues_remainder_of_partial_write() {
        let mut conn = Connection::new(ScriptedStream::sink(Some(3)), addr(), Instant::now());
        conn.enqueue(b"hello world").unwrap();
        assert_eq!(conn.stream().written, b"hel");
        assert_eq!(conn.queued(), 8);
        assert!(conn.wants_write());

        let written = conn.flush(&Config::default()).unwrap();
        assert_eq!(written, 8);
        assert_eq!(conn.stream().written, b"hello world");
        assert!(!conn.wants_write());
    }

    #[test]
    fn test_backlogged_enqueue_appends_in_order() {
        let mut conn = Connection::new(ScriptedStream::sink(Some(0)), addr(), Instant::now());
        conn.enqueue(b"first ").unwrap();
        conn.enqueue(b"second").unwrap();
        assert_eq!(conn.queued(), 12);
        conn.stream_mut().write_limit = None;
        conn.flush(&Config::default()).unwrap();
        assert_eq!(conn.stream().written, b"first second");
    }

    #[test]
    fn test_queue_ceiling_closes_connection() {
        let mut config = Config::default();
        config.client_queue_limit = 64;
        let mut conn = Connection::new(ScriptedStream::sink(Some(0)), addr(), Instant::now());
        conn.enqueue(&[0u8; 100]).unwrap();
        assert!(matches!(
            conn.flush(&config),
            Err(ErrorKind::QueueOverflow { queued: 100, limit: 64 })
        ));
    }

    #[test]
    fn test_server_output_compresses_through_pending_chain() {
        let config = Config::default();
        let mut conn = Connection::new(ScriptedStream::sink(None), addr(), Instant::now());
        conn.promote_server(config.compression_level);

        let frame = encode_frame(751, b"are you there").unwrap();
        conn.enqueue(&frame).unwrap();
        // server data never hits the socket on enqueue
        assert!(conn.stream().written.is_empty());
        assert_eq!(conn.queued(), frame.len());

        conn.flush(&config).unwrap();
        assert_eq!(conn.queued(), 0);

        let mut rx = LinkDecompressor::new();
        let mut recv = RecvBuffer::new();
        rx.decompress_into(&conn.stream().written, &mut recv).unwrap();
        assert_eq!(recv.unconsumed(), &frame[..]);
    }

    #[test]
    fn test_server_inbound_decompresses_and_frames() {
        let config = Config::default();
        let frame_a = encode_frame(10012, b"carol remote").unwrap();
        let frame_b = encode_frame(751, b"").unwrap();

        let mut tx = LinkCompressor::new(config.compression_level);
        let mut pending = BufferChain::new();
        pending.append(&frame_a).unwrap();
        pending.append(&frame_b).unwrap();
        let mut out = BufferChain::new();
        tx.compress_chain(&mut pending, &mut out, usize::MAX).unwrap();
        let mut cipher = Vec::new();
        while let Some(head) = out.head() {
            cipher.extend_from_slice(head);
            let n = head.len();
            out.consume(n);
        }

        // deliver the ciphertext in two arbitrary pieces
        let split = cipher.len() / 2;
        let chunks = vec![cipher[..split].to_vec(), cipher[split..].to_vec()];
        let mut conn = Connection::new(ScriptedStream::new(chunks), addr(), Instant::now());
        conn.promote_server(config.compression_level);

        conn.fill(&config).unwrap();
        conn.fill(&config).unwrap();
        let frames = scan(&mut conn, &config);
        assert_eq!(
            frames,
            vec![(10012, b"carol remote".to_vec()), (751, Vec::new())]
        );
    }

    #[test]
    fn test_flood_window_triggers_at_threshold() {
        let window = Duration::from_secs(10);
        let now = Instant::now();
        let mut conn = Connection::new(ScriptedStream::sink(None), addr(), now);
        conn.promote_user("alice");

        for i in 1..5u16 {
            assert!(!conn.flood_tick(now, window, 5), "command {}", i);
        }
        assert!(conn.flood_tick(now, window, 5));
    }

    #[test]
    fn test_spaced_commands_never_trigger_flood() {
        let window = Duration::from_secs(10);
        let mut now = Instant::now();
        let mut conn = Connection::new(ScriptedStream::sink(None), addr(), now);
        conn.promote_user("alice");

        for _ in 0..20 {
            now += window;
            assert!(!conn.flood_tick(now, window, 5));
        }
    }

    #[test]
    fn test_destroyed_connection_is_inert() {
        let mut conn = Connection::new(ScriptedStream::sink(None), addr(), Instant::now());
        conn.mark_destroyed();
        conn.enqueue(b"too late").unwrap();
        assert!(conn.stream().written.is_empty());
        assert_eq!(conn.flush(&Config::default()).unwrap(), 0);
    }
}
