use std::time::Duration;

/// Configuration options to tune protocol and runtime behavior.
///
/// A single `Config` is owned by the reactor and passed by reference into
/// the session and protocol layers; nothing here is global state.
#[derive(Clone, Debug)]
pub struct Config {
    /// Max declared payload length in bytes for a single frame. A frame
    /// header announcing more than this closes the connection.
    pub max_frame_payload: usize,
    /// Max bytes queued but unsent on a user link before the connection
    /// is dropped as unresponsive.
    pub client_queue_limit: usize,
    /// Max bytes of uncompressed output queued on a server link before
    /// the connection is dropped.
    pub server_queue_limit: usize,
    /// zlib compression level for server links (0-9).
    pub compression_level: u32,
    /// Minimum ciphertext to accumulate on a server link before the
    /// socket write is attempted. 0 writes every iteration. Raising this
    /// trades latency for fewer, larger writes on high-fan-out meshes.
    pub server_write_chunk: usize,
    /// Target ciphertext bytes produced per compression pass, amortizing
    /// per-call overhead while bounding added latency.
    pub compress_batch_target: usize,
    /// Length of the flood-control window.
    pub flood_window: Duration,
    /// Commands allowed per flood window before reads are suspended.
    /// 0 disables flood control.
    pub flood_commands: u16,
    /// How long an unregistered connection may idle before it is dropped.
    pub login_timeout: Duration,
    /// Interval between periodic throughput summaries.
    pub stats_interval: Duration,
    /// Interval between pings sent on server links.
    pub ping_interval: Duration,
    /// Max simultaneous connections accepted by the reactor.
    pub max_connections: usize,
    /// Name this server announces on links and in stats replies.
    pub server_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_payload: 2048,
            client_queue_limit: 96 * 1024,
            server_queue_limit: 1024 * 1024,
            compression_level: 6,
            server_write_chunk: 0,
            compress_batch_target: 16 * 1024,
            flood_window: Duration::from_secs(100),
            flood_commands: 0,
            login_timeout: Duration::from_secs(60),
            stats_interval: Duration::from_secs(60),
            ping_interval: Duration::from_secs(600),
            max_connections: 1024,
            server_name: "wirehub".to_owned(),
        }
    }
}

impl Config {
    /// Returns true if flood control is active for this configuration.
    pub fn flood_enabled(&self) -> bool {
        self.flood_commands > 0 && !self.flood_window.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flood_control_disabled() {
        let config = Config::default();
        assert!(!config.flood_enabled());
    }

    #[test]
    fn test_flood_control_requires_window_and_count() {
        let mut config = Config::default();
        config.flood_commands = 10;
        assert!(config.flood_enabled());
        config.flood_window = Duration::ZERO;
        assert!(!config.flood_enabled());
    }
}
