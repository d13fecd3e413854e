//! Tunnel configuration
//!
//! One [`TunnelConfig`] is shared by the client and server sides. It is
//! immutable once built; the split threshold can still be changed per
//! channel at runtime through
//! [`ConfigurableTransport`](super::ConfigurableTransport).

use super::{Error, Result};
use std::num::NonZeroUsize;
use std::time::Duration;

/// Default fragment size for outbound transfers (16 KiB)
pub const DEFAULT_SPLIT_THRESHOLD: usize = 16 * 1024;

/// Default maximum hold time of a pending poll
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle time after which a tunnel is reclaimed
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default limit on a send-data body (1 MiB)
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024;

/// Default socket timeout for ordinary exchanges
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Default client connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default write buffer high water mark (64 KiB)
pub const DEFAULT_WRITE_BUFFER_HIGH_WATER_MARK: usize = 64 * 1024;

/// Default write buffer low water mark (32 KiB)
pub const DEFAULT_WRITE_BUFFER_LOW_WATER_MARK: usize = 32 * 1024;

/// Tunnel configuration (immutable after building)
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    split_threshold: NonZeroUsize,
    poll_timeout: Duration,
    idle_timeout: Duration,
    max_content_length: usize,
    io_timeout: Duration,
    connect_timeout: Duration,
    write_buffer_high_water_mark: usize,
    write_buffer_low_water_mark: usize,
}

impl TunnelConfig {
    pub fn builder() -> TunnelConfigBuilder {
        TunnelConfigBuilder::new()
    }

    /// Largest outbound fragment, in bytes
    pub fn split_threshold(&self) -> NonZeroUsize {
        self.split_threshold
    }

    /// How long a receive-data request is held before answering empty
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// How long a tunnel may see no requests before it is reclaimed
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Largest accepted send-data body, in bytes
    pub fn max_content_length(&self) -> usize {
        self.max_content_length
    }

    pub fn io_timeout(&self) -> Duration {
        self.io_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn write_buffer_high_water_mark(&self) -> usize {
        self.write_buffer_high_water_mark
    }

    pub fn write_buffer_low_water_mark(&self) -> usize {
        self.write_buffer_low_water_mark
    }

    /// Socket timeout for a poll exchange: the server may legitimately hold
    /// it for the whole poll timeout before answering.
    pub(crate) fn poll_exchange_timeout(&self) -> Duration {
        self.poll_timeout + self.io_timeout
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            split_threshold: NonZeroUsize::new(DEFAULT_SPLIT_THRESHOLD)
                .unwrap_or(NonZeroUsize::MIN),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            io_timeout: DEFAULT_IO_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_buffer_high_water_mark: DEFAULT_WRITE_BUFFER_HIGH_WATER_MARK,
            write_buffer_low_water_mark: DEFAULT_WRITE_BUFFER_LOW_WATER_MARK,
        }
    }
}

/// Builder for [`TunnelConfig`]
#[derive(Debug, Clone, Default)]
pub struct TunnelConfigBuilder {
    split_threshold: Option<usize>,
    poll_timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    max_content_length: Option<usize>,
    io_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    write_buffer_high_water_mark: Option<usize>,
    write_buffer_low_water_mark: Option<usize>,
}

impl TunnelConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn split_threshold(mut self, bytes: usize) -> Self {
        self.split_threshold = Some(bytes);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn max_content_length(mut self, bytes: usize) -> Self {
        self.max_content_length = Some(bytes);
        self
    }

    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn write_buffer_high_water_mark(mut self, bytes: usize) -> Self {
        self.write_buffer_high_water_mark = Some(bytes);
        self
    }

    pub fn write_buffer_low_water_mark(mut self, bytes: usize) -> Self {
        self.write_buffer_low_water_mark = Some(bytes);
        self
    }

    /// Validate and build the configuration
    pub fn build(self) -> Result<TunnelConfig> {
        let defaults = TunnelConfig::default();

        let split_threshold = match self.split_threshold {
            None => defaults.split_threshold,
            Some(bytes) => NonZeroUsize::new(bytes).ok_or_else(|| {
                Error::InvalidConfig("split threshold must be positive".to_string())
            })?,
        };

        let config = TunnelConfig {
            split_threshold,
            poll_timeout: self.poll_timeout.unwrap_or(defaults.poll_timeout),
            idle_timeout: self.idle_timeout.unwrap_or(defaults.idle_timeout),
            max_content_length: self
                .max_content_length
                .unwrap_or(defaults.max_content_length),
            io_timeout: self.io_timeout.unwrap_or(defaults.io_timeout),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            write_buffer_high_water_mark: self
                .write_buffer_high_water_mark
                .unwrap_or(defaults.write_buffer_high_water_mark),
            write_buffer_low_water_mark: self
                .write_buffer_low_water_mark
                .unwrap_or(defaults.write_buffer_low_water_mark),
        };

        if config.poll_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "poll timeout must be non-zero".to_string(),
            ));
        }
        if config.idle_timeout <= config.poll_timeout {
            return Err(Error::InvalidConfig(format!(
                "idle timeout ({:?}) must exceed poll timeout ({:?})",
                config.idle_timeout, config.poll_timeout
            )));
        }
        if config.max_content_length < config.split_threshold.get() {
            return Err(Error::InvalidConfig(format!(
                "max content length ({}) is smaller than the split threshold ({})",
                config.max_content_length, config.split_threshold
            )));
        }
        if config.write_buffer_low_water_mark > config.write_buffer_high_water_mark {
            return Err(Error::InvalidConfig(format!(
                "write buffer low water mark ({}) exceeds high water mark ({})",
                config.write_buffer_low_water_mark, config.write_buffer_high_water_mark
            )));
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TunnelConfig::builder().build().unwrap();
        assert_eq!(config.split_threshold().get(), DEFAULT_SPLIT_THRESHOLD);
        assert_eq!(config.poll_timeout(), DEFAULT_POLL_TIMEOUT);
        assert_eq!(
            config.poll_exchange_timeout(),
            DEFAULT_POLL_TIMEOUT + DEFAULT_IO_TIMEOUT
        );
    }

    #[test]
    fn test_rejects_zero_split_threshold() {
        let result = TunnelConfig::builder().split_threshold(0).build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_idle_shorter_than_poll() {
        let result = TunnelConfig::builder()
            .poll_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(5))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_inverted_watermarks() {
        let result = TunnelConfig::builder()
            .write_buffer_high_water_mark(10)
            .write_buffer_low_water_mark(20)
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_content_limit_below_fragment_size() {
        let result = TunnelConfig::builder()
            .split_threshold(4096)
            .max_content_length(1024)
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
