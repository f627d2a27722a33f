//! Session configuration, built the way the teacher's `Config`/`ConfigBuilder`
//! pair is built: sensible RFC 7540 defaults, validated once at `build()`
//! rather than scattered through the session.

use std::time::Duration;

use crate::error::SessionApiError;

pub const DEFAULT_WINDOW_SIZE: i64 = 65_535;
pub const DEFAULT_WRITE_THRESHOLD: usize = 32 * 1024;
/// Sentinel meaning "unbounded" for `max_local_streams` / `max_remote_streams`.
pub const UNBOUNDED: i64 = -1;

#[derive(Debug, Clone)]
pub struct Config {
    pub initial_window_size: i64,
    pub max_local_streams: i64,
    pub max_remote_streams: i64,
    pub write_threshold: usize,
    pub stream_idle_timeout: Duration,
    pub push_enabled: bool,
    pub header_table_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_local_streams: UNBOUNDED,
            max_remote_streams: UNBOUNDED,
            write_threshold: DEFAULT_WRITE_THRESHOLD,
            stream_idle_timeout: Duration::from_secs(60),
            push_enabled: true,
            header_table_size: 4096,
            max_frame_size: 16_384,
            max_header_list_size: u32::MAX,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn initial_window_size(mut self, size: i64) -> Self {
        self.config.initial_window_size = size;
        self
    }

    pub fn max_local_streams(mut self, max: i64) -> Self {
        self.config.max_local_streams = max;
        self
    }

    pub fn max_remote_streams(mut self, max: i64) -> Self {
        self.config.max_remote_streams = max;
        self
    }

    pub fn write_threshold(mut self, bytes: usize) -> Self {
        self.config.write_threshold = bytes;
        self
    }

    pub fn stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.stream_idle_timeout = timeout;
        self
    }

    pub fn push_enabled(mut self, enabled: bool) -> Self {
        self.config.push_enabled = enabled;
        self
    }

    pub fn header_table_size(mut self, size: u32) -> Self {
        self.config.header_table_size = size;
        self
    }

    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn max_header_list_size(mut self, size: u32) -> Self {
        self.config.max_header_list_size = size;
        self
    }

    pub fn build(self) -> Result<Config, SessionApiError> {
        let c = &self.config;
        if c.initial_window_size < 0 || c.initial_window_size > i32::MAX as i64 {
            return Err(SessionApiError::IllegalArgument(format!(
                "initial_window_size out of range: {}",
                c.initial_window_size
            )));
        }
        if !(16_384..=16_777_215).contains(&c.max_frame_size) {
            return Err(SessionApiError::IllegalArgument(format!(
                "max_frame_size out of range: {}",
                c.max_frame_size
            )));
        }
        Ok(self.config)
    }
}
