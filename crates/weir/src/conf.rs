use std::time::Duration;

use weir_h2::Settings;

/// Per-connection configuration, for both HTTP/2 roles.
#[derive(Debug, Clone)]
pub struct SessionConf {
    /// How many streams the peer may have open at once. Announced as
    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: u32,

    /// Initial receive window of every stream.
    pub initial_window_size: u32,

    /// Receive window of the connection as a whole. Anything above the
    /// protocol's 65535 is granted with a WINDOW_UPDATE right after the
    /// preface.
    pub connection_window_size: u32,

    /// Largest frame payload we accept.
    pub max_frame_size: u32,

    /// Size of the HPACK dynamic table our decoder keeps.
    pub header_table_size: u32,

    /// Largest field section we accept, counting 32 octets of overhead per
    /// field.
    pub max_header_list_size: u32,

    /// Header blocks larger than this are split into CONTINUATION frames.
    /// `None` means the peer's max frame size.
    pub max_header_fragment_size: Option<usize>,

    /// Streams with no activity for this long go through
    /// `StreamListener::on_idle_timeout`.
    pub stream_idle_timeout: Option<Duration>,

    /// Whether we accept PUSH_PROMISE frames (clients only).
    pub enable_push: bool,
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 128,
            initial_window_size: 65535,
            connection_window_size: 65535,
            max_frame_size: 16384,
            header_table_size: 4096,
            max_header_list_size: 16 * 1024,
            max_header_fragment_size: None,
            stream_idle_timeout: Some(Duration::from_secs(30)),
            enable_push: false,
        }
    }
}

impl SessionConf {
    /// The settings we announce to the peer.
    pub fn local_settings(&self) -> Settings {
        Settings {
            header_table_size: self.header_table_size,
            enable_push: self.enable_push,
            max_concurrent_streams: Some(self.max_concurrent_streams),
            initial_window_size: self.initial_window_size.min(Settings::MAX_INITIAL_WINDOW_SIZE),
            max_frame_size: self.max_frame_size.clamp(
                *Settings::MAX_FRAME_SIZE_ALLOWED_RANGE.start(),
                *Settings::MAX_FRAME_SIZE_ALLOWED_RANGE.end(),
            ),
            max_header_list_size: self.max_header_list_size,
        }
    }
}
