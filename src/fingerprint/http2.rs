//! HTTP/2 fingerprint configuration (SETTINGS frame and header order).

/// HTTP/2 SETTINGS for fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Http2Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    /// Connection-level window, announced with a WINDOW_UPDATE after SETTINGS.
    pub initial_connection_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    /// Regular header order for HTTP/2 requests. Falls back to the request's
    /// header order when `None`.
    pub header_order: Option<Vec<String>>,
}

impl Default for Http2Settings {
    fn default() -> Self {
        // Chrome defaults
        Self {
            header_table_size: 65536,
            enable_push: false,
            max_concurrent_streams: 1000,
            initial_window_size: 6291456,
            initial_connection_window_size: 15728640,
            max_frame_size: 16384,
            max_header_list_size: 262144,
            header_order: None,
        }
    }
}

impl Http2Settings {
    /// Set the HTTP/2 header order.
    pub fn header_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.header_order = Some(order.into_iter().map(Into::into).collect());
        self
    }
}
