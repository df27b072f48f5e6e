//! Logging macros used by `PeerSession`.
//!
//! The first argument is the session (`self`), followed by the format string
//! and its arguments. Each line is prefixed with the peer's address, so that
//! the log of a single session can be filtered out of the interleaved logs of
//! all sessions of a torrent.

macro_rules! peer_log {
    ($level:ident, $self:ident, $($arg:tt)*) => ({
        ::log::$level!("[{}] {}", $self.addr, format_args!($($arg)*));
    })
}

macro_rules! peer_warn {
    ($self:ident, $($arg:tt)*) => (peer_log!(warn, $self, $($arg)*))
}

macro_rules! peer_info {
    ($self:ident, $($arg:tt)*) => (peer_log!(info, $self, $($arg)*))
}

macro_rules! peer_debug {
    ($self:ident, $($arg:tt)*) => (peer_log!(debug, $self, $($arg)*))
}

macro_rules! peer_trace {
    ($self:ident, $($arg:tt)*) => (peer_log!(trace, $self, $($arg)*))
}
