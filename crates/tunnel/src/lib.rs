//! Multiplexed TCP tunnel over Wisp framing.
//!
//! One [`session::TunnelSession`] per WebSocket connection. The session
//! parses frames, enforces the Apple-host allowlist on CONNECT, owns the
//! per-stream TCP sockets, and bridges bytes both directions. The payload is
//! opaque TLS; the tunnel never terminates or inspects it.

pub mod allowlist;
pub mod dialer;
pub mod protocol;
pub mod session;

pub use dialer::{Dialer, TcpDialer};
pub use protocol::{CloseReason, Frame, FrameError, STREAM_TYPE_TCP};
pub use session::TunnelSession;

/// Flow-control credit granted at session open and on each successful
/// CONNECT (128 KiB). The tunnel never meters inbound data beyond this.
pub const INITIAL_STREAM_CREDIT: u32 = 128 * 1024;

/// The only port the tunnel will dial.
pub const ALLOWED_PORT: u16 = 443;
