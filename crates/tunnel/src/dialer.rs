//! TCP dialing seam.

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Opens the TCP leg of a tunnel stream.
///
/// Production uses [`TcpDialer`]; tests substitute a dialer that connects to
/// a loopback listener so admission and bridging can be exercised without
/// reaching Apple.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn connect(&self, hostname: &str, port: u16) -> std::io::Result<TcpStream>;
}

/// Plain TCP dialer. The connection is never TLS: the tunneled payload is
/// already TLS negotiated by the browser.
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn connect(&self, hostname: &str, port: u16) -> std::io::Result<TcpStream> {
        TcpStream::connect((hostname, port)).await
    }
}
