use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Reachability test for a proxy port.
///
/// Used when the daemon cannot list its ports. A firewall in front of the node
/// turns this into a best-effort answer: a filtered port reads as absent and a
/// port held by another process reads as present.
#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_open(&self, ip: IpAddr, port: u16, timeout: Duration) -> bool;
}

/// Plain TCP connect.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

#[async_trait]
impl PortProbe for TcpProbe {
    async fn is_open(&self, ip: IpAddr, port: u16, timeout: Duration) -> bool {
        let addr = SocketAddr::new(ip, port);
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "Port is not accessible.");
                false
            }
            Err(_) => {
                debug!(addr = %addr, "Port probe timed out.");
                false
            }
        }
    }
}
