pub mod fabric;
pub mod namespace;
pub mod tap;
pub mod types;

pub use fabric::{Fabric, Segment, Tap};
pub use namespace::Sandbox;
pub use types::*;

use std::net::SocketAddr;

use tokio::process::Command;

use crate::error::{Error, Result};

/// Something that can reach guest addresses: either the host itself or a
/// sandbox the guests live in.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// A command whose child runs where the guests are reachable.
    fn command(&self, program: &str) -> Result<Command>;

    /// Open a TCP connection from where the guests are reachable.
    async fn dial(&self, addr: SocketAddr) -> Result<tokio::net::TcpStream>;
}

/// Dials from the host namespace.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDialer;

#[async_trait::async_trait]
impl Dialer for HostDialer {
    fn command(&self, program: &str) -> Result<Command> {
        Ok(Command::new(program))
    }

    async fn dial(&self, addr: SocketAddr) -> Result<tokio::net::TcpStream> {
        tokio::net::TcpStream::connect(addr)
            .await
            .map_err(|e| Error::resource(format!("connecting to {}", addr), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_dialer_connects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        HostDialer.dial(addr).await.unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_host_dialer_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = HostDialer.dial(addr).await.unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }
}
