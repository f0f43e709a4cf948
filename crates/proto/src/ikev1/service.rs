//! Async UDP service wrapper
//!
//! Pumps datagrams between a socket and the synchronous [`Engine`]:
//! received packets and due timers are fed in, the outbox is flushed
//! after every step. The engine itself never touches the network.

use super::engine::Engine;
use super::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::debug;

/// UDP front end for one IKE engine
///
/// # Example
///
/// ```rust,no_run
/// use oakley_proto::ikev1::engine::{Engine, EngineConfig};
/// use oakley_proto::ikev1::crypto::XorDhBackend;
/// use oakley_proto::ikev1::service::IkeService;
/// # use oakley_platform::{ChildSaInstall, IpsecInstaller, OakleyResult};
/// # struct NullKernel;
/// # impl IpsecInstaller for NullKernel {
/// #     fn install(&mut self, _sa: &ChildSaInstall) -> OakleyResult<()> { Ok(()) }
/// #     fn remove(&mut self, _spi: u32, _protocol: u8) -> OakleyResult<()> { Ok(()) }
/// # }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(
///         EngineConfig::default(),
///         Box::new(XorDhBackend::new()),
///         Box::new(NullKernel),
///     );
///     let service = IkeService::bind(engine, "0.0.0.0:500".parse()?).await?;
///     service.run().await?;
///     Ok(())
/// }
/// ```
pub struct IkeService {
    engine: Engine,
    socket: UdpSocket,
    local_addr: SocketAddr,
    recv_buffer: Vec<u8>,
}

impl IkeService {
    /// Bind the service to a local address
    ///
    /// # Errors
    ///
    /// Returns error when the address is in use or binding fails.
    pub async fn bind(engine: Engine, addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let local_addr = socket.local_addr().map_err(|e| Error::Io(e.to_string()))?;
        Ok(IkeService {
            engine,
            socket,
            local_addr,
            recv_buffer: vec![0u8; 65536],
        })
    }

    /// The bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Access the engine (configuration, initiations, introspection)
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    async fn flush(&mut self) -> Result<()> {
        for dgram in self.engine.drain_outbox() {
            debug!(to = %dgram.to, bytes = dgram.bytes.len(), "sending datagram");
            self.socket
                .send_to(&dgram.bytes, dgram.to)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
        }
        Ok(())
    }

    async fn sleep_until(deadline: Option<Instant>) {
        match deadline {
            Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Serve until the socket fails
    ///
    /// # Errors
    ///
    /// Returns error on socket I/O failure.
    pub async fn run(mut self) -> Result<()> {
        loop {
            self.flush().await?;

            let deadline = self.engine.next_timeout();
            tokio::select! {
                received = self.socket.recv_from(&mut self.recv_buffer) => {
                    let (len, peer) = received.map_err(|e| Error::Io(e.to_string()))?;
                    let data = self.recv_buffer[..len].to_vec();
                    self.engine
                        .handle_datagram(Instant::now(), peer, self.local_addr, &data);
                }
                _ = Self::sleep_until(deadline) => {
                    self.engine.handle_timeout(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::crypto::XorDhBackend;
    use crate::ikev1::engine::EngineConfig;
    use oakley_platform::{ChildSaInstall, IpsecInstaller, OakleyResult};

    struct NullKernel;

    impl IpsecInstaller for NullKernel {
        fn install(&mut self, _sa: &ChildSaInstall) -> OakleyResult<()> {
            Ok(())
        }

        fn remove(&mut self, _spi: u32, _protocol: u8) -> OakleyResult<()> {
            Ok(())
        }
    }

    fn test_engine() -> Engine {
        Engine::new(
            EngineConfig::default(),
            Box::new(XorDhBackend::new()),
            Box::new(NullKernel),
        )
    }

    #[tokio::test]
    async fn test_bind_ephemeral() {
        let service = IkeService::bind(test_engine(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(service.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let first = IkeService::bind(test_engine(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let result = IkeService::bind(test_engine(), first.local_addr()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_engine_access() {
        let mut service = IkeService::bind(test_engine(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(service.engine_mut().sas().is_empty());
    }
}
