//! Asynchronous name resolution seam for the relay's server side

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

pub type ResolveFuture = Pin<Box<dyn Future<Output = io::Result<SocketAddr>> + Send>>;

/// Resolves a hostname to one socket address. Called from the relay
/// for every datagram addressed to a domain target; implementations
/// are expected to cache.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, host: String, port: u16) -> ResolveFuture;
}

/// System resolver via the runtime's `getaddrinfo` integration.
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: String, port: u16) -> ResolveFuture {
        Box::pin(async move {
            tokio::net::lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn resolves_ip_literals() {
        let addr = SystemResolver.resolve("127.0.0.1".into(), 53).await.unwrap();
        assert_eq!(addr, SocketAddr::from((Ipv4Addr::LOCALHOST, 53)));
    }
}
