//! SOCKS5 proxy connector.
//!
//! Attach a [`Socks5Config`] to [`crate::Config::socks5`] to route every
//! connection through a SOCKS5 proxy.
//!
//! # Example
//! ```rust,no_run
//! use mtwire_client::{Config, Socks5Config};
//!
//! let cfg = Config {
//!     socks5: Some(Socks5Config::new("127.0.0.1:1080")),
//!     ..Default::default()
//! };
//! ```

use std::io;

use async_trait::async_trait;
use tokio_socks::tcp::Socks5Stream;

use crate::transport::{BoxedStream, Connector};

/// SOCKS5 proxy configuration.
#[derive(Clone, Debug)]
pub struct Socks5Config {
    /// Host:port of the SOCKS5 proxy server.
    pub proxy_addr: String,
    /// Optional username and password for proxy authentication.
    pub auth: Option<(String, String)>,
}

impl Socks5Config {
    /// Create an unauthenticated SOCKS5 config.
    pub fn new(proxy_addr: impl Into<String>) -> Self {
        Self { proxy_addr: proxy_addr.into(), auth: None }
    }

    /// Create a SOCKS5 config with username/password authentication.
    pub fn with_auth(
        proxy_addr: impl Into<String>,
        username:   impl Into<String>,
        password:   impl Into<String>,
    ) -> Self {
        Self {
            proxy_addr: proxy_addr.into(),
            auth: Some((username.into(), password.into())),
        }
    }
}

#[async_trait]
impl Connector for Socks5Config {
    async fn connect(&self, target: &str) -> io::Result<BoxedStream> {
        tracing::info!("[socks5] connecting via {} to {target}", self.proxy_addr);
        let stream = match &self.auth {
            None => Socks5Stream::connect(self.proxy_addr.as_str(), target)
                .await
                .map_err(io::Error::other)?,
            Some((user, pass)) => Socks5Stream::connect_with_password(
                self.proxy_addr.as_str(),
                target,
                user.as_str(),
                pass.as_str(),
            )
            .await
            .map_err(io::Error::other)?,
        };
        let stream = stream.into_inner();
        stream.set_nodelay(true)?;
        tracing::debug!("[socks5] tunnel to {target} established");
        Ok(Box::new(stream))
    }
}
