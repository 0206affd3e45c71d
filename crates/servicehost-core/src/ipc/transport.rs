//! Platform plumbing for local IPC endpoints.
//!
//! Addresses are filesystem paths to Unix-domain sockets on unix and
//! `\\.\pipe\...` names on Windows. Everything above this module sees only
//! [`IpcStream`] and [`IpcListener`].

use crate::config::IpcConfig;
use crate::Result;
use tokio::io::{AsyncRead, AsyncWrite};

/// A connected, bidirectional local byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {}

pub type IpcStream = Box<dyn AsyncStream>;

/// Generate a fresh, unguessable local address.
pub fn ephemeral_address() -> String {
    let name = format!("{}{}", IpcConfig::EPHEMERAL_PREFIX, uuid::Uuid::new_v4().simple());
    platform::address_for(&name)
}

/// The platform address for a well-known endpoint name.
pub fn named_address(name: &str) -> String {
    platform::address_for(name)
}

/// Connect to a listening endpoint.
pub async fn connect(address: &str) -> Result<IpcStream> {
    platform::connect(address).await
}

pub use platform::IpcListener;

#[cfg(unix)]
mod platform {
    use super::IpcStream;
    use crate::{HostError, Result};
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};

    pub fn address_for(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("{}.sock", name))
            .to_string_lossy()
            .into_owned()
    }

    pub async fn connect(address: &str) -> Result<IpcStream> {
        let stream = UnixStream::connect(address)
            .await
            .map_err(|e| HostError::io_with_path(e, address))?;
        Ok(Box::new(stream))
    }

    /// Listening Unix-domain socket. The socket file is removed on drop.
    pub struct IpcListener {
        listener: UnixListener,
        path: PathBuf,
    }

    impl IpcListener {
        pub fn bind(address: &str) -> Result<Self> {
            let path = PathBuf::from(address);
            // A stale socket file from a dead process blocks bind.
            if path.exists() {
                let _ = std::fs::remove_file(&path);
            }
            let listener =
                UnixListener::bind(&path).map_err(|e| HostError::io_with_path(e, &path))?;
            Ok(Self { listener, path })
        }

        pub async fn accept(&mut self) -> Result<IpcStream> {
            let (stream, _) = self.listener.accept().await?;
            Ok(Box::new(stream))
        }
    }

    impl Drop for IpcListener {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::IpcStream;
    use crate::{HostError, Result};
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    pub fn address_for(name: &str) -> String {
        format!(r"\\.\pipe\{}", name)
    }

    pub async fn connect(address: &str) -> Result<IpcStream> {
        let client = ClientOptions::new()
            .open(address)
            .map_err(|e| HostError::io_with_path(e, address))?;
        Ok(Box::new(client))
    }

    /// Named pipe server. A fresh pipe instance is created after each accept.
    pub struct IpcListener {
        address: String,
        next: NamedPipeServer,
    }

    impl IpcListener {
        pub fn bind(address: &str) -> Result<Self> {
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(address)
                .map_err(|e| HostError::io_with_path(e, address))?;
            Ok(Self {
                address: address.to_string(),
                next,
            })
        }

        pub async fn accept(&mut self) -> Result<IpcStream> {
            self.next.connect().await?;
            let fresh = ServerOptions::new().create(&self.address)?;
            let connected = std::mem::replace(&mut self.next, fresh);
            Ok(Box::new(connected))
        }
    }
}
