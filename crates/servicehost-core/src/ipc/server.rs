//! Accept loop for framed connections.
//!
//! Each accepted stream becomes a [`Connection`] handed to the listener
//! *without* a running receive task. Whoever takes the connection starts it
//! by calling `set_listener`, so no frame can arrive before a listener
//! exists.

use super::connection::Connection;
use super::transport::IpcListener;
use crate::Result;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Receives newly accepted connections on the accept task.
pub trait ServerListener: Send + Sync + 'static {
    fn got_connection(&self, connection: Connection);
}

/// Listening endpoint. Dropping the server stops the accept loop.
pub struct Server {
    address: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl Server {
    /// Bind `address` and start accepting.
    pub fn start(address: &str, listener: Arc<dyn ServerListener>) -> Result<Self> {
        let ipc_listener = IpcListener::bind(address)?;
        info!("IPC server listening on {}", address);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task_handle = tokio::spawn(Self::accept_loop(
            address.to_string(),
            ipc_listener,
            listener,
            shutdown_rx,
        ));

        Ok(Self {
            address: address.to_string(),
            shutdown_tx: Some(shutdown_tx),
            task_handle: Some(task_handle),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Stop accepting and wait for the accept loop to exit. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task_handle.take() {
            let _ = task.await;
        }
    }

    async fn accept_loop(
        address: String,
        mut ipc_listener: IpcListener,
        listener: Arc<dyn ServerListener>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown_rx => {
                    debug!("IPC server on {} shutting down", address);
                    break;
                }
                accepted = ipc_listener.accept() => match accepted {
                    Ok(stream) => {
                        let connection = Connection::from_stream(stream);
                        debug!("accepted connection {} on {}", connection.id(), address);
                        listener.got_connection(connection);
                    }
                    Err(e) => {
                        error!("IPC accept error on {}: {}", address, e);
                        break;
                    }
                },
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::transport::ephemeral_address;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        connections: Mutex<Vec<Connection>>,
    }

    impl ServerListener for Collect {
        fn got_connection(&self, connection: Connection) {
            self.connections.lock().unwrap().push(connection);
        }
    }

    #[tokio::test]
    async fn test_server_hands_off_connections() {
        let address = ephemeral_address();
        let collect = Arc::new(Collect::default());
        let mut server = Server::start(&address, collect.clone()).unwrap();

        let _client_a = Connection::connect(&address).await.unwrap();
        let _client_b = Connection::connect(&address).await.unwrap();

        for _ in 0..50 {
            if collect.connections.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(collect.connections.lock().unwrap().len(), 2);

        server.stop().await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_connect_after_stop_fails() {
        let address = ephemeral_address();
        let mut server = Server::start(&address, Arc::new(Collect::default())).unwrap();
        server.stop().await;
        drop(server);

        assert!(Connection::connect(&address).await.is_err());
    }
}
