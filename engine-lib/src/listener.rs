//! Binds a TCP port and accepts connections until terminated. Every accepted
//! stream gets wrapped into a framed socket and handed to the role specific
//! acceptor of the owning endpoint.

use crate::error::EngineResult;
use crate::framed_socket::FramedSocket;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Listener {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl Listener {
    /// Binds the port and starts accepting. A failed acceptor invocation only
    /// costs that one connection, the loop keeps running. Port 0 picks an
    /// ephemeral port, see [`local_addr`](Self::local_addr).
    pub async fn spawn<A, F>(port: u16, acceptor: A) -> EngineResult<Listener>
    where
        A: Fn(FramedSocket) -> F + Send + Sync + 'static,
        F: Future<Output = EngineResult<()>> + Send + 'static,
    {
        let tcp_listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = tcp_listener.local_addr()?;
        let (stop, mut stop_rx) = watch::channel(false);

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    accepted = tcp_listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!(%peer, "accepted connection");
                                let socket = FramedSocket::new(stream);
                                let pending = acceptor(socket);
                                tokio::spawn(async move {
                                    if let Err(err) = pending.await {
                                        // Dropping the socket closes the connection.
                                        tracing::debug!(%err, "connection rejected by acceptor");
                                    }
                                });
                            }
                            Err(err) => {
                                tracing::warn!(?err, "accept failed");
                            }
                        }
                    }
                }
            }
        });

        Ok(Listener {
            local_addr,
            stop,
            accept_task,
        })
    }

    /// The address we really listen on. Interesting when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the accept loop and releases the port. Acceptor invocations that
    /// are already in flight run to completion on their own tasks. A new
    /// listener may be spawned on the same port afterwards.
    pub async fn terminate(self) {
        self.stop.send_replace(true);
        let _ = self.accept_task.await;
    }
}
