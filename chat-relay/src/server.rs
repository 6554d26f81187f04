use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream, ToSocketAddrs},
    select,
};
use tracing::{info, warn};

use crate::{registry::Registry, session::Session};

/// Accepts connections and runs one [`Session`] task per client, all sharing
/// a single [`Registry`].
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
        }
    }

    /// Binds `addr`. Failure here is fatal for the process.
    pub async fn bind<A>(addr: A) -> Result<Self>
    where
        A: ToSocketAddrs + std::fmt::Display,
    {
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `shutdown` resolves. Sessions already
    /// running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, registry),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, registry: &Arc<Registry>) {
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let (reader, writer) = stream.into_split();
        let session = Session::new(registry, BufReader::new(reader), writer, Some(peer));
        if let Err(err) = session.run().await {
            info!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}
