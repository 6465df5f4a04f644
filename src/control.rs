//! # Control Endpoint
//!
//! Line-oriented TCP bridge between local tools (`swarm-cli`) and a node's
//! router. Each connection becomes a session with its own mailbox
//! `/dswarm/<node>/client/<n>`:
//!
//! - inbound lines are decoded, stamped with the session address as
//!   `maddr_from` and routed like any locally produced envelope, so replies
//!   find their way back to this session whichever brain sends them;
//! - everything delivered to the session mailbox is written back as one JSON
//!   line.
//!
//! Malformed lines are logged and skipped. The mailbox is removed when the
//! session ends.

use std::io;
use std::net::SocketAddr;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::messages::{Address, Envelope};
use crate::router::Router;

pub struct ControlServer {
    listener: TcpListener,
    router: Router,
}

impl ControlServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A, router: Router) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind control endpoint")?;
        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) {
        let node = self.router.local_id();
        if let Ok(addr) = self.listener.local_addr() {
            info!(node = %node.short(), addr = %addr, "control endpoint listening");
        }

        let mut next_session: u64 = 0;
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    next_session += 1;
                    let address = Address::client(node, next_session);
                    debug!(session = %address, peer = %peer, "control session opened");
                    let router = self.router.clone();
                    tokio::spawn(serve_session(stream, router, address, cancel.clone()));
                }
                Err(e) => warn!(error = %e, "control accept failed"),
            }
        }
        debug!(node = %node.short(), "control endpoint stopped");
    }
}

async fn serve_session(
    stream: TcpStream,
    router: Router,
    address: Address,
    cancel: CancellationToken,
) {
    let mut mailbox = router.register(address.clone()).await;
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Envelope::decode(line.as_bytes()) {
                        Ok(mut envelope) => {
                            envelope.maddr_from = address.clone();
                            router.send(envelope).await;
                        }
                        Err(e) => {
                            warn!(session = %address, error = %e, "skipping malformed control line")
                        }
                    }
                }
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!(session = %address, error = %e, "skipping undecodable control line");
                }
                Err(e) => {
                    debug!(session = %address, error = %e, "control read failed");
                    break;
                }
            },
            envelope = mailbox.recv() => {
                let Some(envelope) = envelope else { break };
                let mut line = envelope.encode();
                line.push(b'\n');
                if let Err(e) = write.write_all(&line).await {
                    debug!(session = %address, error = %e, "control write failed");
                    break;
                }
            }
        }
    }

    router.unregister(&address).await;
    debug!(session = %address, "control session closed");
}
