//! Inbound connection handling
//!
//! A dedicated listener task accepts connections; each accepted stream gets
//! its own short-lived task that runs the handshake and dispatches inbound
//! messages (`incoming`).

mod incoming;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::peer::Peer;

impl Peer {
    /// Accept inbound connections until the running flag drops.
    pub(crate) async fn run_listener(self: Arc<Self>, listener: TcpListener) {
        loop {
            if !*self.running.read().await {
                break;
            }
            let accepted = tokio::select! {
                result = listener.accept() => result,
                _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let peer = self.clone();
                    tokio::spawn(async move {
                        peer.handle_inbound(stream, remote).await;
                    });
                }
                Err(e) => {
                    debug!(error = %e, "accept failed");
                }
            }
        }
        info!("listener stopped");
    }
}
