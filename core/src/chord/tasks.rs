//! Ring maintenance tasks
//!
//! Three periodic loops per peer: stabilize, fix one finger, check the
//! predecessor. Each runs until the shared running flag drops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use super::Chord;

impl Chord {
    /// Run the stabilization loop.
    pub(crate) async fn run_stabilize(self: Arc<Self>, running: Arc<RwLock<bool>>, interval: Duration) {
        loop {
            if !*running.read().await {
                break;
            }
            tokio::time::sleep(interval).await;
            self.stabilize_once().await;
        }
        info!("stabilize loop stopped");
    }

    /// Run the finger refresh loop.
    pub(crate) async fn run_fix_fingers(
        self: Arc<Self>,
        running: Arc<RwLock<bool>>,
        interval: Duration,
    ) {
        loop {
            if !*running.read().await {
                break;
            }
            tokio::time::sleep(interval).await;
            self.fix_fingers_once().await;
        }
        info!("fix-fingers loop stopped");
    }

    /// Run the predecessor liveness loop.
    pub(crate) async fn run_check_predecessor(
        self: Arc<Self>,
        running: Arc<RwLock<bool>>,
        interval: Duration,
    ) {
        loop {
            if !*running.read().await {
                break;
            }
            tokio::time::sleep(interval).await;
            self.check_predecessor_once().await;
        }
        info!("check-predecessor loop stopped");
    }
}
