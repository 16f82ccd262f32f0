// Sniffer
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Supervised worker loops
//!
//! Every long-lived loop (scheduler queues, file workers, domain workers) runs
//! inside a supervisor task. A loop that returns normally is done; a loop that
//! panics is logged as a queue processor crash and relaunched after a delay,
//! until shutdown is signalled.

use sniffer_common::SnifferError;
use sniffer_core::runner::panic_message;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Shared end of a channel consumed by a relaunchable loop
///
/// The receiver lives outside the loop so that a relaunched loop picks up
/// where the crashed one stopped.
pub type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

pub fn shared<T>(receiver: mpsc::Receiver<T>) -> SharedReceiver<T> {
    Arc::new(Mutex::new(receiver))
}

/// Broadcast shutdown flag
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve once `shutdown` is set. Never resolves if the sender is gone
/// without having been triggered.
pub async fn triggered(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Relaunch counter shared with the supervisor, readable for status views
#[derive(Debug, Default)]
pub struct RestartCount(AtomicU64);

impl RestartCount {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Run `make_loop()` under supervision
pub fn spawn_supervised<F, Fut>(name: impl Into<String>, restart_delay: Duration, shutdown: &Shutdown, restarts: Arc<RestartCount>, make_loop: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let mut shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            match tokio::spawn(make_loop()).await {
                Ok(()) => {
                    debug!("Worker loop {} finished", name);
                    break;
                }
                Err(e) if e.is_panic() => {
                    let crash = SnifferError::QueueProcessorCrash {
                        queue: name.clone(),
                        reason: panic_message(e.into_panic().as_ref()),
                    };
                    restarts.0.fetch_add(1, Ordering::Relaxed);
                    error!("{}; relaunching in {:?}", crash, restart_delay);
                }
                Err(e) => {
                    debug!("Worker loop {} cancelled: {}", name, e);
                    break;
                }
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(restart_delay) => {}
                _ = triggered(&mut shutdown) => break,
            }
        }
    })
}
