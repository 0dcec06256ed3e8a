// Copyright 2025 The Drasi Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cooperative cancellation shared by every device task of a run.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Create a connected trigger/signal pair.
pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx: Arc::new(tx) },
        Shutdown { rx, deadline: None },
    )
}

/// Fires the cancellation seen by every clone of the paired [`Shutdown`].
#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal: set by a [`ShutdownTrigger`] or by an optional deadline.
#[derive(Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    deadline: Option<Instant>,
}

impl Shutdown {
    /// A signal that only a deadline can fire.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Shutdown { rx, deadline: None }
    }

    /// Also fire once `after` has elapsed. Keeps the earlier of two deadlines.
    pub fn with_deadline(mut self, after: Duration) -> Self {
        let at = Instant::now() + after;
        self.deadline = Some(self.deadline.map_or(at, |existing| existing.min(at)));
        self
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.deadline.is_some_and(|at| Instant::now() >= at)
    }

    /// Resolves once cancelled. Pends forever if neither trigger nor deadline can fire.
    pub async fn cancelled(&mut self) {
        let deadline = self.deadline;
        let triggered = async {
            if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
                future::pending::<()>().await;
            }
        };
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = triggered => {}
                    _ = sleep_until(at) => {}
                }
            }
            None => triggered.await,
        }
    }
}
