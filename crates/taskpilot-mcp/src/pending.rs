//! In-flight request bookkeeping

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};

use crate::error::McpError;
use crate::protocol::JsonRpcResponse;

pub(crate) type Reply = Result<JsonRpcResponse, McpError>;

/// Maps request ids to the waiter that will receive the response
#[derive(Default)]
pub(crate) struct PendingRequests {
    waiters: Mutex<HashMap<i64, oneshot::Sender<Reply>>>,
    drained: Notify,
}

impl PendingRequests {
    pub fn register(&self, id: i64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        rx
    }

    /// Deliver a response. Returns false when nobody is waiting for `id`.
    pub fn complete(&self, id: i64, response: JsonRpcResponse) -> bool {
        match self.take(id) {
            Some(tx) => {
                // The caller may have given up already
                let _ = tx.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Forget a waiter without answering it
    pub fn cancel(&self, id: i64) {
        self.take(id);
    }

    /// Answer every waiter with `error`, returning how many there were
    pub fn fail_all(&self, error: McpError) -> usize {
        let drained: Vec<_> = self.waiters.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        self.drained.notify_waiters();
        count
    }

    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Wait up to `grace` for all in-flight requests to finish.
    /// Returns true if the map emptied in time.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.len() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(grace, wait).await.is_ok()
    }

    fn take(&self, id: i64) -> Option<oneshot::Sender<Reply>> {
        let mut waiters = self.waiters.lock();
        let tx = waiters.remove(&id);
        let now_empty = waiters.is_empty();
        drop(waiters);
        if tx.is_some() && now_empty {
            self.drained.notify_waiters();
        }
        tx
    }
}

/// Removes the waiter for `id` when the request future is dropped
pub(crate) struct PendingGuard<'a> {
    pub pending: &'a PendingRequests,
    pub id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.id);
    }
}
