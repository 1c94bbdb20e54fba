//! Per-job completion signalling.
//!
//! A submitter subscribes to a job id and gets a one-shot channel. The queue
//! calls [`CompletionNotifier::notify`] after a terminal transition has been
//! committed; that drains every subscriber of the job, so a given subscription
//! is signalled at most once. Subscriptions clean themselves up on drop, which
//! covers both expired waits and HTTP handlers whose client went away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::jobs::model::Job;

type Waiters = HashMap<Uuid, Vec<oneshot::Sender<Job>>>;

#[derive(Clone, Default)]
pub struct CompletionNotifier {
    waiters: Arc<Mutex<Waiters>>,
}

impl CompletionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.entry(job_id).or_default().push(tx);
        }
        Subscription {
            job_id,
            rx,
            notifier: self.clone(),
        }
    }

    /// Wake every subscriber of `job.id` with the terminal snapshot. Returns how
    /// many subscribers received it. A second call for the same job finds no
    /// one left to wake.
    pub fn notify(&self, job: &Job) -> usize {
        let senders = match self.waiters.lock() {
            Ok(mut waiters) => waiters.remove(&job.id).unwrap_or_default(),
            Err(_) => {
                tracing::error!(job_id = %job.id, "completion notifier lock poisoned");
                return 0;
            }
        };

        senders
            .into_iter()
            .filter_map(|tx| tx.send(job.clone()).ok())
            .count()
    }

    pub fn is_waiting(&self, job_id: Uuid) -> bool {
        self.waiters
            .lock()
            .map(|w| w.contains_key(&job_id))
            .unwrap_or(false)
    }

    /// Number of job ids with at least one live subscriber.
    pub fn pending(&self) -> usize {
        self.waiters.lock().map(|w| w.len()).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn poison(&self) {
        let waiters = self.waiters.clone();
        let _ = std::thread::spawn(move || {
            let _guard = waiters.lock();
            panic!("poisoning completion notifier");
        })
        .join();
    }

    fn prune(&self, job_id: Uuid) {
        if let Ok(mut waiters) = self.waiters.lock() {
            if let Some(senders) = waiters.get_mut(&job_id) {
                senders.retain(|tx| !tx.is_closed());
                if senders.is_empty() {
                    waiters.remove(&job_id);
                }
            }
        }
    }
}

pub struct Subscription {
    job_id: Uuid,
    rx: oneshot::Receiver<Job>,
    notifier: CompletionNotifier,
}

impl Subscription {
    /// Resolves with the terminal snapshot, or `None` if the notifier was
    /// dropped without signalling.
    pub async fn recv(&mut self) -> Option<Job> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        self.notifier.prune(self.job_id);
    }
}
