//! Request scheduler
//!
//! One coordinating loop owns both queues. Submitters and workers talk to
//! it over channels only:
//!
//! - `push` sends each request with an acknowledgement channel and waits
//!   until the loop has queued it, so fan-out from parse rules stalls
//!   when the loop is busy
//! - `pull` registers a one-shot slot on the ready channel; the loop fills
//!   it with the candidate it is currently offering
//!
//! The candidate is taken from the priority queue before the normal queue
//! and both queues are FIFO. While a candidate is pending the loop keeps
//! accepting submissions, so nothing pushed is lost.

use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collect::{CrawlError, Request};

type Submission = (Request, oneshot::Sender<()>);

/// Handle to a running scheduler loop
///
/// Cheap to clone; every clone talks to the same loop.
#[derive(Clone)]
pub struct RequestScheduler {
    submit_tx: mpsc::Sender<Submission>,
    ready_tx: mpsc::Sender<oneshot::Sender<Request>>,
}

impl RequestScheduler {
    /// Start the scheduler loop on the current runtime
    ///
    /// The loop exits when `cancel` fires or every handle is dropped.
    pub fn spawn(cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (submit_tx, submit_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = mpsc::channel(64);

        let state = SchedulerLoop {
            submit_rx,
            ready_rx,
            priority: VecDeque::new(),
            normal: VecDeque::new(),
            candidate: None,
        };
        let handle = tokio::spawn(state.run(cancel));

        (Self { submit_tx, ready_tx }, handle)
    }

    /// Submit requests, waiting until each one is queued
    pub async fn push<I>(&self, requests: I) -> Result<(), CrawlError>
    where
        I: IntoIterator<Item = Request>,
    {
        for request in requests {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.submit_tx
                .send((request, ack_tx))
                .await
                .map_err(|_| CrawlError::SchedulerClosed)?;
            ack_rx.await.map_err(|_| CrawlError::SchedulerClosed)?;
        }
        Ok(())
    }

    /// Wait for the next offered request
    pub async fn pull(&self) -> Result<Request, CrawlError> {
        let (slot_tx, slot_rx) = oneshot::channel();
        self.ready_tx
            .send(slot_tx)
            .await
            .map_err(|_| CrawlError::SchedulerClosed)?;
        slot_rx.await.map_err(|_| CrawlError::SchedulerClosed)
    }
}

struct SchedulerLoop {
    submit_rx: mpsc::Receiver<Submission>,
    ready_rx: mpsc::Receiver<oneshot::Sender<Request>>,
    priority: VecDeque<Request>,
    normal: VecDeque<Request>,
    candidate: Option<Request>,
}

impl SchedulerLoop {
    async fn run(mut self, cancel: CancellationToken) {
        tracing::debug!("Scheduler loop started");

        loop {
            if self.candidate.is_none() {
                self.candidate = self.priority.pop_front().or_else(|| self.normal.pop_front());
                crate::metrics::update_queue_depth(self.priority.len(), self.normal.len());
            }

            if self.candidate.is_some() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    submission = self.submit_rx.recv() => match submission {
                        Some(submission) => self.enqueue(submission),
                        None => break,
                    },
                    slot = self.ready_rx.recv() => match slot {
                        Some(slot) => self.offer(slot),
                        None => break,
                    },
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    submission = self.submit_rx.recv() => match submission {
                        Some(submission) => self.enqueue(submission),
                        None => break,
                    },
                }
            }
        }

        tracing::debug!(
            pending = self.priority.len() + self.normal.len() + usize::from(self.candidate.is_some()),
            "Scheduler loop stopped"
        );
    }

    fn enqueue(&mut self, (request, ack): Submission) {
        if request.priority > 0 {
            self.priority.push_back(request);
        } else {
            self.normal.push_back(request);
        }
        // Submitter may have given up waiting; the request stays queued
        let _ = ack.send(());
    }

    fn offer(&mut self, slot: oneshot::Sender<Request>) {
        let Some(request) = self.candidate.take() else {
            return;
        };
        // A worker that went away leaves the candidate in place
        if let Err(request) = slot.send(request) {
            self.candidate = Some(request);
        }
    }
}
