//! Resolution bridge: one chunk subscription as a single-shot awaitable.
//!
//! The chunk table speaks callbacks. A `Settlement` turns the next (and
//! only) terminal transition of one chunk into something that can be polled
//! cooperatively with `try_outcome` or awaited from an external driver.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use trellis_core::{chunk, ChunkError, ChunkId, ChunkTable, Resolved, Subscription};

pub type Outcome = Result<Resolved, ChunkError>;

pub struct Settlement {
    id: ChunkId,
    rx: oneshot::Receiver<Outcome>,
    outcome: Option<Outcome>,
    subscription: Subscription,
}

/// Subscribe to `id`. Fires immediately if the chunk has already settled.
pub fn settlement(table: &mut ChunkTable, id: ChunkId) -> Settlement {
    let (tx, rx) = oneshot::channel();
    let subscription = table.listen(
        id,
        Box::new(move |outcome: chunk::Outcome<'_>| {
            let _ = tx.send(outcome.cloned().map_err(|e| e.clone()));
        }),
    );
    Settlement {
        id,
        rx,
        outcome: None,
        subscription,
    }
}

impl Settlement {
    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// The outcome, if the chunk has settled. Never blocks.
    pub fn try_outcome(&mut self) -> Option<&Outcome> {
        if self.outcome.is_none() {
            match self.rx.try_recv() {
                Ok(outcome) => self.outcome = Some(outcome),
                Err(oneshot::error::TryRecvError::Empty) => return None,
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.outcome = Some(Err(dropped(self.id)));
                }
            }
        }
        self.outcome.as_ref()
    }

    pub fn is_settled(&mut self) -> bool {
        self.try_outcome().is_some()
    }

    /// The table-side listener. Unsubscribe it when giving up on a
    /// settlement that has not fired.
    pub fn subscription(&self) -> Subscription {
        self.subscription
    }
}

impl Future for Settlement {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome> {
        if let Some(outcome) = self.outcome.take() {
            return Poll::Ready(outcome);
        }
        let id = self.id;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(dropped(id))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// The listener went away without firing: the table was dropped.
fn dropped(id: ChunkId) -> ChunkError {
    ChunkError::new(format!("chunk {id} was dropped before it settled"))
}
