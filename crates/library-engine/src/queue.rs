//! Pending-reservation queue with many producers and exactly one consumer

use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};
use crossbeam::select;
use library_core::ReservationRequest;
use thiserror::Error;

use crate::lifecycle::ShutdownSignal;

/// The consumer is gone; nothing will ever process the request
#[derive(Debug, Error)]
#[error("reservation queue is closed")]
pub struct QueueClosed(pub ReservationRequest);

/// Create a FIFO queue of pending reservations
///
/// The producer side can be cloned freely; the consumer side cannot, which
/// makes the single-consumer contract part of the type.
pub fn reservation_queue() -> (QueueProducer, QueueConsumer) {
    let (sender, receiver) = unbounded();
    (
        QueueProducer { sender },
        QueueConsumer { receiver },
    )
}

/// Enqueueing side of the reservation queue
#[derive(Clone)]
pub struct QueueProducer {
    sender: Sender<ReservationRequest>,
}

impl QueueProducer {
    /// Append a request; returns the queue length afterwards
    pub fn enqueue(&self, request: ReservationRequest) -> Result<usize, QueueClosed> {
        self.sender
            .send(request)
            .map_err(|e| QueueClosed(e.into_inner()))?;
        Ok(self.sender.len())
    }

    pub fn len(&self) -> usize {
        self.sender.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_empty()
    }
}

/// Result of waiting for work
#[derive(Debug, PartialEq)]
pub enum Next {
    /// Up to `max` requests in enqueue order, and the backlog left behind
    Batch {
        items: Vec<ReservationRequest>,
        remaining: usize,
    },
    /// Nothing arrived within the idle interval
    Idle,
    /// Shutdown was requested, or every producer is gone
    Shutdown,
}

/// Draining side of the reservation queue
pub struct QueueConsumer {
    receiver: Receiver<ReservationRequest>,
}

impl QueueConsumer {
    /// Wait up to `idle` for work and take at most `max` requests
    pub fn next_batch(&self, max: usize, idle: Duration, shutdown: &ShutdownSignal) -> Next {
        let first = select! {
            recv(shutdown.receiver()) -> _ => return Next::Shutdown,
            recv(self.receiver) -> msg => match msg {
                Ok(first) => first,
                Err(_) => return Next::Shutdown,
            },
            default(idle) => return Next::Idle,
        };
        let mut items = Vec::with_capacity(max.max(1));
        items.push(first);
        while items.len() < max {
            match self.receiver.try_recv() {
                Ok(item) => items.push(item),
                Err(_) => break,
            }
        }
        Next::Batch {
            items,
            remaining: self.receiver.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::lifecycle::Shutdown;

    fn request(id: u64) -> ReservationRequest {
        ReservationRequest {
            id,
            user_id: "USR001".into(),
            isbn: "978-0132350884".into(),
            enqueued_at: Utc::now(),
        }
    }

    fn ids(next: Next) -> (Vec<u64>, usize) {
        match next {
            Next::Batch { items, remaining } => {
                (items.into_iter().map(|r| r.id).collect(), remaining)
            }
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[test]
    fn batches_preserve_fifo_order() {
        let (producer, consumer) = reservation_queue();
        let shutdown = Shutdown::new();
        for id in 1..=25 {
            producer.enqueue(request(id)).unwrap();
        }
        let idle = Duration::from_millis(10);

        let (first, remaining) = ids(consumer.next_batch(10, idle, &shutdown.signal()));
        assert_eq!(first, (1..=10).collect::<Vec<_>>());
        assert_eq!(remaining, 15);
        let (second, _) = ids(consumer.next_batch(10, idle, &shutdown.signal()));
        assert_eq!(second, (11..=20).collect::<Vec<_>>());
        let (third, remaining) = ids(consumer.next_batch(10, idle, &shutdown.signal()));
        assert_eq!(third, (21..=25).collect::<Vec<_>>());
        assert_eq!(remaining, 0);
    }

    #[test]
    fn empty_queue_idles() {
        let (_producer, consumer) = reservation_queue();
        let shutdown = Shutdown::new();
        let next = consumer.next_batch(10, Duration::from_millis(5), &shutdown.signal());
        assert_eq!(next, Next::Idle);
    }

    #[test]
    fn shutdown_interrupts_idle_wait() {
        let (_producer, consumer) = reservation_queue();
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let next = consumer.next_batch(10, Duration::from_secs(30), &shutdown.signal());
        assert_eq!(next, Next::Shutdown);
    }

    #[test]
    fn enqueue_reports_depth_and_fails_without_consumer() {
        let (producer, consumer) = reservation_queue();
        assert_eq!(producer.enqueue(request(1)).unwrap(), 1);
        assert_eq!(producer.enqueue(request(2)).unwrap(), 2);
        assert_eq!(consumer.len(), 2);
        drop(consumer);
        let err = producer.enqueue(request(3)).unwrap_err();
        assert_eq!(err.0.id, 3);
    }
}
