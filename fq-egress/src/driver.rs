use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::{FutureExt, Stream};
use tokio::{sync::mpsc, time::Sleep};
use tracing::{debug, trace};

use fq_core::{Clock, FqScheduler, Packet};

use crate::{stats::EgressStats, EgressError, EgressOptions};

/// Front-end handle of an egress pair. Packets sent here are classified and
/// paced by the driver's scheduler.
pub struct Egress {
    tx: mpsc::Sender<Packet>,
    stats: Arc<EgressStats>,
}

impl Egress {
    /// Creates an egress pair around a scheduler. The driver is a
    /// [`Stream`] of paced packets and must be polled for the queue to make
    /// progress.
    pub fn new<C: Clock>(
        scheduler: FqScheduler<C>,
        options: EgressOptions,
    ) -> (Egress, EgressDriver<C>) {
        let (tx, rx) = mpsc::channel(options.ingress_buffer);
        let stats = Arc::new(EgressStats::default());
        let driver = EgressDriver {
            scheduler,
            rx,
            sleep: None,
            closed: false,
            stats: Arc::clone(&stats),
        };
        (Egress { tx, stats }, driver)
    }

    /// Queues a packet, waiting for ingress capacity.
    pub async fn send(&self, packet: Packet) -> Result<(), EgressError> {
        self.tx.send(packet).await.map_err(|_| EgressError::DriverClosed)
    }

    /// Queues a packet without waiting.
    pub fn try_send(&self, packet: Packet) -> Result<(), EgressError> {
        self.tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EgressError::Full,
            mpsc::error::TrySendError::Closed(_) => EgressError::DriverClosed,
        })
    }

    /// Shared statistics, updated by the driver.
    pub fn stats(&self) -> Arc<EgressStats> {
        Arc::clone(&self.stats)
    }
}

/// Driver half of an egress pair: owns the scheduler, drains the ingress
/// channel into it and yields packets no earlier than their pacing allows.
/// The stream ends once every [`Egress`] handle is dropped and the queue has
/// drained.
pub struct EgressDriver<C: Clock> {
    scheduler: FqScheduler<C>,
    rx: mpsc::Receiver<Packet>,
    /// Pending pacing timer. `Sleep` is not `Unpin`, so it is boxed; it is
    /// kept only so its waker stays registered, and replaced on each rearm.
    sleep: Option<Pin<Box<Sleep>>>,
    closed: bool,
    stats: Arc<EgressStats>,
}

impl<C: Clock> EgressDriver<C> {
    pub fn scheduler(&self) -> &FqScheduler<C> {
        &self.scheduler
    }

    pub fn stats(&self) -> Arc<EgressStats> {
        Arc::clone(&self.stats)
    }
}

impl<C: Clock + Unpin> Stream for EgressDriver<C> {
    type Item = Packet;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            // Drain the ingress channel first so freshly arrived packets
            // take part in this scheduling round.
            loop {
                match this.rx.poll_recv(cx) {
                    Poll::Ready(Some(packet)) => {
                        this.stats.increment_offered();
                        if let Err(e) = this.scheduler.enqueue(packet) {
                            trace!(%e, "packet refused");
                            this.stats.increment_dropped();
                        }
                    }
                    Poll::Ready(None) => {
                        this.closed = true;
                        break;
                    }
                    Poll::Pending => break,
                }
            }

            if let Some(packet) = this.scheduler.dequeue() {
                this.sleep = None;
                this.stats.increment_sent();
                return Poll::Ready(Some(packet));
            }

            if this.closed && this.scheduler.qlen() == 0 {
                debug!("ingress closed and queue drained, shutting down");
                return Poll::Ready(None);
            }

            // Nothing is ready. If flows are merely throttled, sleep until
            // the scheduler's watchdog deadline; otherwise the ingress
            // channel wakes us.
            if let Some(deadline) = this.scheduler.next_wakeup() {
                let now = this.scheduler.clock().now_ns();
                let wait = Duration::from_nanos(deadline.saturating_sub(now));
                let sleep = this.sleep.insert(Box::pin(tokio::time::sleep(wait)));
                if sleep.poll_unpin(cx).is_ready() {
                    // Deadline already passed, run another round.
                    this.sleep = None;
                    continue;
                }
            }
            return Poll::Pending;
        }
    }
}
