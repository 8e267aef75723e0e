//! Single-consumer FIFO task queue (spec.md §5): the "worker queue" and
//! "decode queue" are each one of these. Grounded on the teacher's
//! `AudioPipeline` task shape in `voip/pipeline.rs` — a `tokio::spawn`ed
//! loop draining an `mpsc::unbounded_channel`, generalized from a typed
//! packet channel to a queue of boxed closures so arbitrary handlers
//! (RTP ingress, NACK ticks, FEC callbacks, frame dispatch) can share one
//! FIFO scheduler with no internal locking.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A cooperative, single-consumer scheduler. Cloning a handle and posting
/// from multiple callers is fine; execution is always serialized onto the
/// one worker task this queue owns.
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<Task>,
    worker: JoinHandle<()>,
}

impl TaskQueue {
    pub fn new() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let worker = tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task();
            }
        });
        Self { sender, worker }
    }

    /// Enqueues `task` to run after everything already queued. Silently
    /// dropped if the queue has already been stopped.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(task));
    }

    /// Enqueues `task` to run no earlier than `delay` from now, still
    /// executing on this queue's single worker (so it serializes normally
    /// with everything else once its delay elapses).
    pub fn post_delayed(&self, task: impl FnOnce() + Send + 'static, delay: std::time::Duration) -> DelayedTaskHandle {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = sender.send(Box::new(task));
        });
        DelayedTaskHandle { handle }
    }

    /// A clone of this queue's sender, for building a repeating task with
    /// [`spawn_repeating`] that still posts its ticks onto this worker.
    pub fn sender(&self) -> mpsc::UnboundedSender<Task> {
        self.sender.clone()
    }

    /// Cancels the worker loop and waits for it to drain its last in-flight
    /// task. Further `post`/`post_delayed` calls become no-ops.
    pub async fn stop(self) {
        drop(self.sender);
        let _ = self.worker.await;
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A cancellable handle to one `post_delayed` call, e.g. the repeating
/// NACK tick or a scheduled frame-dispatch check (spec.md §5).
pub struct DelayedTaskHandle {
    handle: JoinHandle<()>,
}

impl DelayedTaskHandle {
    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// Spawns `task` immediately and again every `period` until cancelled.
/// Used for the repeating NACK-retransmission timer (spec.md §4.4, §5).
pub fn spawn_repeating(
    queue_sender: mpsc::UnboundedSender<Task>,
    period: std::time::Duration,
    mut task: impl FnMut() + Send + 'static,
) -> DelayedTaskHandle {
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let sender = queue_sender.clone();
            // `task` must be invoked on the owning queue's worker to keep
            // the single-writer guarantee; post it rather than calling it
            // inline on this timer task.
            if sender.send(Box::new(move || task())).is_err() {
                break;
            }
        }
    });
    DelayedTaskHandle { handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn posted_tasks_run_in_order() {
        let queue = TaskQueue::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        for i in 0..5 {
            let order = Arc::clone(&order);
            queue.post(move || order.lock().unwrap().push(i));
        }

        queue.stop().await;
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn delayed_task_can_be_cancelled_before_it_fires() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        let handle = queue.post_delayed(move || { ran_clone.fetch_add(1, Ordering::SeqCst); }, std::time::Duration::from_secs(10));
        handle.cancel();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
