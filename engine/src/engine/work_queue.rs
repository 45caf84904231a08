use std::{
    sync::{
        mpsc::{channel, Receiver, Sender},
        Mutex, Weak,
    },
    thread::{Builder, JoinHandle},
};

use crate::engine::{context::FenceContext, drain, error::EngineError, FenceEngine};

pub(crate) enum WorkItem {
    /// Run a drain pass over one context.
    Drain(Weak<FenceContext>),
    /// Reply once every item queued before this one has been processed.
    Flush(Sender<()>),
}

/// The engine's deferred-execution side: a single worker thread fed
/// through a channel. Contexts collapse redundant wakes with their
/// work-pending flag, so at most one drain item per context is in flight.
pub(crate) struct WorkQueue {
    sender: Mutex<Option<Sender<WorkItem>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            sender: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker thread. Separate from construction because the
    /// thread needs a handle back to the engine that owns this queue.
    pub fn start(&self, engine: Weak<FenceEngine>) -> Result<(), EngineError> {
        let (sender, receiver) = channel();
        let handle = Builder::new()
            .name("fenceline-drain".into())
            .spawn(move || worker_loop(engine, receiver))
            .map_err(|_| EngineError::OutOfMemory {
                what: "drain worker thread",
            })?;

        *self.sender.lock().expect("work queue lock poisoned") = Some(sender);
        *self.worker.lock().expect("work queue lock poisoned") = Some(handle);
        Ok(())
    }

    pub fn submit(&self, item: WorkItem) {
        if let Some(sender) = &*self.sender.lock().expect("work queue lock poisoned") {
            // A send after shutdown has nowhere to go; the frames it would
            // have drained are retired by context destruction instead.
            let _ = sender.send(item);
        }
    }

    /// Blocks until every item queued before this call has been processed.
    pub fn flush(&self) {
        let (reply, done) = channel();
        self.submit(WorkItem::Flush(reply));
        let _ = done.recv();
    }

    /// Stops the worker and waits for it to exit.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .expect("work queue lock poisoned")
            .take();
        if let Some(handle) = self.worker.lock().expect("work queue lock poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(engine: Weak<FenceEngine>, receiver: Receiver<WorkItem>) {
    while let Ok(item) = receiver.recv() {
        match item {
            WorkItem::Drain(context) => {
                let Some(context) = context.upgrade() else {
                    continue;
                };
                // Clear before draining: a wake arriving mid-pass must
                // queue another pass.
                context.clear_work_pending();
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                drain::drain_context(&engine, &context);
            }
            WorkItem::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
}
