use std::{
    sync::{
        Arc,
        mpsc::{Receiver, Sender, channel},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

/// One-shot completion signal.
///
/// Replaces the wait-queue/completion pairing of the source idiom: the
/// waiter clones the `Arc`, drops whatever else it holds and blocks here
/// until the signalling side fires.
///
/// # Test
///
/// ```
/// use std::{sync::Arc, time::Duration};
/// use chanmux_service::task::Completion;
///
/// let completion = Arc::new(Completion::default());
///
/// assert!(!completion.wait_timeout(Duration::from_millis(10)));
///
/// completion.signal();
/// assert!(completion.wait_timeout(Duration::from_millis(10)));
/// ```
#[derive(Default)]
pub struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub fn signal(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    /// Returns `true` if the signal fired before the timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }

        true
    }
}

struct TaskFlags {
    scheduled: bool,
    stopped: bool,
}

/// A cooperative dispatch task.
///
/// The translation of a softirq tasklet: `schedule` is idempotent, callable
/// from transport callback context, and guarantees at most one execution of
/// the body outstanding at a time. The body returns `true` to ask for an
/// immediate reschedule (more work was pending when its burst ran out).
pub(crate) struct Task {
    flags: Mutex<TaskFlags>,
    cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Task {
    pub fn spawn<F>(name: &str, mut body: F) -> Arc<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let task = Arc::new(Self {
            flags: Mutex::new(TaskFlags {
                scheduled: false,
                stopped: false,
            }),
            cond: Condvar::new(),
            handle: Mutex::new(None),
        });

        let this = task.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                loop {
                    {
                        let mut flags = this.flags.lock();
                        while !flags.scheduled && !flags.stopped {
                            this.cond.wait(&mut flags);
                        }

                        if flags.stopped {
                            return;
                        }

                        flags.scheduled = false;
                    }

                    if body() {
                        this.schedule();
                    }
                }
            })
            .expect("Unable to spawn the dispatch task thread!");

        *task.handle.lock() = Some(handle);
        task
    }

    pub fn schedule(&self) {
        let mut flags = self.flags.lock();
        if !flags.scheduled && !flags.stopped {
            flags.scheduled = true;
            self.cond.notify_one();
        }
    }

    /// Stop and join. Any execution already in flight finishes first.
    pub fn stop(&self) {
        {
            let mut flags = self.flags.lock();
            flags.stopped = true;
            self.cond.notify_one();
        }

        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

pub(crate) enum Job<P> {
    Control { port: P, bytes: bytes::Bytes },
    Flush(Arc<Completion>),
}

/// The process-wide serialized control worker.
///
/// Handshake datagrams from every port funnel through this single thread,
/// which serializes CONN_REQ/CONN_ACK/CONN_CLOSE processing across the whole
/// engine and keeps channel state transitions single-file.
pub(crate) struct ControlWorker<P> {
    sender: Mutex<Option<Sender<Job<P>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<P: Send + 'static> ControlWorker<P> {
    pub fn spawn<F>(body: F) -> Self
    where
        F: Fn(P, bytes::Bytes) + Send + 'static,
    {
        let (sender, receiver): (Sender<Job<P>>, Receiver<Job<P>>) = channel();

        let handle = thread::Builder::new()
            .name("chanmux-control".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    match job {
                        Job::Control { port, bytes } => body(port, bytes),
                        Job::Flush(completion) => completion.signal(),
                    }
                }
            })
            .expect("Unable to spawn the control worker thread!");

        Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Clonable handle for dispatch tasks to feed control items in with.
    pub fn queue(&self) -> Option<Sender<Job<P>>> {
        self.sender.lock().clone()
    }

    /// Barrier: returns once every control item queued before the call has
    /// been processed.
    pub fn flush(&self) {
        let completion = Arc::new(Completion::default());

        {
            let Some(sender) = &*self.sender.lock() else {
                return;
            };

            if sender.send(Job::Flush(completion.clone())).is_err() {
                return;
            }
        }

        completion.wait_timeout(Duration::from_secs(3));
    }

    pub fn stop(&self) {
        drop(self.sender.lock().take());

        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
