//! Optional dedicated I/O thread.
//!
//! The host thread and the worker share two single-slot mailboxes behind one
//! lock. Posting a request replaces any request the worker has not picked up
//! yet, and a fresh response replaces an unread one (latest wins). The worker
//! never touches the scene; it only moves bytes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{AbortHandle, Connector, Endpoint, Transport};
use crate::error::{ConnectError, TransportError};

/// Wraps another connector so every transport it opens runs on its own thread
pub struct ThreadedConnector {
    inner: Box<dyn Connector>,
    io_timeout: Option<Duration>,
}

impl ThreadedConnector {
    pub fn new(inner: impl Connector + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            io_timeout: None,
        }
    }

    /// How long the worker waits for one response. Defaults to the session
    /// timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }
}

impl Connector for ThreadedConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let inner = self.inner.connect(endpoint, timeout)?;
        let io_timeout = self.io_timeout.unwrap_or(timeout);
        Ok(Box::new(ThreadedTransport::spawn(inner, io_timeout)))
    }
}

type Response = (u64, Result<Vec<u8>, TransportError>);

#[derive(Default)]
struct Slots {
    outgoing: Option<(u64, Vec<u8>)>,
    incoming: Option<Response>,
    shutdown: bool,
    aborted: bool,
    worker_done: bool,
}

struct Mailbox {
    slots: Mutex<Slots>,
    signal: Condvar,
}

pub struct ThreadedTransport {
    mailbox: Arc<Mailbox>,
    inner_abort: Option<AbortHandle>,
    last_sent: u64,
    worker: Option<JoinHandle<()>>,
}

impl ThreadedTransport {
    pub fn spawn(inner: Box<dyn Transport>, io_timeout: Duration) -> Self {
        let mailbox = Arc::new(Mailbox {
            slots: Mutex::new(Slots::default()),
            signal: Condvar::new(),
        });
        let inner_abort = inner.abort_handle();

        let worker_mailbox = mailbox.clone();
        let worker = thread::Builder::new()
            .name("multiverse-io".to_string())
            .spawn(move || run_worker(inner, worker_mailbox, io_timeout))
            .map_err(|e| warn!(error = %e, "Failed to spawn I/O thread"))
            .ok();

        if worker.is_none() {
            mailbox.slots.lock().worker_done = true;
        }

        Self {
            mailbox,
            inner_abort,
            last_sent: 0,
            worker,
        }
    }

    fn stop(&mut self) {
        {
            let mut slots = self.mailbox.slots.lock();
            slots.shutdown = true;
        }
        self.mailbox.signal.notify_all();
        if let Some(handle) = &self.inner_abort {
            handle.abort();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(mut inner: Box<dyn Transport>, mailbox: Arc<Mailbox>, io_timeout: Duration) {
    loop {
        let (sequence, payload) = {
            let mut slots = mailbox.slots.lock();
            loop {
                if slots.shutdown {
                    inner.close();
                    slots.worker_done = true;
                    return;
                }
                if let Some(request) = slots.outgoing.take() {
                    break request;
                }
                mailbox.signal.wait(&mut slots);
            }
        };

        let deadline = Instant::now() + io_timeout;
        let result = inner.send_frame(sequence, &payload).and_then(|()| loop {
            let (found, response) = inner.recv_frame(deadline)?;
            if found >= sequence {
                break Ok((found, response));
            }
        });

        let fatal = matches!(&result, Err(e) if !e.is_timeout());
        let response = match result {
            Ok((found, bytes)) => (found, Ok(bytes)),
            Err(e) => (sequence, Err(e)),
        };

        {
            let mut slots = mailbox.slots.lock();
            if slots.incoming.is_some() {
                debug!("Replacing unread response");
            }
            slots.incoming = Some(response);
            if fatal {
                slots.worker_done = true;
            }
        }
        mailbox.signal.notify_all();

        if fatal {
            inner.close();
            return;
        }
    }
}

impl Transport for ThreadedTransport {
    fn send_frame(&mut self, sequence: u64, payload: &[u8]) -> Result<(), TransportError> {
        {
            let mut slots = self.mailbox.slots.lock();
            if slots.aborted {
                return Err(TransportError::Aborted);
            }
            if slots.worker_done {
                return Err(TransportError::Closed);
            }
            if slots.outgoing.is_some() {
                debug!("Replacing request the I/O thread has not picked up");
            }
            slots.outgoing = Some((sequence, payload.to_vec()));
        }
        self.last_sent = sequence;
        self.mailbox.signal.notify_all();
        Ok(())
    }

    fn recv_frame(&mut self, deadline: Instant) -> Result<(u64, Vec<u8>), TransportError> {
        let mut slots = self.mailbox.slots.lock();
        loop {
            if slots.aborted {
                return Err(TransportError::Aborted);
            }
            match slots.incoming.take() {
                // Outcome of a request the session already gave up on
                Some((sequence, Err(_))) if sequence < self.last_sent => continue,
                Some((sequence, result)) => return result.map(|bytes| (sequence, bytes)),
                None if slots.worker_done => return Err(TransportError::Closed),
                None => {}
            }
            if self.mailbox.signal.wait_until(&mut slots, deadline).timed_out() {
                return Err(TransportError::Timeout);
            }
        }
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let mailbox = self.mailbox.clone();
        let inner_abort = self.inner_abort.clone();
        Some(AbortHandle::new(move || {
            mailbox.slots.lock().aborted = true;
            mailbox.signal.notify_all();
            if let Some(handle) = &inner_abort {
                handle.abort();
            }
        }))
    }

    fn close(&mut self) {
        self.stop();
    }
}

impl Drop for ThreadedTransport {
    fn drop(&mut self) {
        self.stop();
    }
}
