//! Read coalescing.
//!
//! Single reads are queued together with their waiters and submitted as
//! one `readv` batch: when the queued byte total would pass the ceiling,
//! whenever the driver's pump loop is woken, and once more after the
//! task graph finishes so nothing is left stranded. A single read larger
//! than the ceiling flushes the queue and then passes through in its own
//! batch; the ceiling is a soft limit.

use std::cell::{Cell, RefCell};
use std::io;

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::FutureExt;

use super::event::AutoResetEvent;
use super::{Process, ReadRequest};

struct Queued {
    request: ReadRequest,
    reply: oneshot::Sender<Result<Vec<u8>, io::ErrorKind>>,
}

/// Coalescing decorator over another [`Process`].
///
/// Reads issued against it only complete while [`Process::sync`] drives
/// the task graph, since the pump loop lives inside `sync`.
pub struct ProcessVectorizer {
    inner: Box<dyn Process>,
    max_total: usize,
    queue: RefCell<Vec<Queued>>,
    queued_bytes: Cell<usize>,
    pending: AutoResetEvent,
}

impl ProcessVectorizer {
    /// Wrap `inner`, keeping batches below `max_total` queued bytes.
    pub fn new(inner: Box<dyn Process>, max_total: usize) -> ProcessVectorizer {
        ProcessVectorizer {
            inner,
            max_total,
            queue: RefCell::new(Vec::new()),
            queued_bytes: Cell::new(0),
            pending: AutoResetEvent::new(),
        }
    }

    async fn flush(&self) {
        let batch: Vec<Queued> = std::mem::take(&mut *self.queue.borrow_mut());
        self.queued_bytes.set(0);
        if batch.is_empty() {
            return;
        }
        let requests: Vec<ReadRequest> = batch.iter().map(|queued| queued.request).collect();
        match self.inner.readv(requests).await {
            Ok(results) => {
                for (queued, bytes) in batch.into_iter().zip(results) {
                    let _ = queued.reply.send(Ok(bytes));
                }
            }
            Err(err) => {
                // Every waiter of the batch shares the error.
                let kind = err.kind();
                for queued in batch {
                    let _ = queued.reply.send(Err(kind));
                }
            }
        }
    }
}

impl Process for ProcessVectorizer {
    fn id(&self) -> &[u8] {
        self.inner.id()
    }

    fn base_offset(&self) -> isize {
        self.inner.base_offset()
    }

    fn stop(&self) -> io::Result<()> {
        self.inner.stop()
    }

    fn cont(&self) -> io::Result<()> {
        self.inner.cont()
    }

    fn read(&self, address: usize, len: usize) -> LocalBoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move {
            if self.queued_bytes.get() + len > self.max_total {
                self.flush().await;
            }
            let (reply, result) = oneshot::channel();
            self.queue.borrow_mut().push(Queued {
                request: ReadRequest { address, len },
                reply,
            });
            self.queued_bytes.set(self.queued_bytes.get() + len);
            self.pending.set();
            match result.await {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(kind)) => Err(kind.into()),
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::Other,
                    "queued read was dropped",
                )),
            }
        })
    }

    fn sync(&self, task: LocalBoxFuture<'_, ()>) {
        self.inner.sync(Box::pin(async move {
            let mut task = task.fuse();
            loop {
                let mut woken = self.pending.wait().fuse();
                futures::select! {
                    _ = task => break,
                    _ = woken => self.flush().await,
                }
            }
            // Drain whatever the last turn of the graph queued.
            loop {
                if self.queue.borrow().is_empty() {
                    break;
                }
                self.flush().await;
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeProcess;
    use super::*;

    fn image() -> FakeProcess {
        let process = FakeProcess::new(vec![]);
        process.write(0x1000, &[1; 64]);
        process.write(0x2000, &[2; 64]);
        process.write(0x3000, &[3; 64]);
        process
    }

    #[test]
    fn test_small_reads_coalesce_into_one_batch() {
        let process = image();
        let probe = process.clone();
        let vectorizer = ProcessVectorizer::new(Box::new(process), 1024);

        let mut results = Vec::new();
        vectorizer.sync(Box::pin(async {
            let reads = futures::future::join_all([
                vectorizer.read(0x1000, 16),
                vectorizer.read(0x2000, 16),
                vectorizer.read(0x3000, 16),
            ])
            .await;
            results = reads;
        }));

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(results[0].as_ref().unwrap()[0], 1);
        assert_eq!(results[2].as_ref().unwrap()[0], 3);
        assert_eq!(probe.batches(), vec![3]);
        assert_eq!(probe.read_count(), 0);
    }

    #[test]
    fn test_ceiling_splits_batches() {
        let process = image();
        let probe = process.clone();
        let vectorizer = ProcessVectorizer::new(Box::new(process), 40);

        vectorizer.sync(Box::pin(async {
            let reads = futures::future::join_all([
                vectorizer.read(0x1000, 32),
                vectorizer.read(0x2000, 32),
                vectorizer.read(0x3000, 32),
            ])
            .await;
            assert!(reads.iter().all(|r| r.is_ok()));
        }));

        // 32 + 32 passes the 40-byte ceiling, so the queue flushed early.
        assert!(probe.batches().len() >= 2);
        assert_eq!(probe.batches().iter().sum::<usize>(), 3);
    }

    #[test]
    fn test_oversized_read_passes_through() {
        let process = FakeProcess::new(vec![]);
        process.write(0x1000, &vec![7u8; 256]);
        let probe = process.clone();
        let vectorizer = ProcessVectorizer::new(Box::new(process), 64);

        let mut bytes = Vec::new();
        vectorizer.sync(Box::pin(async {
            bytes = vectorizer.read(0x1000, 256).await.unwrap();
        }));
        assert_eq!(bytes.len(), 256);
        assert_eq!(probe.batches(), vec![1]);
    }

    #[test]
    fn test_batch_error_reaches_every_waiter() {
        let process = FakeProcess::new(vec![]);
        process.write(0x1000, &[1; 16]);
        // 0x2000 left unmapped: the whole batch fails.
        let vectorizer = ProcessVectorizer::new(Box::new(process), 1024);

        let mut results = Vec::new();
        vectorizer.sync(Box::pin(async {
            results = futures::future::join_all([
                vectorizer.read(0x1000, 16),
                vectorizer.read(0x2000, 16),
            ])
            .await;
        }));
        assert!(results.iter().all(|r| r.is_err()));
    }
}
