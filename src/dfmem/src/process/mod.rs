//! Cross-process memory access.
//!
//! [`Process`] is the minimum contract the reader core needs: identify
//! the target build, stop and resume it, and read byte ranges. Reads are
//! cooperative tasks so that decorators ([`ProcessCache`],
//! [`ProcessVectorizer`]) and the read-task graph can interleave them;
//! the default driver just blocks on the task graph.

pub mod cache;
pub mod event;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod maps;
pub mod testing;
pub mod vectorizer;

pub use cache::ProcessCache;
pub use vectorizer::ProcessVectorizer;

use std::io;

use futures::future::{join_all, LocalBoxFuture};

/// A borrowed window of target memory: the bytes plus the target address
/// they were read from.
#[derive(Debug, Clone, Copy)]
pub struct MemoryView<'a> {
    pub address: usize,
    pub data: &'a [u8],
}

impl<'a> MemoryView<'a> {
    pub fn new(address: usize, data: &'a [u8]) -> MemoryView<'a> {
        MemoryView { address, data }
    }

    /// Sub-view of `len` bytes starting `offset` bytes in.
    pub fn subview(&self, offset: usize, len: usize) -> MemoryView<'a> {
        MemoryView {
            address: self.address + offset,
            data: &self.data[offset..offset + len],
        }
    }

    /// Sub-view from `offset` to the end.
    pub fn tail(&self, offset: usize) -> MemoryView<'a> {
        MemoryView {
            address: self.address + offset,
            data: &self.data[offset..],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One block read request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: usize,
    pub len: usize,
}

/// Interface to a running game process.
///
/// `read`/`readv` either fill the whole request or fail; a partial read
/// is always an error. Read futures must be driven through [`Process::sync`]
/// so that decorators can run their own pumping loops alongside the task
/// graph.
pub trait Process {
    /// Build identifier used to pick the matching version: 4 big-endian
    /// timestamp bytes for PE images, a 16-byte MD5 for native Linux
    /// executables.
    fn id(&self) -> &[u8];

    /// Difference between the mapped image base and the addresses in the
    /// symbol table (0 for natively loaded Linux images).
    fn base_offset(&self) -> isize;

    /// Pause all target threads. Idempotent failures are reported.
    fn stop(&self) -> io::Result<()>;

    /// Resume the target after reading.
    fn cont(&self) -> io::Result<()>;

    /// Read `len` bytes at `address`.
    fn read(&self, address: usize, len: usize) -> LocalBoxFuture<'_, io::Result<Vec<u8>>>;

    /// Read several blocks. The default fans out to [`Process::read`]
    /// concurrently and reports the first error; native implementations
    /// may perform OS-level scatter reads instead.
    fn readv(&self, requests: Vec<ReadRequest>) -> LocalBoxFuture<'_, io::Result<Vec<Vec<u8>>>> {
        Box::pin(async move {
            let results = join_all(
                requests
                    .iter()
                    .map(|request| self.read(request.address, request.len)),
            )
            .await;
            results.into_iter().collect()
        })
    }

    /// Drive `task` to completion, cooperating with any pending reads
    /// issued against this process.
    fn sync(&self, task: LocalBoxFuture<'_, ()>) {
        futures::executor::block_on(task);
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeProcess;
    use super::*;

    #[test]
    fn test_memory_view_subview() {
        let data = [0u8, 1, 2, 3, 4, 5, 6, 7];
        let view = MemoryView::new(0x1000, &data);
        let sub = view.subview(2, 4);
        assert_eq!(sub.address, 0x1002);
        assert_eq!(sub.data, &[2, 3, 4, 5]);
        let tail = view.tail(6);
        assert_eq!(tail.address, 0x1006);
        assert_eq!(tail.data, &[6, 7]);
    }

    #[test]
    fn test_default_readv_fans_out() {
        // A transport that only provides `read`, taking the trait's
        // default `readv`.
        struct Raw(FakeProcess);

        impl Process for Raw {
            fn id(&self) -> &[u8] {
                self.0.id()
            }
            fn base_offset(&self) -> isize {
                self.0.base_offset()
            }
            fn stop(&self) -> io::Result<()> {
                self.0.stop()
            }
            fn cont(&self) -> io::Result<()> {
                self.0.cont()
            }
            fn read(&self, address: usize, len: usize) -> LocalBoxFuture<'_, io::Result<Vec<u8>>> {
                self.0.read(address, len)
            }
        }

        let fake = FakeProcess::new(vec![1, 2, 3, 4]);
        fake.write(0x100, &[1, 2, 3]);
        fake.write(0x200, &[9, 8]);
        let probe = fake.clone();
        let process = Raw(fake);
        let requests = vec![
            ReadRequest {
                address: 0x100,
                len: 3,
            },
            ReadRequest {
                address: 0x200,
                len: 2,
            },
        ];
        let mut out = Vec::new();
        process.sync(Box::pin(async {
            out = process.readv(requests).await.unwrap();
        }));
        assert_eq!(out, vec![vec![1, 2, 3], vec![9, 8]]);
        // The default implementation fanned out to single reads.
        assert_eq!(probe.read_count(), 2);
        assert!(probe.batches().is_empty());
    }

    #[test]
    fn test_read_unmapped_is_error() {
        let process = FakeProcess::new(vec![]);
        let mut result = None;
        process.sync(Box::pin(async {
            result = Some(process.read(0x4000, 8).await);
        }));
        assert!(result.is_some_and(|r| r.is_err()));
    }
}
