//! In-memory [`Process`] for tests.
//!
//! `FakeProcess` serves reads from a synthetic byte image and records
//! every request it sees, so decorator and reader tests can assert on
//! the exact traffic that reached the transport. Cloning yields a probe
//! sharing the same state, useful after the instance moved into a
//! decorator.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::io;
use std::rc::Rc;

use byteorder::{ByteOrder, LE};
use futures::future::LocalBoxFuture;

use super::{Process, ReadRequest};

#[derive(Default)]
struct Inner {
    id: Vec<u8>,
    base_offset: isize,
    memory: RefCell<BTreeMap<usize, u8>>,
    reads: RefCell<Vec<ReadRequest>>,
    batches: RefCell<Vec<usize>>,
    stopped: Cell<bool>,
    stops: Cell<usize>,
    conts: Cell<usize>,
}

/// A fake target process backed by an in-memory image.
#[derive(Clone, Default)]
pub struct FakeProcess {
    inner: Rc<Inner>,
}

impl FakeProcess {
    pub fn new(id: Vec<u8>) -> FakeProcess {
        FakeProcess {
            inner: Rc::new(Inner {
                id,
                ..Inner::default()
            }),
        }
    }

    pub fn with_base_offset(id: Vec<u8>, base_offset: isize) -> FakeProcess {
        FakeProcess {
            inner: Rc::new(Inner {
                id,
                base_offset,
                ..Inner::default()
            }),
        }
    }

    /// Map `bytes` at `address`.
    pub fn write(&self, address: usize, bytes: &[u8]) {
        let mut memory = self.inner.memory.borrow_mut();
        for (i, byte) in bytes.iter().enumerate() {
            memory.insert(address + i, *byte);
        }
    }

    pub fn write_u8(&self, address: usize, value: u8) {
        self.write(address, &[value]);
    }

    pub fn write_u16(&self, address: usize, value: u16) {
        let mut buf = [0u8; 2];
        LE::write_u16(&mut buf, value);
        self.write(address, &buf);
    }

    pub fn write_u32(&self, address: usize, value: u32) {
        let mut buf = [0u8; 4];
        LE::write_u32(&mut buf, value);
        self.write(address, &buf);
    }

    pub fn write_u64(&self, address: usize, value: u64) {
        let mut buf = [0u8; 8];
        LE::write_u64(&mut buf, value);
        self.write(address, &buf);
    }

    /// Write a 64-bit target pointer.
    pub fn write_ptr(&self, address: usize, value: usize) {
        self.write_u64(address, value as u64);
    }

    /// Number of single reads served.
    pub fn read_count(&self) -> usize {
        self.inner.reads.borrow().len()
    }

    /// Every single read served, in order.
    pub fn reads(&self) -> Vec<ReadRequest> {
        self.inner.reads.borrow().clone()
    }

    /// Request count of every `readv` batch served, in order.
    pub fn batches(&self) -> Vec<usize> {
        self.inner.batches.borrow().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.get()
    }

    pub fn stop_count(&self) -> usize {
        self.inner.stops.get()
    }

    pub fn cont_count(&self) -> usize {
        self.inner.conts.get()
    }

    fn copy_out(&self, address: usize, len: usize) -> io::Result<Vec<u8>> {
        let memory = self.inner.memory.borrow();
        let mut out = Vec::with_capacity(len);
        for offset in 0..len {
            match memory.get(&(address + offset)) {
                Some(byte) => out.push(*byte),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unmapped address {:#x}", address + offset),
                    ))
                }
            }
        }
        Ok(out)
    }
}

impl Process for FakeProcess {
    fn id(&self) -> &[u8] {
        &self.inner.id
    }

    fn base_offset(&self) -> isize {
        self.inner.base_offset
    }

    fn stop(&self) -> io::Result<()> {
        self.inner.stopped.set(true);
        self.inner.stops.set(self.inner.stops.get() + 1);
        Ok(())
    }

    fn cont(&self) -> io::Result<()> {
        self.inner.stopped.set(false);
        self.inner.conts.set(self.inner.conts.get() + 1);
        Ok(())
    }

    fn read(&self, address: usize, len: usize) -> LocalBoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move {
            self.inner.reads.borrow_mut().push(ReadRequest { address, len });
            self.copy_out(address, len)
        })
    }

    fn readv(&self, requests: Vec<ReadRequest>) -> LocalBoxFuture<'_, io::Result<Vec<Vec<u8>>>> {
        Box::pin(async move {
            self.inner.batches.borrow_mut().push(requests.len());
            requests
                .iter()
                .map(|request| self.copy_out(request.address, request.len))
                .collect()
        })
    }
}
