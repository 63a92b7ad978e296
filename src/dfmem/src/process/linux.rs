//! Linux targets: native builds and Windows builds under Wine.
//!
//! Both adapters stop the target with `PTRACE_ATTACH`, resume it with
//! `PTRACE_DETACH`, and read memory with `process_vm_readv`. They differ
//! in how the build is identified: a native executable is matched by the
//! MD5 of its file, a Wine-hosted PE image by its header timestamp, with
//! the relocation offset derived from the memory map.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LE};
use futures::future::LocalBoxFuture;
use md5::{Digest, Md5};

use super::maps::parse_maps;
use super::{Process, ReadRequest};

/// Kernel limit on iovec counts per `process_vm_readv` call.
const IOV_MAX: usize = 1024;

/// Default load address of the game's PE image.
const PE_IMAGE_BASE: u64 = 0x140000000;

/// ptrace-driven stop/continue and `process_vm_readv` access, shared by
/// the native and Wine adapters.
struct PtraceTarget {
    pid: libc::pid_t,
}

impl PtraceTarget {
    fn stop(&self) -> io::Result<()> {
        // SAFETY: PTRACE_ATTACH with null addr/data is always valid.
        let attached = unsafe {
            libc::ptrace(
                libc::PTRACE_ATTACH,
                self.pid,
                std::ptr::null_mut::<libc::c_void>(),
                std::ptr::null_mut::<libc::c_void>(),
            )
        };
        if attached == -1 {
            return Err(io::Error::last_os_error());
        }
        // Wait for the attach SIGSTOP, forwarding any other signal.
        loop {
            let mut status = 0;
            // SAFETY: status is a valid out pointer for waitpid.
            if unsafe { libc::waitpid(self.pid, &mut status, 0) } == -1 {
                return Err(io::Error::last_os_error());
            }
            if !libc::WIFSTOPPED(status) {
                continue;
            }
            let signal = libc::WSTOPSIG(status);
            if signal == libc::SIGSTOP {
                return Ok(());
            }
            // SAFETY: forwarding the observed stop signal to the tracee.
            if unsafe {
                libc::ptrace(
                    libc::PTRACE_CONT,
                    self.pid,
                    std::ptr::null_mut::<libc::c_void>(),
                    signal as usize as *mut libc::c_void,
                )
            } == -1
            {
                return Err(io::Error::last_os_error());
            }
        }
    }

    fn cont(&self) -> io::Result<()> {
        // SAFETY: PTRACE_DETACH with null addr/data resumes the tracee.
        if unsafe {
            libc::ptrace(
                libc::PTRACE_DETACH,
                self.pid,
                std::ptr::null_mut::<libc::c_void>(),
                std::ptr::null_mut::<libc::c_void>(),
            )
        } == -1
        {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn read_block(&self, address: usize, len: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        if len == 0 {
            return Ok(buffer);
        }
        let local = libc::iovec {
            iov_base: buffer.as_mut_ptr().cast(),
            iov_len: len,
        };
        let remote = libc::iovec {
            iov_base: address as *mut libc::c_void,
            iov_len: len,
        };
        // SAFETY: both iovecs describe valid lengths; local points into
        // our freshly allocated buffer.
        let copied = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        if copied == -1 {
            return Err(io::Error::last_os_error());
        }
        if copied as usize != len {
            // A short read is never acceptable.
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        Ok(buffer)
    }

    fn readv_blocks(&self, requests: &[ReadRequest]) -> io::Result<Vec<Vec<u8>>> {
        let mut buffers: Vec<Vec<u8>> = requests
            .iter()
            .map(|request| vec![0u8; request.len])
            .collect();
        for (chunk_requests, chunk_buffers) in requests
            .chunks(IOV_MAX)
            .zip(buffers.chunks_mut(IOV_MAX))
        {
            let mut bytes = 0usize;
            let local: Vec<libc::iovec> = chunk_buffers
                .iter_mut()
                .map(|buffer| libc::iovec {
                    iov_base: buffer.as_mut_ptr().cast(),
                    iov_len: buffer.len(),
                })
                .collect();
            let remote: Vec<libc::iovec> = chunk_requests
                .iter()
                .map(|request| {
                    bytes += request.len;
                    libc::iovec {
                        iov_base: request.address as *mut libc::c_void,
                        iov_len: request.len,
                    }
                })
                .collect();
            // SAFETY: local iovecs point into live buffers of matching
            // lengths; counts are equal and bounded by IOV_MAX.
            let copied = unsafe {
                libc::process_vm_readv(
                    self.pid,
                    local.as_ptr(),
                    local.len() as libc::c_ulong,
                    remote.as_ptr(),
                    remote.len() as libc::c_ulong,
                    0,
                )
            };
            if copied == -1 {
                return Err(io::Error::last_os_error());
            }
            if copied as usize != bytes {
                return Err(io::Error::from_raw_os_error(libc::EACCES));
            }
        }
        Ok(buffers)
    }
}

/// A natively compiled Linux game process, identified by the MD5 of its
/// executable.
pub struct LinuxProcess {
    target: PtraceTarget,
    digest: Vec<u8>,
}

impl LinuxProcess {
    pub fn attach(pid: i32) -> io::Result<LinuxProcess> {
        let mut exe = File::open(format!("/proc/{pid}/exe"))?;
        let mut hasher = Md5::new();
        let mut buffer = [0u8; 4096];
        loop {
            let read = exe.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(LinuxProcess {
            target: PtraceTarget { pid },
            digest: hasher.finalize().to_vec(),
        })
    }
}

impl Process for LinuxProcess {
    fn id(&self) -> &[u8] {
        &self.digest
    }

    fn base_offset(&self) -> isize {
        0
    }

    fn stop(&self) -> io::Result<()> {
        self.target.stop()
    }

    fn cont(&self) -> io::Result<()> {
        self.target.cont()
    }

    fn read(&self, address: usize, len: usize) -> LocalBoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move { self.target.read_block(address, len) })
    }

    fn readv(&self, requests: Vec<ReadRequest>) -> LocalBoxFuture<'_, io::Result<Vec<Vec<u8>>>> {
        Box::pin(async move { self.target.readv_blocks(&requests) })
    }
}

/// A Windows build of the game running under Wine on Linux, identified
/// by the PE header timestamp of its mapped image.
pub struct WineProcess {
    target: PtraceTarget,
    timestamp: Vec<u8>,
    base_offset: isize,
}

impl WineProcess {
    pub fn attach(pid: i32) -> io::Result<WineProcess> {
        for region in parse_maps(pid)? {
            let Some(path) = &region.path else { continue };
            if !path.ends_with("Dwarf Fortress.exe") {
                continue;
            }
            let base_offset = (region.start as i64 - PE_IMAGE_BASE as i64) as isize;
            let timestamp = pe_timestamp(path)?;
            return Ok(WineProcess {
                target: PtraceTarget { pid },
                timestamp: timestamp.to_vec(),
                base_offset,
            });
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            "this process is not running Dwarf Fortress.exe",
        ))
    }
}

impl Process for WineProcess {
    fn id(&self) -> &[u8] {
        &self.timestamp
    }

    fn base_offset(&self) -> isize {
        self.base_offset
    }

    fn stop(&self) -> io::Result<()> {
        self.target.stop()
    }

    fn cont(&self) -> io::Result<()> {
        self.target.cont()
    }

    fn read(&self, address: usize, len: usize) -> LocalBoxFuture<'_, io::Result<Vec<u8>>> {
        Box::pin(async move { self.target.read_block(address, len) })
    }

    fn readv(&self, requests: Vec<ReadRequest>) -> LocalBoxFuture<'_, io::Result<Vec<Vec<u8>>>> {
        Box::pin(async move { self.target.readv_blocks(&requests) })
    }
}

/// Extract the build timestamp from a PE image file, in the big-endian
/// byte order the version table uses.
fn pe_timestamp(path: &str) -> io::Result<[u8; 4]> {
    let mut file = File::open(path)?;
    let mut dos_header = [0u8; 64];
    file.read_exact(&mut dos_header)?;
    if &dos_header[0..2] != b"MZ" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing MZ signature",
        ));
    }
    let e_lfanew = LE::read_u32(&dos_header[0x3c..0x40]) as u64;
    file.seek(SeekFrom::Start(e_lfanew))?;
    // IMAGE_NT_HEADERS: signature, then Machine/NumberOfSections, then
    // TimeDateStamp.
    let mut nt_header = [0u8; 12];
    file.read_exact(&mut nt_header)?;
    if &nt_header[0..4] != b"PE\0\0" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing PE signature",
        ));
    }
    Ok([nt_header[11], nt_header[10], nt_header[9], nt_header[8]])
}
