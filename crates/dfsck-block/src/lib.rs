#![forbid(unsafe_code)]
//! Block I/O layer for the checker.
//!
//! Provides the `ByteDevice` / `BlockDevice` traits, file-backed devices
//! with pread/pwrite semantics, the fire-and-forget [`Readahead`] hint, and
//! the per-category [`readahead::ReadaheadQueue`] that issues those hints
//! off the scanning thread.

pub mod readahead;

pub use readahead::{LaneStats, ReadaheadQueue, ReadaheadStats};

use dfsck_error::{FsckError, Result};
use dfsck_types::{BLOCK_SIZE, BlockAddress};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Whether writes can succeed.
    fn is_writable(&self) -> bool;

    /// Hint that `[offset, offset + len)` will be read soon.
    ///
    /// Best effort: failures are swallowed.
    fn prefetch(&self, _offset: u64, _len: usize) {}
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write when possible, otherwise read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    /// Open read-only regardless of file permissions (dry-run mode).
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable: false,
        })
    }

    fn check_range(&self, offset: u64, len: usize, op: &str) -> Result<()> {
        let end = offset
            .checked_add(
                u64::try_from(len)
                    .map_err(|_| FsckError::Format(format!("{op} length overflows u64")))?,
            )
            .ok_or_else(|| FsckError::Format(format!("{op} range overflows u64")))?;
        if end > self.len {
            return Err(FsckError::Format(format!(
                "{op} out of bounds: offset={offset} len={len} file_len={}",
                self.len
            )));
        }
        Ok(())
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len(), "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FsckError::ReadOnly);
        }
        self.check_range(offset, buf.len(), "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    fn prefetch(&self, offset: u64, len: usize) {
        if self.check_range(offset, len, "prefetch").is_err() {
            return;
        }
        if let Err(err) = fadvise_willneed(&self.file, offset, len) {
            trace!(offset, error = %err, "prefetch advice rejected");
        }
    }
}

/// Ask the kernel to start reading `[offset, offset + len)` without waiting
/// for it.
#[cfg(target_os = "linux")]
fn fadvise_willneed(file: &File, offset: u64, len: usize) -> Result<()> {
    use nix::fcntl::{PosixFadviseAdvice, posix_fadvise};
    use nix::libc::off_t;
    use std::os::unix::io::AsRawFd;

    let offset = off_t::try_from(offset)
        .map_err(|_| FsckError::Format(format!("prefetch offset {offset} overflows off_t")))?;
    let len = off_t::try_from(len)
        .map_err(|_| FsckError::Format(format!("prefetch length {len} overflows off_t")))?;
    posix_fadvise(
        file.as_raw_fd(),
        offset,
        len,
        PosixFadviseAdvice::POSIX_FADV_WILLNEED,
    )
    .map_err(|errno| FsckError::Io(errno.into()))
}

#[cfg(not(target_os = "linux"))]
fn fadvise_willneed(_file: &File, _offset: u64, _len: usize) -> Result<()> {
    Ok(())
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by address.
    fn read_block(&self, addr: BlockAddress) -> Result<BlockBuf>;

    /// Write a block by address. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, addr: BlockAddress, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Whether repairs may be written.
    fn is_writable(&self) -> bool;
}

/// Fire-and-forget prefetch of one block.
///
/// Implementations must not block on the device for the caller's benefit;
/// the readahead workers are the only expected callers.
pub trait Readahead: Send + Sync {
    fn readahead(&self, addr: BlockAddress);
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FsckError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }

        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size);
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(FsckError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / block_size_u64,
        })
    }

    /// Device with the checker's fixed [`BLOCK_SIZE`].
    pub fn with_default_block_size(inner: D) -> Result<Self> {
        let block_size = u32::try_from(BLOCK_SIZE)
            .map_err(|_| FsckError::Format("block size does not fit u32".to_owned()))?;
        Self::new(inner, block_size)
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, addr: BlockAddress) -> Result<u64> {
        if addr.as_u64() >= self.block_count {
            return Err(FsckError::Format(format!(
                "block out of range: block={} block_count={}",
                addr.0, self.block_count
            )));
        }
        addr.as_u64()
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| FsckError::Format("block offset overflow".to_owned()))
    }

    fn block_len(&self) -> Result<usize> {
        usize::try_from(self.block_size)
            .map_err(|_| FsckError::Format("block_size does not fit usize".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, addr: BlockAddress) -> Result<BlockBuf> {
        let offset = self.offset_of(addr)?;
        let mut buf = vec![0_u8; self.block_len()?];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, addr: BlockAddress, data: &[u8]) -> Result<()> {
        let expected = self.block_len()?;
        if data.len() != expected {
            return Err(FsckError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(addr)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }
}

impl<D: ByteDevice> Readahead for ByteBlockDevice<D> {
    fn readahead(&self, addr: BlockAddress) {
        let (Ok(offset), Ok(len)) = (self.offset_of(addr), self.block_len()) else {
            trace!(addr = addr.0, "readahead outside device ignored");
            return;
        };
        self.inner.prefetch(offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct MemoryByteDevice {
        bytes: Mutex<Vec<u8>>,
        writable: bool,
    }

    impl MemoryByteDevice {
        fn new(len: usize) -> Self {
            Self {
                bytes: Mutex::new(vec![0_u8; len]),
                writable: true,
            }
        }
    }

    impl ByteDevice for MemoryByteDevice {
        fn len_bytes(&self) -> u64 {
            u64::try_from(self.bytes.lock().len()).unwrap_or(0)
        }

        fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let offset =
                usize::try_from(offset).map_err(|_| FsckError::Format("offset overflow".into()))?;
            let end = offset
                .checked_add(buf.len())
                .ok_or_else(|| FsckError::Format("range overflow".into()))?;
            let bytes = self.bytes.lock();
            if end > bytes.len() {
                return Err(FsckError::Format("oob".into()));
            }
            buf.copy_from_slice(&bytes[offset..end]);
            drop(bytes);
            Ok(())
        }

        fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
            if !self.writable {
                return Err(FsckError::ReadOnly);
            }
            let offset =
                usize::try_from(offset).map_err(|_| FsckError::Format("offset overflow".into()))?;
            let end = offset
                .checked_add(buf.len())
                .ok_or_else(|| FsckError::Format("range overflow".into()))?;
            let mut bytes = self.bytes.lock();
            if end > bytes.len() {
                return Err(FsckError::Format("oob".into()));
            }
            bytes[offset..end].copy_from_slice(buf);
            drop(bytes);
            Ok(())
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }

        fn is_writable(&self) -> bool {
            self.writable
        }
    }

    #[test]
    fn byte_block_device_round_trips() {
        let dev = ByteBlockDevice::with_default_block_size(MemoryByteDevice::new(4096 * 4))
            .expect("device");
        dev.write_block(BlockAddress(2), &[7_u8; 4096])
            .expect("write");
        let read = dev.read_block(BlockAddress(2)).expect("read");
        assert_eq!(read.as_slice(), &[7_u8; 4096]);
        assert_eq!(dev.block_count(), 4);
    }

    #[test]
    fn rejects_out_of_range_and_misaligned_io() {
        let dev = ByteBlockDevice::with_default_block_size(MemoryByteDevice::new(4096 * 2))
            .expect("device");
        assert!(dev.read_block(BlockAddress(2)).is_err());
        assert!(dev.write_block(BlockAddress(0), &[0_u8; 100]).is_err());
        assert!(ByteBlockDevice::new(MemoryByteDevice::new(5000), 4096).is_err());
        assert!(ByteBlockDevice::new(MemoryByteDevice::new(4096), 3000).is_err());
    }

    #[test]
    fn read_only_device_refuses_writes() {
        let mut mem = MemoryByteDevice::new(4096);
        mem.writable = false;
        let dev = ByteBlockDevice::with_default_block_size(mem).expect("device");
        assert!(!dev.is_writable());
        assert!(matches!(
            dev.write_block(BlockAddress(0), &[1_u8; 4096]),
            Err(FsckError::ReadOnly)
        ));
    }

    #[test]
    fn file_device_round_trips_and_prefetches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("image.img");
        std::fs::write(&path, vec![0_u8; 4096 * 3]).expect("create image");

        let dev = ByteBlockDevice::with_default_block_size(FileByteDevice::open(&path).expect("open"))
            .expect("device");
        assert!(dev.is_writable());
        dev.write_block(BlockAddress(1), &[0x42_u8; 4096])
            .expect("write");
        dev.readahead(BlockAddress(1));
        dev.readahead(BlockAddress(99));
        assert_eq!(
            dev.read_block(BlockAddress(1)).expect("read").as_slice(),
            &[0x42_u8; 4096]
        );

        let ro = FileByteDevice::open_read_only(&path).expect("open ro");
        fadvise_willneed(&ro.file, 4096, 4096).expect("advice accepted");
        assert!(!ro.is_writable());
        assert!(matches!(
            ro.write_all_at(0, &[0_u8; 8]),
            Err(FsckError::ReadOnly)
        ));
    }
}
