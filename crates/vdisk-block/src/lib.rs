#![forbid(unsafe_code)]
//! Byte-addressed I/O over a disk image.
//!
//! Every structure in the image lives at a fixed byte offset, so the only
//! device abstraction needed is positional read/write (`pread`/`pwrite`
//! semantics). `FileByteDevice` backs a real image file; `MemByteDevice`
//! keeps the image in memory for tests and tooling.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vdisk_error::{Result, VdiskError};
use vdisk_types::ParseError;

/// Chunk size used when zero-filling large ranges.
const ZERO_CHUNK: usize = 64 * 1024;

/// Byte-addressed device for fixed-offset I/O.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;

    /// Overwrite `len` bytes starting at `offset` with zeros.
    fn zero_range(&self, offset: u64, len: u64) -> Result<()> {
        let zeros = vec![0_u8; ZERO_CHUNK];
        let mut done = 0_u64;
        while done < len {
            let remaining = len - done;
            let step = usize::try_from(remaining).map_or(ZERO_CHUNK, |r| r.min(ZERO_CHUNK));
            let at = offset
                .checked_add(done)
                .ok_or_else(|| VdiskError::InvalidArgument("zero range overflows u64".into()))?;
            self.write_all_at(at, &zeros[..step])?;
            done += step as u64;
        }
        Ok(())
    }
}

/// Read `len` bytes at `offset` into a fresh buffer.
pub fn read_vec(dev: &dyn ByteDevice, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}

/// Map a codec failure on image data at `offset` to `Corruption`.
#[must_use]
pub fn corruption_at(offset: u64) -> impl Fn(ParseError) -> VdiskError {
    move |err| VdiskError::Corruption {
        offset,
        detail: err.to_string(),
    }
}

/// Read `len` bytes at `offset` and decode them with `parse`.
pub fn read_record<T>(
    dev: &dyn ByteDevice,
    offset: u64,
    len: usize,
    parse: impl FnOnce(&[u8]) -> std::result::Result<T, ParseError>,
) -> Result<T> {
    let buf = read_vec(dev, offset, len)?;
    parse(&buf).map_err(corruption_at(offset))
}

fn check_range(op: &str, offset: u64, len: usize, device_len: u64) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| VdiskError::InvalidArgument(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| VdiskError::InvalidArgument(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(VdiskError::Corruption {
            offset,
            detail: format!("{op} out of bounds: len={len} device_len={device_len}"),
        });
    }
    Ok(())
}

/// File-backed byte device using positional I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which does not share a seek position,
/// so one handle can serve every operation on a mounted partition.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    path: PathBuf,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open an existing image, read-write when permitted.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path)
                    .map(|file| (file, false))
            })
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    VdiskError::NotFound(format!("disk image {}", path.display()))
                }
                _ => VdiskError::Io(err),
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            len,
            writable,
        })
    }

    /// Create a new zero-filled image of `len` bytes; fails if it exists.
    pub fn create(path: impl AsRef<Path>, len: u64) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    VdiskError::AlreadyExists(format!("disk image {}", path.display()))
                }
                _ => VdiskError::Io(err),
            })?;
        file.set_len(len)?;
        Ok(Self {
            file: Arc::new(file),
            path: path.to_path_buf(),
            len,
            writable: true,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range("read", offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VdiskError::PermissionDenied(format!(
                "disk image {} is read-only",
                self.path.display()
            )));
        }
        check_range("write", offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_range("read", offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset)
            .map_err(|_| VdiskError::InvalidArgument("offset overflow".into()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_range("write", offset, buf.len(), bytes.len() as u64)?;
        let start = usize::try_from(offset)
            .map_err(|_| VdiskError::InvalidArgument("offset overflow".into()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_round_trips() {
        let dev = MemByteDevice::new(256);
        dev.write_all_at(10, &[7_u8; 8]).expect("write");
        let read = read_vec(&dev, 10, 8).expect("read");
        assert_eq!(read, vec![7_u8; 8]);
    }

    #[test]
    fn mem_device_rejects_out_of_bounds() {
        let dev = MemByteDevice::new(16);
        let err = dev.write_all_at(12, &[1_u8; 8]).unwrap_err();
        assert_eq!(err.to_errno(), libc_eio());
        let mut buf = [0_u8; 4];
        assert!(dev.read_exact_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn zero_range_spans_chunks() {
        let len = ZERO_CHUNK * 2 + 100;
        let dev = MemByteDevice::new(len);
        dev.write_all_at(0, &vec![0xAB_u8; len]).expect("fill");
        dev.zero_range(50, (ZERO_CHUNK + 10) as u64).expect("zero");
        let bytes = dev.snapshot();
        assert_eq!(bytes[49], 0xAB);
        assert!(bytes[50..50 + ZERO_CHUNK + 10].iter().all(|b| *b == 0));
        assert_eq!(bytes[50 + ZERO_CHUNK + 10], 0xAB);
    }

    #[test]
    fn file_device_create_open_and_bounds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("disk.dsk");
        let dev = FileByteDevice::create(&path, 4096).expect("create");
        assert_eq!(dev.len_bytes(), 4096);
        dev.write_all_at(4000, b"tail").expect("write");
        drop(dev);

        let reopened = FileByteDevice::open(&path).expect("open");
        assert_eq!(read_vec(&reopened, 4000, 4).expect("read"), b"tail");
        assert!(reopened.write_all_at(4095, b"xy").is_err());

        let dup = FileByteDevice::create(&path, 10).unwrap_err();
        assert!(matches!(dup, VdiskError::AlreadyExists(_)));
        let missing = FileByteDevice::open(dir.path().join("missing.dsk")).unwrap_err();
        assert!(matches!(missing, VdiskError::NotFound(_)));
    }

    #[test]
    fn read_record_maps_decode_failures_to_corruption() {
        let dev = MemByteDevice::new(32);
        dev.write_all_at(8, &[1, 0, 0, 0]).expect("write");
        let value = read_record(&dev, 8, 4, |b| vdisk_types::read_le_i32(b, 0)).expect("read");
        assert_eq!(value, 1);

        let err = read_record(&dev, 20, 4, |b| vdisk_types::read_le_i32(b, 2)).unwrap_err();
        match err {
            VdiskError::Corruption { offset, .. } => assert_eq!(offset, 20),
            other => panic!("expected corruption, got {other:?}"),
        }
    }

    fn libc_eio() -> i32 {
        VdiskError::Corruption {
            offset: 0,
            detail: String::new(),
        }
        .to_errno()
    }
}
