use crate::device::stream::Stream;
use crate::error::{CollexError, Result};
use crate::reduce::reduce_slice;
use crate::types::{DataType, ReduceOp};
use std::sync::{Arc, Mutex, MutexGuard};

/// A window onto a shared device allocation.
///
/// Cloning is cheap and yields a handle to the same bytes. Sub-windows made
/// with [`DeviceMem::range`] alias the parent allocation, so a kernel can
/// address one slice of a transit buffer while another stream works on a
/// neighbouring slice.
#[derive(Clone)]
pub struct DeviceMem {
    buf: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for DeviceMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMem")
            .field("alloc", &Arc::as_ptr(&self.buf))
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl DeviceMem {
    /// Allocate `size` zeroed bytes.
    pub fn alloc(size: usize) -> Self {
        Self::from_vec(vec![0u8; size])
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            buf: Arc::new(Mutex::new(data)),
            offset: 0,
            len,
        }
    }

    pub fn size(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this window inside its allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Sub-window `[offset, offset + len)` relative to this window.
    pub fn range(&self, offset: usize, len: usize) -> Result<DeviceMem> {
        let end = offset.checked_add(len).ok_or_else(|| {
            CollexError::internal(format!("window offset {offset} + {len} overflows"))
        })?;
        if end > self.len {
            return Err(CollexError::internal(format!(
                "window [{offset}, {end}) exceeds {} bytes",
                self.len
            )));
        }
        Ok(Self {
            buf: Arc::clone(&self.buf),
            offset: self.offset + offset,
            len,
        })
    }

    /// Same allocation, same window.
    pub fn ptr_eq(&self, other: &DeviceMem) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf) && self.offset == other.offset && self.len == other.len
    }

    /// Same underlying allocation, any window.
    pub fn same_alloc(&self, other: &DeviceMem) -> bool {
        Arc::ptr_eq(&self.buf, &other.buf)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<u8>>> {
        self.buf
            .lock()
            .map_err(|_| CollexError::LockPoisoned("device memory"))
    }

    /// Copy the window out to host memory.
    pub fn read(&self) -> Result<Vec<u8>> {
        let guard = self.lock()?;
        Ok(guard[self.offset..self.offset + self.len].to_vec())
    }

    /// Overwrite the whole window. `data` must be exactly the window size.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.len {
            return Err(CollexError::BufferSizeMismatch {
                expected: self.len as u64,
                actual: data.len() as u64,
            });
        }
        let mut guard = self.lock()?;
        guard[self.offset..self.offset + self.len].copy_from_slice(data);
        Ok(())
    }

    /// Synchronous window-to-window copy of equal sizes.
    pub fn copy_from(&self, src: &DeviceMem) -> Result<()> {
        if src.len != self.len {
            return Err(CollexError::BufferSizeMismatch {
                expected: self.len as u64,
                actual: src.len as u64,
            });
        }
        if self.len == 0 {
            return Ok(());
        }
        if Arc::ptr_eq(&self.buf, &src.buf) {
            let mut guard = self.lock()?;
            guard.copy_within(src.offset..src.offset + src.len, self.offset);
            return Ok(());
        }
        let data = src.read()?;
        self.write(&data)
    }

    /// `window[i] = op(window[i], data[i])`, element-wise, under one lock.
    pub fn reduce_with(&self, data: &[u8], dtype: DataType, op: ReduceOp) -> Result<()> {
        let mut guard = self.lock()?;
        reduce_slice(
            &mut guard[self.offset..self.offset + self.len],
            data,
            dtype,
            op,
        )
    }

    /// Reduce another window into this one.
    pub fn reduce_from(&self, src: &DeviceMem, dtype: DataType, op: ReduceOp) -> Result<()> {
        let data = src.read()?;
        self.reduce_with(&data, dtype, op)
    }
}

/// Enqueue `dst <- src` on `stream`.
pub fn copy_async(dst: &DeviceMem, src: &DeviceMem, stream: &Stream) -> Result<()> {
    if dst.size() != src.size() {
        return Err(CollexError::BufferSizeMismatch {
            expected: dst.size() as u64,
            actual: src.size() as u64,
        });
    }
    if dst.ptr_eq(src) || dst.is_empty() {
        return Ok(());
    }
    let (dst, src) = (dst.clone(), src.clone());
    stream.enqueue("memcpy", async move { dst.copy_from(&src) })
}

/// Enqueue `dst <- op(dst, src)` on `stream`.
pub fn reduce_async(
    dst: &DeviceMem,
    src: &DeviceMem,
    dtype: DataType,
    op: ReduceOp,
    stream: &Stream,
) -> Result<()> {
    if dst.size() != src.size() {
        return Err(CollexError::BufferSizeMismatch {
            expected: dst.size() as u64,
            actual: src.size() as u64,
        });
    }
    let (dst, src) = (dst.clone(), src.clone());
    stream.enqueue("local_reduce", async move { dst.reduce_from(&src, dtype, op) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_aliases_parent() {
        let mem = DeviceMem::alloc(16);
        let tail = mem.range(8, 8).unwrap();
        tail.write(&[7u8; 8]).unwrap();
        let all = mem.read().unwrap();
        assert_eq!(&all[..8], &[0u8; 8]);
        assert_eq!(&all[8..], &[7u8; 8]);
        assert!(tail.same_alloc(&mem));
        assert!(!tail.ptr_eq(&mem));
    }

    #[test]
    fn test_range_out_of_bounds() {
        let mem = DeviceMem::alloc(16);
        assert!(mem.range(8, 9).is_err());
        assert!(mem.range(4, 8).unwrap().range(4, 5).is_err());
    }

    #[test]
    fn test_copy_within_one_alloc() {
        let mem = DeviceMem::from_vec((0u8..8).collect());
        let lo = mem.range(0, 4).unwrap();
        let hi = mem.range(4, 4).unwrap();
        hi.copy_from(&lo).unwrap();
        assert_eq!(mem.read().unwrap(), vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_write_size_checked() {
        let mem = DeviceMem::alloc(4);
        assert!(matches!(
            mem.write(&[1, 2, 3]),
            Err(CollexError::BufferSizeMismatch { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_reduce_with_sum() {
        let a: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let b: Vec<u8> = [10.0f32, 20.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mem = DeviceMem::from_vec(a);
        mem.reduce_with(&b, DataType::F32, ReduceOp::Sum).unwrap();
        let out = mem.read().unwrap();
        assert_eq!(f32::from_le_bytes(out[0..4].try_into().unwrap()), 11.0);
        assert_eq!(f32::from_le_bytes(out[4..8].try_into().unwrap()), 22.0);
    }
}
