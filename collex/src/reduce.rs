//! Element-wise reduction primitives used by the reduce-type kernels and the
//! host-emulated links' reduce-on-receive path.

use crate::error::{CollexError, Result};
use crate::types::{DataType, ReduceOp};

/// Inline reduce is usable for this (dtype, op) pair.
pub const INLINE_REDUCE_BIT: u64 = 1 << 0;
/// RDMA reduce is usable for this (dtype, op) pair.
pub const RDMA_REDUCE_BIT: u64 = 1 << 1;

/// Trait for types that support the four reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Little-endian element access on unaligned byte slices.
trait LeBytes: Sized {
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }
                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64);

/// Element-wise reduce `src` into `dst`, both interpreted as `dtype` elements.
///
/// Both slices must have the same length, a multiple of the element size.
pub(crate) fn reduce_slice(dst: &mut [u8], src: &[u8], dtype: DataType, op: ReduceOp) -> Result<()> {
    if dst.len() != src.len() || dst.len() % dtype.size_in_bytes() != 0 {
        return Err(CollexError::BufferSizeMismatch {
            expected: dst.len() as u64,
            actual: src.len() as u64,
        });
    }
    match dtype {
        DataType::F32 => reduce_slice_typed::<f32>(dst, src, op),
        DataType::F64 => reduce_slice_typed::<f64>(dst, src, op),
        DataType::I32 => reduce_slice_typed::<i32>(dst, src, op),
        DataType::I64 => reduce_slice_typed::<i64>(dst, src, op),
        DataType::U32 => reduce_slice_typed::<u32>(dst, src, op),
        DataType::U64 => reduce_slice_typed::<u64>(dst, src, op),
        DataType::I8 => reduce_slice_typed::<i8>(dst, src, op),
        DataType::U8 => reduce_slice_typed::<u8>(dst, src, op),
        _ => {
            return Err(CollexError::UnsupportedDType {
                dtype,
                op: "reduce",
            });
        }
    }
    Ok(())
}

fn reduce_slice_typed<T: Reducible + LeBytes>(dst: &mut [u8], src: &[u8], op: ReduceOp) {
    let t_size = std::mem::size_of::<T>();
    for (d, s) in dst.chunks_exact_mut(t_size).zip(src.chunks_exact(t_size)) {
        let r = T::reduce(T::read_le(d), T::read_le(s), op);
        r.write_le(d);
    }
}

/// Whether the host reducer handles `dtype` at all.
pub fn is_reducible(dtype: DataType) -> bool {
    !matches!(dtype, DataType::F16 | DataType::BF16)
}

/// Whether the copy engine can reduce this pair inline during a transfer.
///
/// Products and 64-bit types go through a separate compute pass.
pub fn inline_reduce_supported(dtype: DataType, op: ReduceOp) -> bool {
    is_reducible(dtype)
        && op != ReduceOp::Prod
        && !matches!(dtype, DataType::F64 | DataType::I64 | DataType::U64)
}

/// Whether the NIC can reduce this pair on RDMA write.
pub fn rdma_reduce_supported(dtype: DataType, op: ReduceOp) -> bool {
    op == ReduceOp::Sum && matches!(dtype, DataType::F32 | DataType::I32)
}

/// Reduce attribute bits for a reduce-type kernel.
pub fn reduce_attr(dtype: DataType, op: ReduceOp, inline_enabled: bool) -> u64 {
    let mut attr = 0;
    if inline_enabled && inline_reduce_supported(dtype, op) {
        attr |= INLINE_REDUCE_BIT;
    }
    if rdma_reduce_supported(dtype, op) {
        attr |= RDMA_REDUCE_BIT;
    }
    attr
}
