//! Buffer partitioning: per-rank slices, per-ring splits and NIC send sizes.
//!
//! Everything here is pure arithmetic over byte offsets.

use crate::error::{CollexError, Result};

/// Minimum alignment of a ring's share of a segment.
pub const MIN_SLICE_ALIGN: usize = 128;

/// One rank's or one ring's share of a buffer, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Slice {
    pub offset: usize,
    pub size: usize,
}

impl Slice {
    pub const fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.size
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Round `value` up to a multiple of `divisor`.
pub const fn round_up(value: usize, divisor: usize) -> usize {
    if divisor == 0 {
        return value;
    }
    value.div_ceil(divisor) * divisor
}

/// Split `count * unit` bytes into `slice_num` aligned slices.
///
/// Every slice except the trailing ones is `round_up(ceil(total / n), 128)`
/// bytes; once the data runs out, the remaining slices are empty and sit at
/// `offset = total`.
pub fn prepare_slice_data(count: usize, unit: usize, slice_num: usize) -> Result<Vec<Slice>> {
    if slice_num == 0 {
        return Err(CollexError::param("slice number is zero"));
    }
    let total = count * unit;
    let per = round_up(total.div_ceil(slice_num), MIN_SLICE_ALIGN);
    let mut slices = Vec::with_capacity(slice_num);
    let mut residue = total;
    for _ in 0..slice_num {
        let size = per.min(residue);
        slices.push(Slice::new(total - residue, size));
        residue -= size;
    }
    Ok(slices)
}

/// Equal per-rank slices of `count * unit` bytes each, laid end to end.
///
/// Used for all-gather outputs and reduce-scatter inputs where every rank
/// owns one block.
pub fn rank_slices(count: usize, unit: usize, rank_size: usize) -> Result<Vec<Slice>> {
    if rank_size == 0 {
        return Err(CollexError::param("rank size is zero"));
    }
    let size = count * unit;
    Ok((0..rank_size).map(|i| Slice::new(i * size, size)).collect())
}

/// Split every segment into `ring_count` aligned pieces.
///
/// Returns `[segment][ring]`. Segments too small to fill every ring are
/// padded with empty slices at the segment start.
pub fn multi_seg_slices(segments: &[Slice], ring_count: usize) -> Result<Vec<Vec<Slice>>> {
    if ring_count == 0 {
        return Err(CollexError::param("ring count is zero"));
    }
    let mut out = Vec::with_capacity(segments.len());
    for seg in segments {
        let mut pieces = Vec::with_capacity(ring_count);
        if seg.size > 0 {
            let per_ring = round_up(seg.size.div_ceil(ring_count), MIN_SLICE_ALIGN);
            let mut residue = seg.size;
            while residue > 0 {
                let size = per_ring.min(residue);
                if size == 0 {
                    return Err(CollexError::internal(format!(
                        "segment at offset {} produced an empty ring piece",
                        seg.offset
                    )));
                }
                pieces.push(Slice::new(seg.offset + seg.size - residue, size));
                residue -= size;
            }
        }
        while pieces.len() < ring_count {
            pieces.push(Slice::new(seg.offset, 0));
        }
        out.push(pieces);
    }
    Ok(out)
}

/// Put each whole segment on the last ring; the other rings carry nothing.
///
/// Used when concurrent writes by several copy engines into one segment
/// must be avoided.
pub fn multi_seg_slices_last_ring(segments: &[Slice], ring_count: usize) -> Result<Vec<Vec<Slice>>> {
    if ring_count == 0 {
        return Err(CollexError::param("ring count is zero"));
    }
    Ok(segments
        .iter()
        .map(|seg| {
            (0..ring_count)
                .map(|r| if r + 1 < ring_count { Slice::default() } else { *seg })
                .collect()
        })
        .collect())
}

/// Bytes each NIC sends, summed over its `chunk_size` segments and all rings.
///
/// `seg_slices` is `[segment][ring]`; NIC `i` owns segments
/// `i * chunk_size .. (i + 1) * chunk_size`.
pub fn nic_send_sizes(
    seg_slices: &[Vec<Slice>],
    nic_count: usize,
    chunk_size: usize,
) -> Result<Vec<usize>> {
    let mut sizes = Vec::with_capacity(nic_count);
    for nic in 0..nic_count {
        let mut total = 0;
        for chunk in 0..chunk_size {
            let seg = seg_slices.get(nic * chunk_size + chunk).ok_or_else(|| {
                CollexError::internal(format!(
                    "nic {nic} chunk {chunk} is past the {} segments",
                    seg_slices.len()
                ))
            })?;
            total += seg.iter().map(|s| s.size).sum::<usize>();
        }
        sizes.push(total);
    }
    Ok(sizes)
}

/// Result of splitting segments across rings ordered by device id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiRingSlices {
    /// `[ring][ring position]` slices, one per NIC-bearing position.
    pub slices: Vec<Vec<Slice>>,
    /// For each ring, the ring positions whose device owns a NIC.
    pub ring_nics: Vec<Vec<usize>>,
    /// Bytes each NIC sends, indexed like the sorted NIC list.
    pub nic_send_sizes: Vec<usize>,
}

/// Spread per-device segments over several rings.
///
/// `orders[r]` lists the device ids of ring `r` in ring order. Only devices
/// present in `nic_list` contribute slices; each contributes `chunk_size =
/// ring_ranks / nic_list.len()` consecutive segments.
pub fn prepare_multi_ring_slice(
    segments: &[Slice],
    orders: &[Vec<u32>],
    nic_list: &[u32],
    avoid_rewrite: bool,
) -> Result<MultiRingSlices> {
    let ring_count = orders.len();
    if ring_count <= 1 {
        return Err(CollexError::internal(format!(
            "multi-ring split needs at least two rings, got {ring_count}"
        )));
    }
    if nic_list.is_empty() {
        return Err(CollexError::param("nic list is empty"));
    }
    let mut nics = nic_list.to_vec();
    nics.sort_unstable();

    let ring_ranks = orders[0].len();
    let seg_slices = if avoid_rewrite {
        multi_seg_slices_last_ring(segments, ring_count)?
    } else {
        multi_seg_slices(segments, ring_count)?
    };
    let chunk_size = ring_ranks / nics.len();
    let sizes = nic_send_sizes(&seg_slices, nics.len(), chunk_size)?;

    let mut slices = Vec::with_capacity(ring_count);
    let mut ring_nics = Vec::with_capacity(ring_count);
    for (ring, order) in orders.iter().enumerate() {
        let mut ring_slices = Vec::with_capacity(ring_ranks);
        let mut positions = Vec::new();
        for (pos, device) in order.iter().enumerate() {
            let Some(nic_pos) = nics.iter().position(|n| n == device) else {
                continue;
            };
            positions.push(pos);
            for chunk in 0..chunk_size {
                let seg = seg_slices.get(nic_pos * chunk_size + chunk).ok_or_else(|| {
                    CollexError::internal(format!("segment {} missing", nic_pos * chunk_size + chunk))
                })?;
                ring_slices.push(seg[ring]);
            }
        }
        slices.push(ring_slices);
        ring_nics.push(positions);
    }

    Ok(MultiRingSlices {
        slices,
        ring_nics,
        nic_send_sizes: sizes,
    })
}

/// Check that `slices` cover `[0, total)` without overlap, ignoring empty ones.
pub fn check_partition(slices: &[Slice], total: usize) -> Result<()> {
    let mut live: Vec<Slice> = slices.iter().copied().filter(|s| s.size > 0).collect();
    live.sort_by_key(|s| s.offset);
    let mut cursor = 0;
    for s in &live {
        if s.offset != cursor {
            return Err(CollexError::internal(format!(
                "slice at {} leaves a gap or overlap at {cursor}",
                s.offset
            )));
        }
        cursor = s.end();
    }
    if cursor != total {
        return Err(CollexError::internal(format!(
            "slices sum to {cursor} bytes, expected {total}"
        )));
    }
    Ok(())
}

/// Number of elements handled by each loop iteration.
///
/// Yields `ceil(count / max_per_loop)` values summing to `count`.
pub fn loop_counts(count: usize, max_per_loop: usize) -> Result<Vec<usize>> {
    if max_per_loop == 0 {
        return Err(CollexError::param("transit buffer holds zero elements"));
    }
    let mut counts = Vec::with_capacity(count.div_ceil(max_per_loop));
    let mut remaining = count;
    while remaining > 0 {
        let cur = remaining.min(max_per_loop);
        counts.push(cur);
        remaining -= cur;
    }
    Ok(counts)
}
