//! Log-step kernels for any plane size (Bruck-style).
//!
//! Blocks are addressed relative to the local rank: relative block `j` is
//! slice `(me + j) % n`. Data stays at its absolute offset, so no final
//! rotation is needed.

use crate::algorithm::{KernelArgs, SubAlgorithm, kernel_struct, prepared};
use crate::device::{DeviceMem, Stream, copy_async};
use crate::error::Result;
use crate::resource::SubCommView;
use crate::transport::Direction;

/// Distances `1, 2, 4, ...` below `n`.
fn distances(n: usize) -> Vec<usize> {
    let mut out = Vec::new();
    let mut d = 1;
    while d < n {
        out.push(d);
        d <<= 1;
    }
    out
}

pub(crate) fn bruck_all_gather_steps(args: &KernelArgs, view: &SubCommView, stream: &Stream) -> Result<()> {
    bruck_all_gather_in(args, &args.output, view, stream)
}

fn bruck_all_gather_in(args: &KernelArgs, buf: &DeviceMem, view: &SubCommView, stream: &Stream) -> Result<()> {
    let n = view.rank_size as usize;
    let me = view.local_rank as usize;
    let window = |j: usize| {
        let s = args.slices[(me + j) % n];
        buf.range(s.offset, s.size)
    };
    for d in distances(n) {
        let cnt = d.min(n - d);
        let to = view.link(((me + n - d) % n) as u32)?;
        let from = view.link(((me + d) % n) as u32)?;
        for j in 0..cnt {
            to.transfer_async(Direction::Tx, &window(j)?, stream)?;
        }
        for j in 0..cnt {
            from.transfer_async(Direction::Rx, &window(d + j)?, stream)?;
        }
    }
    Ok(())
}

/// Reverse of the Bruck all-gather: distances walked downwards, partial
/// sums flowing the other way. Relative block 0 ends fully reduced.
fn bruck_reduce_scatter_in(args: &KernelArgs, buf: &DeviceMem, view: &SubCommView, stream: &Stream) -> Result<()> {
    let n = view.rank_size as usize;
    let me = view.local_rank as usize;
    let window = |j: usize| {
        let s = args.slices[(me + j) % n];
        buf.range(s.offset, s.size)
    };
    for d in distances(n).into_iter().rev() {
        let cnt = d.min(n - d);
        let to = view.link(((me + d) % n) as u32)?;
        let from = view.link(((me + n - d) % n) as u32)?;
        for j in 0..cnt {
            to.transfer_async(Direction::Tx, &window(d + j)?, stream)?;
        }
        for j in 0..cnt {
            args.recv_reduce(from, &window(j)?, stream)?;
        }
    }
    Ok(())
}

kernel_struct!(BruckAllGather);

impl SubAlgorithm for BruckAllGather {
    fn name(&self) -> &'static str {
        "bruck_all_gather"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        args.check_layout(view.rank_size as usize)?;
        bruck_all_gather_steps(args, view, stream)
    }
}

kernel_struct!(
    /// Reduces in place in the input; the owned slice is copied to output.
    BruckReduceScatter
);

impl SubAlgorithm for BruckReduceScatter {
    fn name(&self) -> &'static str {
        "bruck_reduce_scatter"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        args.reduce_op()?;
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        args.check_layout(view.rank_size as usize)?;
        bruck_reduce_scatter_in(args, &args.input, view, stream)?;
        if !args.input.ptr_eq(&args.output) {
            let s = args.slices[view.local_rank as usize];
            copy_async(&args.out_window(s)?, &args.in_window(s)?, stream)?;
        }
        Ok(())
    }
}

kernel_struct!(
    /// Log-step reduce-scatter then all-gather in the output.
    NhrAllReduce
);

impl SubAlgorithm for NhrAllReduce {
    fn name(&self) -> &'static str {
        "nhr_all_reduce"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        args.reduce_op()?;
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        args.check_layout(view.rank_size as usize)?;
        copy_async(&args.output, &args.input, stream)?;
        bruck_reduce_scatter_in(args, &args.output, view, stream)?;
        bruck_all_gather_in(args, &args.output, view, stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::testing::{f32_bytes, f32_values, run_all};
    use crate::slice::{Slice, rank_slices};
    use crate::types::{DataType, ReduceOp};

    #[test]
    fn test_distances() {
        assert_eq!(distances(1), Vec::<usize>::new());
        assert_eq!(distances(5), vec![1, 2, 4]);
        assert_eq!(distances(8), vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_bruck_reduce_scatter_sizes() {
        for n in [2u32, 3, 4, 5, 7] {
            let ins: Vec<DeviceMem> = (0..n)
                .map(|r| {
                    let v: Vec<f32> = (0..n).map(|b| (r * 100 + b) as f32).collect();
                    DeviceMem::from_vec(f32_bytes(&v))
                })
                .collect();
            let outs: Vec<DeviceMem> = (0..n).map(|_| DeviceMem::alloc(4 * n as usize)).collect();
            run_all(n, || Box::new(BruckReduceScatter::new()), |r| {
                KernelArgs::new(ins[r as usize].clone(), outs[r as usize].clone(), DataType::F32)
                    .slices(rank_slices(1, 4, n as usize).unwrap())
                    .reduce(ReduceOp::Sum)
            })
            .await;
            for (b, o) in outs.iter().enumerate() {
                let got = f32_values(&o.range(b * 4, 4).unwrap().read().unwrap())[0];
                let want: u32 = (0..n).map(|r| r * 100 + b as u32).sum();
                assert_eq!(got, want as f32, "n = {n}, block {b}");
            }
        }
    }

    #[tokio::test]
    async fn test_nhr_all_reduce_uneven() {
        let n = 5u32;
        let slices = vec![
            Slice::new(0, 8),
            Slice::new(8, 4),
            Slice::new(12, 0),
            Slice::new(12, 8),
            Slice::new(20, 4),
        ];
        let ins: Vec<DeviceMem> = (0..n).map(|r| DeviceMem::from_vec(f32_bytes(&[r as f32; 6]))).collect();
        let outs: Vec<DeviceMem> = (0..n).map(|_| DeviceMem::alloc(24)).collect();
        run_all(n, || Box::new(NhrAllReduce::new()), |r| {
            KernelArgs::new(ins[r as usize].clone(), outs[r as usize].clone(), DataType::F32)
                .slices(slices.clone())
                .reduce(ReduceOp::Sum)
        })
        .await;
        for o in &outs {
            assert_eq!(f32_values(&o.read().unwrap()), vec![10.0; 6]);
        }
    }
}
