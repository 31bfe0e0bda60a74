//! Halving-doubling and binomial-tree kernels.
//!
//! Non-power-of-two planes fold the surplus ranks into their even
//! neighbours first, run the power-of-two core, then unfold.

use crate::algorithm::nhr::bruck_all_gather_steps;
use crate::algorithm::{KernelArgs, SubAlgorithm, kernel_struct, prepared};
use crate::device::{DeviceMem, Stream, copy_async};
use crate::error::Result;
use crate::resource::SubCommView;
use crate::transport::Direction;

fn largest_pow2_le(n: usize) -> usize {
    if n == 0 {
        return 0;
    }
    1 << (usize::BITS - 1 - n.leading_zeros())
}

/// Whole-buffer all-reduce of `buf` by recursive doubling.
fn all_reduce_whole(args: &KernelArgs, buf: &DeviceMem, view: &SubCommView, stream: &Stream) -> Result<()> {
    let n = view.rank_size as usize;
    if n <= 1 {
        return Ok(());
    }
    let me = view.local_rank as usize;
    let p = largest_pow2_le(n);
    let rem = n - p;

    // fold
    let core_rank = if me < 2 * rem {
        if me % 2 == 0 {
            view.link(me as u32 + 1)?
                .transfer_async(Direction::Tx, buf, stream)?;
            None
        } else {
            args.recv_reduce(view.link(me as u32 - 1)?, buf, stream)?;
            Some(me / 2)
        }
    } else {
        Some(me - rem)
    };

    if let Some(v) = core_rank {
        let real = |c: usize| if c < rem { 2 * c + 1 } else { c + rem };
        let mut d = 1;
        while d < p {
            let partner = real(v ^ d) as u32;
            let link = view.link(partner)?;
            link.transfer_async(Direction::Tx, buf, stream)?;
            args.recv_reduce(link, buf, stream)?;
            d <<= 1;
        }
    }

    // unfold
    if me < 2 * rem {
        if me % 2 == 1 {
            view.link(me as u32 - 1)?
                .transfer_async(Direction::Tx, buf, stream)?;
        } else {
            view.link(me as u32 + 1)?
                .transfer_async(Direction::Rx, buf, stream)?;
        }
    }
    Ok(())
}

kernel_struct!(
    /// Recursive-doubling all-reduce of the whole buffer into the output.
    HdAllReduce
);

impl SubAlgorithm for HdAllReduce {
    fn name(&self) -> &'static str {
        "hd_all_reduce"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        args.reduce_op()?;
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        copy_async(&args.output, &args.input, stream)?;
        all_reduce_whole(args, &args.output, view, stream)
    }
}

kernel_struct!(
    /// All-reduce of the input in place, then the owned slice to the output.
    HdReduceScatter
);

impl SubAlgorithm for HdReduceScatter {
    fn name(&self) -> &'static str {
        "hd_reduce_scatter"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        args.reduce_op()?;
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        args.check_layout(view.rank_size as usize)?;
        all_reduce_whole(args, &args.input, view, stream)?;
        if !args.input.ptr_eq(&args.output) {
            for s in args.owned_by(view.local_rank as usize) {
                copy_async(&args.out_window(s)?, &args.in_window(s)?, stream)?;
            }
        }
        Ok(())
    }
}

kernel_struct!(
    /// Recursive doubling on power-of-two planes, Bruck otherwise.
    HdAllGather
);

impl SubAlgorithm for HdAllGather {
    fn name(&self) -> &'static str {
        "hd_all_gather"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        let n = view.rank_size as usize;
        args.check_layout(n)?;
        if n <= 1 {
            return Ok(());
        }
        if !n.is_power_of_two() {
            return bruck_all_gather_steps(args, view, stream);
        }
        let me = view.local_rank as usize;
        let mut d = 1;
        while d < n {
            let partner = me ^ d;
            let link = view.link(partner as u32)?;
            let mine = (me / d) * d;
            let theirs = (partner / d) * d;
            for k in mine..mine + d {
                link.transfer_async(Direction::Tx, &args.out_window(args.slices[k])?, stream)?;
            }
            for k in theirs..theirs + d {
                link.transfer_async(Direction::Rx, &args.out_window(args.slices[k])?, stream)?;
            }
            d <<= 1;
        }
        Ok(())
    }
}

kernel_struct!(
    /// Binomial-tree broadcast of the output buffer from the root.
    TreeBroadcast
);

impl SubAlgorithm for TreeBroadcast {
    fn name(&self) -> &'static str {
        "tree_broadcast"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        let n = view.rank_size as usize;
        if n <= 1 {
            return Ok(());
        }
        let root = args.root as usize;
        let v = (view.local_rank as usize + n - root) % n;
        let real = |x: usize| ((x + root) % n) as u32;

        let mut mask = 1;
        while mask < n {
            if v & mask != 0 {
                view.link(real(v - mask))?
                    .transfer_async(Direction::Rx, &args.output, stream)?;
                break;
            }
            mask <<= 1;
        }
        mask >>= 1;
        while mask > 0 {
            if v + mask < n {
                view.link(real(v + mask))?
                    .transfer_async(Direction::Tx, &args.output, stream)?;
            }
            mask >>= 1;
        }
        Ok(())
    }
}

kernel_struct!(
    /// Binomial-tree reduce into the root's output.
    TreeReduce
);

impl SubAlgorithm for TreeReduce {
    fn name(&self) -> &'static str {
        "tree_reduce"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        args.reduce_op()?;
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        copy_async(&args.output, &args.input, stream)?;
        let n = view.rank_size as usize;
        if n <= 1 {
            return Ok(());
        }
        let root = args.root as usize;
        let v = (view.local_rank as usize + n - root) % n;
        let real = |x: usize| ((x + root) % n) as u32;

        let mut mask = 1;
        while mask < n {
            if v & mask == 0 {
                let child = v | mask;
                if child < n {
                    args.recv_reduce(view.link(real(child))?, &args.output, stream)?;
                }
            } else {
                view.link(real(v - mask))?
                    .transfer_async(Direction::Tx, &args.output, stream)?;
                break;
            }
            mask <<= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::testing::{f32_bytes, f32_values, run_all};
    use crate::slice::rank_slices;
    use crate::types::{DataType, ReduceOp};

    #[test]
    fn test_largest_pow2() {
        assert_eq!(largest_pow2_le(1), 1);
        assert_eq!(largest_pow2_le(6), 4);
        assert_eq!(largest_pow2_le(8), 8);
    }

    #[tokio::test]
    async fn test_hd_all_reduce_any_size() {
        for n in [2u32, 3, 5, 6, 8] {
            let ins: Vec<DeviceMem> = (0..n)
                .map(|r| DeviceMem::from_vec(f32_bytes(&[r as f32, 1.0])))
                .collect();
            let outs: Vec<DeviceMem> = (0..n).map(|_| DeviceMem::alloc(8)).collect();
            run_all(n, || Box::new(HdAllReduce::new()), |r| {
                KernelArgs::new(ins[r as usize].clone(), outs[r as usize].clone(), DataType::F32)
                    .reduce(ReduceOp::Sum)
            })
            .await;
            let expect = vec![(0..n).sum::<u32>() as f32, n as f32];
            for o in &outs {
                assert_eq!(f32_values(&o.read().unwrap()), expect, "n = {n}");
            }
        }
    }

    #[tokio::test]
    async fn test_hd_all_gather_pow2_and_not() {
        for n in [4u32, 6] {
            let outs: Vec<DeviceMem> = (0..n).map(|_| DeviceMem::alloc(2 * n as usize)).collect();
            for (r, o) in outs.iter().enumerate() {
                o.range(r * 2, 2).unwrap().write(&[r as u8; 2]).unwrap();
            }
            run_all(n, || Box::new(HdAllGather::new()), |r| {
                let o = outs[r as usize].clone();
                KernelArgs::new(o.clone(), o, DataType::U8).slices(rank_slices(2, 1, n as usize).unwrap())
            })
            .await;
            for o in &outs {
                let b = o.read().unwrap();
                for r in 0..n as usize {
                    assert_eq!(&b[r * 2..r * 2 + 2], &[r as u8; 2]);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_tree_broadcast_and_reduce() {
        let n = 7u32;
        let bufs: Vec<DeviceMem> = (0..n)
            .map(|r| DeviceMem::from_vec(vec![if r == 4 { 3 } else { 0 }; 5]))
            .collect();
        run_all(n, || Box::new(TreeBroadcast::new()), |r| {
            let b = bufs[r as usize].clone();
            KernelArgs::new(b.clone(), b, DataType::U8).root(4)
        })
        .await;
        for b in &bufs {
            assert_eq!(b.read().unwrap(), vec![3; 5]);
        }

        let ins: Vec<DeviceMem> = (0..n).map(|r| DeviceMem::from_vec(f32_bytes(&[r as f32 + 1.0]))).collect();
        let outs: Vec<DeviceMem> = (0..n).map(|_| DeviceMem::alloc(4)).collect();
        run_all(n, || Box::new(TreeReduce::new()), |r| {
            KernelArgs::new(ins[r as usize].clone(), outs[r as usize].clone(), DataType::F32)
                .reduce(ReduceOp::Sum)
                .root(5)
        })
        .await;
        assert_eq!(f32_values(&outs[5].read().unwrap()), vec![28.0]);
    }

    #[tokio::test]
    async fn test_hd_reduce_scatter() {
        let n = 3u32;
        let ins: Vec<DeviceMem> = (0..n).map(|_| DeviceMem::from_vec(f32_bytes(&[1.0; 3]))).collect();
        let outs: Vec<DeviceMem> = (0..n).map(|_| DeviceMem::alloc(12)).collect();
        run_all(n, || Box::new(HdReduceScatter::new()), |r| {
            KernelArgs::new(ins[r as usize].clone(), outs[r as usize].clone(), DataType::F32)
                .slices(rank_slices(1, 4, 3).unwrap())
                .reduce(ReduceOp::Sum)
        })
        .await;
        for (r, o) in outs.iter().enumerate() {
            assert_eq!(f32_values(&o.range(r * 4, 4).unwrap().read().unwrap()), vec![3.0]);
        }
    }
}
