//! Ring kernels.
//!
//! Slices may be owned by ring positions other than their index (several
//! slices per position, or none), which is how rings that only pass
//! through NIC-bearing devices are expressed.

use crate::algorithm::{KernelArgs, SubAlgorithm, kernel_struct, prepared};
use crate::device::{DeviceMem, Stream, copy_async};
use crate::error::Result;
use crate::resource::SubCommView;
use crate::transport::Direction;

/// Each position ends up with the fully reduced slices it owns, in `buf`.
fn reduce_scatter_steps(args: &KernelArgs, buf: &DeviceMem, view: &SubCommView, stream: &Stream) -> Result<()> {
    let n = view.rank_size as usize;
    let me = view.local_rank as usize;
    let next = view.link(view.next())?;
    let prev = view.link(view.prev())?;
    for step in 0..n - 1 {
        let send_owner = (me + 2 * n - step - 1) % n;
        let recv_owner = (me + 2 * n - step - 2) % n;
        for s in args.owned_by(send_owner) {
            next.transfer_async(Direction::Tx, &buf.range(s.offset, s.size)?, stream)?;
        }
        for s in args.owned_by(recv_owner) {
            args.recv_reduce(prev, &buf.range(s.offset, s.size)?, stream)?;
        }
    }
    Ok(())
}

/// Every position ends up with every slice, in `buf`.
fn all_gather_steps(args: &KernelArgs, buf: &DeviceMem, view: &SubCommView, stream: &Stream) -> Result<()> {
    let n = view.rank_size as usize;
    let me = view.local_rank as usize;
    let next = view.link(view.next())?;
    let prev = view.link(view.prev())?;
    for step in 0..n - 1 {
        let send_owner = (me + n - step) % n;
        let recv_owner = (me + n - step - 1) % n;
        for s in args.owned_by(send_owner) {
            next.transfer_async(Direction::Tx, &buf.range(s.offset, s.size)?, stream)?;
        }
        for s in args.owned_by(recv_owner) {
            prev.transfer_async(Direction::Rx, &buf.range(s.offset, s.size)?, stream)?;
        }
    }
    Ok(())
}

kernel_struct!(
    /// Output holds this position's slices on entry and every slice on exit.
    RingAllGather
);

impl SubAlgorithm for RingAllGather {
    fn name(&self) -> &'static str {
        "ring_all_gather"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        args.check_layout(view.rank_size as usize)?;
        if view.rank_size <= 1 {
            return Ok(());
        }
        all_gather_steps(args, &args.output, view, stream)
    }
}

kernel_struct!(
    /// Reduces in place in the input, then copies owned slices to output.
    RingReduceScatter
);

impl SubAlgorithm for RingReduceScatter {
    fn name(&self) -> &'static str {
        "ring_reduce_scatter"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        args.reduce_op()?;
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        args.check_layout(view.rank_size as usize)?;
        if view.rank_size > 1 {
            reduce_scatter_steps(args, &args.input, view, stream)?;
        }
        if !args.input.ptr_eq(&args.output) {
            for s in args.owned_by(view.local_rank as usize) {
                copy_async(&args.out_window(s)?, &args.in_window(s)?, stream)?;
            }
        }
        Ok(())
    }
}

kernel_struct!(
    /// Reduce-scatter then all-gather, both in the output buffer.
    RingAllReduce
);

impl SubAlgorithm for RingAllReduce {
    fn name(&self) -> &'static str {
        "ring_all_reduce"
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
        if view.rank_size <= 1 {
            return Ok(());
        }
        reduce_scatter_steps(args, &args.output, view, stream)?;
        all_gather_steps(args, &args.output, view, stream)
    }
}

kernel_struct!(
    /// Chain from the root around the ring, slice by slice, in the output.
    RingBroadcast
);

impl SubAlgorithm for RingBroadcast {
    fn name(&self) -> &'static str {
        "ring_broadcast"
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
        let pos = (view.local_rank as usize + n - args.root as usize) % n;
        for s in &args.slices {
            let window = args.out_window(*s)?;
            if pos > 0 {
                view.link(view.prev())?
                    .transfer_async(Direction::Rx, &window, stream)?;
            }
            if pos < n - 1 {
                view.link(view.next())?
                    .transfer_async(Direction::Tx, &window, stream)?;
            }
        }
        Ok(())
    }
}

kernel_struct!(
    /// Chain ending at the root; every hop reduces into its output.
    RingReduce
);

impl SubAlgorithm for RingReduce {
    fn name(&self) -> &'static str {
        "ring_reduce"
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
        // the root is the last hop
        let pos = (view.local_rank as usize + 2 * n - args.root as usize - 1) % n;
        for s in &args.slices {
            let window = args.out_window(*s)?;
            if pos > 0 {
                args.recv_reduce(view.link(view.prev())?, &window, stream)?;
            }
            if pos < n - 1 {
                view.link(view.next())?
                    .transfer_async(Direction::Tx, &window, stream)?;
            }
        }
        Ok(())
    }
}

kernel_struct!(
    /// The root's output holds every slice; sub-rank `j` receives slice `j`
    /// at the same offset. Farthest targets are sent first and forwarded.
    RingScatter
);

impl SubAlgorithm for RingScatter {
    fn name(&self) -> &'static str {
        "ring_scatter"
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
        let root = args.root as usize;
        let pos = (view.local_rank as usize + n - root) % n;
        let window = |t: usize| args.out_window(args.slices[(root + t) % n]);
        if pos == 0 {
            for t in (1..n).rev() {
                view.link(view.next())?
                    .transfer_async(Direction::Tx, &window(t)?, stream)?;
            }
            return Ok(());
        }
        for t in (pos..n).rev() {
            let w = window(t)?;
            view.link(view.prev())?
                .transfer_async(Direction::Rx, &w, stream)?;
            if t != pos {
                view.link(view.next())?
                    .transfer_async(Direction::Tx, &w, stream)?;
            }
        }
        Ok(())
    }
}

kernel_struct!(
    /// Every sub-rank's slice flows toward the root, which ends up with all
    /// of them. Each hop sends its own slice, then forwards what it received.
    RingGather
);

impl SubAlgorithm for RingGather {
    fn name(&self) -> &'static str {
        "ring_gather"
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
        let root = args.root as usize;
        let me = view.local_rank as usize;
        let pos = (me + 2 * n - root - 1) % n;
        // sub-rank sitting at hop position p
        let window_at = |p: usize| args.out_window(args.slices[(root + 1 + p) % n]);

        if pos < n - 1 {
            view.link(view.next())?
                .transfer_async(Direction::Tx, &args.out_window(args.slices[me])?, stream)?;
        }
        for j in 0..pos {
            let w = window_at(pos - 1 - j)?;
            view.link(view.prev())?
                .transfer_async(Direction::Rx, &w, stream)?;
            if pos < n - 1 {
                view.link(view.next())?
                    .transfer_async(Direction::Tx, &w, stream)?;
            }
        }
        Ok(())
    }
}
