//! Full-mesh kernels split into rounds.
//!
//! In round `k` every member sends to `me + k + 1` and receives from
//! `me - k - 1`, so no two rounds use the same ordered pair of ranks. A
//! kernel bound to one round can therefore run on its own stream next to
//! the other rounds.

use crate::algorithm::{KernelArgs, SubAlgorithm, prepared};
use crate::device::{Stream, copy_async};
use crate::error::{CollexError, Result};
use crate::resource::SubCommView;
use crate::transport::Direction;

fn rounds(round: Option<usize>, n: usize) -> Result<std::ops::Range<usize>> {
    match round {
        None => Ok(0..n.saturating_sub(1)),
        Some(k) if k + 1 < n => Ok(k..k + 1),
        Some(k) => Err(CollexError::internal(format!(
            "mesh round {k} out of range for {n} members"
        ))),
    }
}

/// Mesh all-gather in the output buffer.
#[derive(Debug, Default)]
pub struct MeshAllGather {
    round: Option<usize>,
    args: Option<KernelArgs>,
}

impl MeshAllGather {
    /// All rounds, back to back on one stream.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(round: usize) -> Self {
        Self {
            round: Some(round),
            args: None,
        }
    }
}

impl SubAlgorithm for MeshAllGather {
    fn name(&self) -> &'static str {
        "mesh_all_gather"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        let n = view.rank_size as usize;
        args.check_layout(n)?;
        let me = view.local_rank as usize;
        for k in rounds(self.round, n)? {
            let to = (me + k + 1) % n;
            let from = (me + n - k - 1) % n;
            view.link(to as u32)?
                .transfer_async(Direction::Tx, &args.out_window(args.slices[me])?, stream)?;
            view.link(from as u32)?
                .transfer_async(Direction::Rx, &args.out_window(args.slices[from])?, stream)?;
        }
        Ok(())
    }
}

/// Mesh reduce-scatter: peers' blocks for this rank are reduced straight
/// into its output slice.
///
/// When bound to a single round, the caller must have seeded the output
/// slice with the local contribution before any round starts.
#[derive(Debug, Default)]
pub struct MeshReduceScatter {
    round: Option<usize>,
    args: Option<KernelArgs>,
}

impl MeshReduceScatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(round: usize) -> Self {
        Self {
            round: Some(round),
            args: None,
        }
    }
}

impl SubAlgorithm for MeshReduceScatter {
    fn name(&self) -> &'static str {
        "mesh_reduce_scatter"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        args.reduce_op()?;
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        let n = view.rank_size as usize;
        args.check_layout(n)?;
        let me = view.local_rank as usize;
        let mine = args.out_window(args.slices[me])?;
        if self.round.is_none() {
            copy_async(&mine, &args.in_window(args.slices[me])?, stream)?;
        }
        for k in rounds(self.round, n)? {
            let to = (me + k + 1) % n;
            let from = (me + n - k - 1) % n;
            view.link(to as u32)?
                .transfer_async(Direction::Tx, &args.in_window(args.slices[to])?, stream)?;
            args.recv_reduce(view.link(from as u32)?, &mine, stream)?;
        }
        Ok(())
    }
}

/// Mesh scatter from the root: in round `k` the root sends slice `t` to
/// `t = root + k + 1`. Every slice sits at the same offset of the output on
/// every member.
#[derive(Debug, Default)]
pub struct MeshScatter {
    round: Option<usize>,
    args: Option<KernelArgs>,
}

impl MeshScatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(round: usize) -> Self {
        Self {
            round: Some(round),
            args: None,
        }
    }
}

impl SubAlgorithm for MeshScatter {
    fn name(&self) -> &'static str {
        "mesh_scatter"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        let n = view.rank_size as usize;
        args.check_layout(n)?;
        let me = view.local_rank as usize;
        let root = args.root as usize;
        for k in rounds(self.round, n)? {
            let target = (root + k + 1) % n;
            let window = args.out_window(args.slices[target])?;
            if me == root {
                view.link(target as u32)?
                    .transfer_async(Direction::Tx, &window, stream)?;
            } else if me == target {
                view.link(root as u32)?
                    .transfer_async(Direction::Rx, &window, stream)?;
            }
        }
        Ok(())
    }
}

/// Inverse of [`MeshScatter`]: in round `k` member `root + k + 1` sends its
/// slice to the root.
#[derive(Debug, Default)]
pub struct MeshGather {
    round: Option<usize>,
    args: Option<KernelArgs>,
}

impl MeshGather {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn round(round: usize) -> Self {
        Self {
            round: Some(round),
            args: None,
        }
    }
}

impl SubAlgorithm for MeshGather {
    fn name(&self) -> &'static str {
        "mesh_gather"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        let n = view.rank_size as usize;
        args.check_layout(n)?;
        let me = view.local_rank as usize;
        let root = args.root as usize;
        for k in rounds(self.round, n)? {
            let source = (root + k + 1) % n;
            let window = args.out_window(args.slices[source])?;
            if me == root {
                view.link(source as u32)?
                    .transfer_async(Direction::Rx, &window, stream)?;
            } else if me == source {
                view.link(root as u32)?
                    .transfer_async(Direction::Tx, &window, stream)?;
            }
        }
        Ok(())
    }
}
