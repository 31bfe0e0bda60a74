use crate::algorithm::{KernelArgs, SubAlgorithm, prepared};
use crate::device::{Stream, copy_async};
use crate::error::{CollexError, Result};
use crate::resource::SubCommView;
use crate::slice::Slice;
use crate::transport::Direction;

/// Pairwise all-to-all: in round `k` send to `me + k`, receive from `me - k`.
///
/// `send[j]` is the input range bound for sub-rank `j`, `recv[j]` the output
/// range filled by sub-rank `j`. Round 0 is the local copy.
#[derive(Debug, Default)]
pub struct AllToAllPairwise {
    send: Vec<Slice>,
    recv: Vec<Slice>,
    args: Option<KernelArgs>,
}

impl AllToAllPairwise {
    pub fn new(send: Vec<Slice>, recv: Vec<Slice>) -> Self {
        Self {
            send,
            recv,
            args: None,
        }
    }
}

impl SubAlgorithm for AllToAllPairwise {
    fn name(&self) -> &'static str {
        "all_to_all_pairwise"
    }

    fn prepare(&mut self, args: KernelArgs) -> Result<()> {
        self.args = Some(args);
        Ok(())
    }

    fn run_async(&self, view: &SubCommView, stream: &Stream) -> Result<()> {
        let args = prepared(&self.args, self.name())?;
        let n = view.rank_size as usize;
        if self.send.len() != n || self.recv.len() != n {
            return Err(CollexError::internal(format!(
                "all-to-all layout has {}/{} entries for {n} members",
                self.send.len(),
                self.recv.len()
            )));
        }
        let me = view.local_rank as usize;
        copy_async(
            &args.out_window(self.recv[me])?,
            &args.in_window(self.send[me])?,
            stream,
        )?;
        for k in 1..n {
            let to = (me + k) % n;
            let from = (me + n - k) % n;
            view.link(to as u32)?
                .transfer_async(Direction::Tx, &args.in_window(self.send[to])?, stream)?;
            view.link(from as u32)?
                .transfer_async(Direction::Rx, &args.out_window(self.recv[from])?, stream)?;
        }
        Ok(())
    }
}
