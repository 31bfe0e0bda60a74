use crate::device::Stream;
use crate::error::{CollexError, Result};
use crate::executor::base::{ExecutorCore, LoopMode, OpPlan};
use crate::param::{ExecMem, OpParam, SendRecvKind};
use crate::resource::{CommLevel, MemKind, OpCommTransport, SingleSubCommTransport};
use crate::transport::Direction;
use crate::types::{OpKind, Rank};

/// Two-member plane between `rank` and `peer`, lower rank first.
fn pair(rank: Rank, peer: Rank) -> Result<SingleSubCommTransport> {
    let members = vec![rank.min(peer), rank.max(peer)];
    SingleSubCommTransport::mesh(rank, members, MemKind::ParamInput, MemKind::ParamOutput)
}

/// Sub-rank of `peer` on its pair plane with `rank`.
fn peer_sub_rank(rank: Rank, peer: Rank) -> u32 {
    u32::from(peer > rank)
}

fn peer_of(param: &OpParam) -> Result<Rank> {
    param
        .peer
        .ok_or_else(|| CollexError::param(format!("{} needs a peer", param.op)))
}

fn single_pair(core: &ExecutorCore, param: &OpParam) -> Result<OpCommTransport> {
    let mut t = OpCommTransport::new();
    t.insert(CommLevel::P2p, vec![pair(core.rank(), peer_of(param)?)?]);
    Ok(t)
}

fn transfer(core: &ExecutorCore, param: &OpParam, dir: Direction, mem: &ExecMem, stream: &Stream) -> Result<()> {
    let peer = peer_of(param)?;
    let bytes = param.count as usize * param.unit_size();
    let buf = match dir {
        Direction::Tx => mem.user_input.range(0, bytes)?,
        Direction::Rx => mem.user_output.range(0, bytes)?,
    };
    let view = core.response()?.sub_comm(CommLevel::P2p, 0)?;
    tracing::debug!(tag = %core.tag(), peer, bytes, dir = ?dir, "p2p: transfer");
    view.link(peer_sub_rank(core.rank(), peer))?
        .transfer_async(dir, &buf, stream)
}

/// Send `count` elements of the input to the peer.
#[derive(Debug, Clone, Default)]
pub struct SendPlan;

impl OpPlan for SendPlan {
    fn name(&self) -> &'static str {
        "SendExecutor"
    }

    fn op(&self) -> OpKind {
        OpKind::Send
    }

    fn calc_comm_info(&self, core: &ExecutorCore, param: &OpParam) -> Result<OpCommTransport> {
        single_pair(core, param)
    }

    fn loop_mode(&self) -> LoopMode {
        LoopMode::Direct
    }

    fn checks_consistency(&self) -> bool {
        false
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        transfer(core, param, Direction::Tx, mem, stream)
    }
}

/// Receive `count` elements from the peer into the output.
#[derive(Debug, Clone, Default)]
pub struct ReceivePlan;

impl OpPlan for ReceivePlan {
    fn name(&self) -> &'static str {
        "ReceiveExecutor"
    }

    fn op(&self) -> OpKind {
        OpKind::Receive
    }

    fn calc_comm_info(&self, core: &ExecutorCore, param: &OpParam) -> Result<OpCommTransport> {
        single_pair(core, param)
    }

    fn loop_mode(&self) -> LoopMode {
        LoopMode::Direct
    }

    fn checks_consistency(&self) -> bool {
        false
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, mem: &ExecMem, stream: &Stream) -> Result<()> {
        transfer(core, param, Direction::Rx, mem, stream)
    }
}

/// A batch of sends and receives; every send is issued before any receive.
///
/// One pair plane per distinct peer, in ascending peer order.
#[derive(Debug, Clone, Default)]
pub struct BatchSendRecvPlan;

impl BatchSendRecvPlan {
    fn peers(param: &OpParam) -> Vec<Rank> {
        let mut peers: Vec<Rank> = param.batch.iter().map(|i| i.peer).collect();
        peers.sort_unstable();
        peers.dedup();
        peers
    }
}

impl OpPlan for BatchSendRecvPlan {
    fn name(&self) -> &'static str {
        "BatchSendRecv"
    }

    fn op(&self) -> OpKind {
        OpKind::BatchSendRecv
    }

    fn calc_comm_info(&self, core: &ExecutorCore, param: &OpParam) -> Result<OpCommTransport> {
        let planes = Self::peers(param)
            .into_iter()
            .map(|peer| pair(core.rank(), peer))
            .collect::<Result<Vec<_>>>()?;
        let mut t = OpCommTransport::new();
        if !planes.is_empty() {
            t.insert(CommLevel::P2p, planes);
        }
        Ok(t)
    }

    fn loop_mode(&self) -> LoopMode {
        LoopMode::Direct
    }

    fn checks_consistency(&self) -> bool {
        false
    }

    fn kernel_run(&self, core: &ExecutorCore, param: &OpParam, _mem: &ExecMem, stream: &Stream) -> Result<()> {
        let peers = Self::peers(param);
        let resp = core.response()?;
        for kind in [SendRecvKind::Send, SendRecvKind::Recv] {
            for item in param.batch.iter().filter(|i| i.kind == kind) {
                let plane = peers
                    .iter()
                    .position(|&p| p == item.peer)
                    .ok_or_else(|| CollexError::internal(format!("no plane for peer {}", item.peer)))?;
                let view = resp.sub_comm(CommLevel::P2p, plane)?;
                let bytes = item.count as usize * item.dtype.size_in_bytes();
                let buf = item.mem.range(0, bytes)?;
                let dir = match kind {
                    SendRecvKind::Send => Direction::Tx,
                    SendRecvKind::Recv => Direction::Rx,
                };
                view.link(peer_sub_rank(core.rank(), item.peer))?
                    .transfer_async(dir, &buf, stream)?;
            }
        }
        tracing::debug!(tag = %core.tag(), items = param.batch.len(), peers = peers.len(), "p2p: batch issued");
        Ok(())
    }
}
