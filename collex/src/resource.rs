//! Resource negotiation: what an executor asks for and what it gets back.
//!
//! An executor describes its needs as a [`ResourceRequest`] (scratch bytes,
//! extra streams, notifies and one transport list per sub-communicator per
//! level). The allocator answers with a [`ResourceResponse`] holding the
//! buffers, streams, notifies and links it built.

use crate::device::{DeviceMem, Notify, Stream};
use crate::error::{CollexError, Result};
use crate::transport::Link;
use crate::types::Rank;
use indexmap::IndexMap;
use std::sync::Arc;

/// Hierarchy level of a sub-communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CommLevel {
    /// Devices inside one aggregation (server).
    Level0 = 0,
    /// Same device slot across the modules of a super-pod.
    Level1 = 1,
    /// Same slot across super-pods.
    Level2 = 2,
    /// Level-0 planes driven over RDMA when both fabrics run concurrently.
    Level0Rdma = 3,
    /// Level-1 planes driven over RDMA.
    Level1Rdma = 4,
    /// Every rank of the communicator in one mesh.
    Combined = 5,
    /// One pair of ranks for point-to-point traffic.
    P2p = 6,
}

impl CommLevel {
    pub const fn name(self) -> &'static str {
        match self {
            CommLevel::Level0 => "level0",
            CommLevel::Level1 => "level1",
            CommLevel::Level2 => "level2",
            CommLevel::Level0Rdma => "level0_rdma",
            CommLevel::Level1Rdma => "level1_rdma",
            CommLevel::Combined => "combined",
            CommLevel::P2p => "p2p",
        }
    }
}

impl std::fmt::Display for CommLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Memory regions a link may read from or write to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemKind {
    CclInput,
    CclOutput,
    Scratch,
    ParamInput,
    ParamOutput,
    AivInput,
    AivOutput,
    Reserved,
}

/// Shape of a sub-communicator plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaneKind {
    /// Links to the two ring neighbours only.
    Ring,
    /// Links to every other member.
    Mesh,
}

/// One wanted link, seen from the local rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportRequest {
    pub is_valid: bool,
    pub local_user_rank: Rank,
    pub remote_user_rank: Rank,
    pub input_mem: MemKind,
    pub output_mem: MemKind,
}

impl TransportRequest {
    fn none(local: Rank) -> Self {
        Self {
            is_valid: false,
            local_user_rank: local,
            remote_user_rank: local,
            input_mem: MemKind::Reserved,
            output_mem: MemKind::Reserved,
        }
    }
}

/// Transport list of one sub-communicator, indexed by sub-rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleSubCommTransport {
    pub kind: PlaneKind,
    pub transport_requests: Vec<TransportRequest>,
    /// Sub-rank -> user rank, in ring order.
    pub members: Vec<Rank>,
    pub user_rank_to_sub_rank: IndexMap<Rank, u32>,
    pub local_sub_rank: u32,
}

impl SingleSubCommTransport {
    /// Ring plane over `members` (user ranks in ring order) for `local`.
    pub fn ring(local: Rank, members: Vec<Rank>, input: MemKind, output: MemKind) -> Result<Self> {
        Self::build(PlaneKind::Ring, local, members, input, output)
    }

    /// Full-mesh plane over `members` for `local`.
    pub fn mesh(local: Rank, members: Vec<Rank>, input: MemKind, output: MemKind) -> Result<Self> {
        Self::build(PlaneKind::Mesh, local, members, input, output)
    }

    fn build(
        kind: PlaneKind,
        local: Rank,
        members: Vec<Rank>,
        input: MemKind,
        output: MemKind,
    ) -> Result<Self> {
        let user_rank_to_sub_rank: IndexMap<Rank, u32> = members
            .iter()
            .enumerate()
            .map(|(i, &r)| (r, i as u32))
            .collect();
        if user_rank_to_sub_rank.len() != members.len() {
            return Err(CollexError::internal(format!(
                "sub-communicator members repeat: {members:?}"
            )));
        }
        let local_sub_rank = *user_rank_to_sub_rank.get(&local).ok_or_else(|| {
            CollexError::internal(format!("rank {local} is not in plane {members:?}"))
        })?;

        let n = members.len();
        let me = local_sub_rank as usize;
        let wanted = |peer: usize| -> bool {
            if peer == me {
                return false;
            }
            match kind {
                PlaneKind::Mesh => true,
                PlaneKind::Ring => peer == (me + 1) % n || peer == (me + n - 1) % n,
            }
        };
        let transport_requests = members
            .iter()
            .enumerate()
            .map(|(peer, &remote)| {
                if wanted(peer) {
                    TransportRequest {
                        is_valid: true,
                        local_user_rank: local,
                        remote_user_rank: remote,
                        input_mem: input,
                        output_mem: output,
                    }
                } else {
                    TransportRequest::none(local)
                }
            })
            .collect();

        Ok(Self {
            kind,
            transport_requests,
            members,
            user_rank_to_sub_rank,
            local_sub_rank,
        })
    }

    pub fn rank_size(&self) -> usize {
        self.members.len()
    }

    pub fn sub_rank_of(&self, user_rank: Rank) -> Option<u32> {
        self.user_rank_to_sub_rank.get(&user_rank).copied()
    }
}

/// Transport lists of every plane an operation needs, per level.
pub type OpCommTransport = IndexMap<CommLevel, Vec<SingleSubCommTransport>>;

/// What an executor needs before it can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub scratch_mem_size: u64,
    /// Streams beyond the caller's primary stream.
    pub stream_num: u32,
    pub notify_num: u32,
    pub need_aiv_buffer: bool,
    pub comm_transport: OpCommTransport,
}

impl ResourceRequest {
    pub fn planes(&self, level: CommLevel) -> usize {
        self.comm_transport.get(&level).map_or(0, Vec::len)
    }
}

/// Built links of one sub-communicator, indexed by sub-rank.
#[derive(Debug, Clone)]
pub struct PlaneLinks {
    pub plane_key: String,
    pub transport: SingleSubCommTransport,
    pub links: Vec<Option<Arc<dyn Link>>>,
}

/// Borrowed view of one sub-communicator handed to a kernel.
#[derive(Debug, Clone)]
pub struct SubCommView {
    pub level: CommLevel,
    pub index: usize,
    pub local_rank: u32,
    pub rank_size: u32,
    links: Vec<Option<Arc<dyn Link>>>,
}

impl SubCommView {
    pub fn new(level: CommLevel, index: usize, plane: &PlaneLinks) -> Result<Self> {
        let rank_size = plane.transport.rank_size();
        if plane.links.len() != rank_size {
            return Err(CollexError::internal(format!(
                "{level} plane {index}: {} links for {rank_size} members",
                plane.links.len()
            )));
        }
        Ok(Self {
            level,
            index,
            local_rank: plane.transport.local_sub_rank,
            rank_size: rank_size as u32,
            links: plane.links.clone(),
        })
    }

    /// View of a plane with one member and no links.
    pub fn solo(level: CommLevel) -> Self {
        Self {
            level,
            index: 0,
            local_rank: 0,
            rank_size: 1,
            links: vec![None],
        }
    }

    pub fn link(&self, sub_rank: u32) -> Result<&Arc<dyn Link>> {
        self.links
            .get(sub_rank as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                CollexError::internal(format!(
                    "{} plane {}: no link from sub-rank {} to {sub_rank}",
                    self.level, self.index, self.local_rank
                ))
            })
    }

    pub fn next(&self) -> u32 {
        (self.local_rank + 1) % self.rank_size
    }

    pub fn prev(&self) -> u32 {
        (self.local_rank + self.rank_size - 1) % self.rank_size
    }
}

/// Everything an allocator built for one tag.
#[derive(Debug)]
pub struct ResourceResponse {
    pub ccl_input: DeviceMem,
    pub ccl_output: DeviceMem,
    pub scratch: Option<DeviceMem>,
    pub aiv_input: Option<DeviceMem>,
    pub aiv_output: Option<DeviceMem>,
    pub streams: Vec<Stream>,
    pub notifies: Vec<Notify>,
    pub links: IndexMap<CommLevel, Vec<PlaneLinks>>,
}

impl ResourceResponse {
    pub fn planes(&self, level: CommLevel) -> usize {
        self.links.get(&level).map_or(0, Vec::len)
    }

    /// Fail unless at least `expected` planes were negotiated at `level`.
    pub fn check_comm_size(&self, level: CommLevel, expected: usize) -> Result<()> {
        let actual = self.planes(level);
        if actual < expected {
            return Err(CollexError::ResourceUnavailable {
                level,
                expected,
                actual,
            });
        }
        Ok(())
    }

    /// Whether this response already satisfies `request`: enough streams,
    /// notifies and scratch, and the same planes with the same members.
    pub fn covers(&self, request: &ResourceRequest) -> bool {
        let scratch = self.scratch.as_ref().map_or(0, |m| m.size() as u64);
        if self.streams.len() < request.stream_num as usize
            || self.notifies.len() < request.notify_num as usize
            || scratch < request.scratch_mem_size
            || (request.need_aiv_buffer && self.aiv_input.is_none())
        {
            return false;
        }
        request.comm_transport.iter().all(|(level, wanted)| {
            self.links.get(level).is_some_and(|built| {
                built.len() == wanted.len()
                    && built.iter().zip(wanted).all(|(b, w)| b.transport == *w)
            })
        })
    }

    pub fn sub_comm(&self, level: CommLevel, index: usize) -> Result<SubCommView> {
        let plane = self
            .links
            .get(&level)
            .and_then(|planes| planes.get(index))
            .ok_or(CollexError::ResourceUnavailable {
                level,
                expected: index + 1,
                actual: self.planes(level),
            })?;
        SubCommView::new(level, index, plane)
    }
}
