/// Rank of a participant in a communicator (0-indexed).
pub type Rank = u32;

/// Data types supported by collex for collective operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Kind of collective call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum OpKind {
    AllGather = 0,
    AllReduce = 1,
    ReduceScatter = 2,
    Broadcast = 3,
    Reduce = 4,
    Scatter = 5,
    Gather = 6,
    AllToAllV = 7,
    Send = 8,
    Receive = 9,
    BatchSendRecv = 10,
}

impl OpKind {
    pub const fn name(self) -> &'static str {
        match self {
            OpKind::AllGather => "all_gather",
            OpKind::AllReduce => "all_reduce",
            OpKind::ReduceScatter => "reduce_scatter",
            OpKind::Broadcast => "broadcast",
            OpKind::Reduce => "reduce",
            OpKind::Scatter => "scatter",
            OpKind::Gather => "gather",
            OpKind::AllToAllV => "all_to_all_v",
            OpKind::Send => "send",
            OpKind::Receive => "receive",
            OpKind::BatchSendRecv => "batch_send_recv",
        }
    }

    /// Whether the operation combines contributions with a `ReduceOp`.
    pub const fn is_reduction(self) -> bool {
        matches!(
            self,
            OpKind::AllReduce | OpKind::ReduceScatter | OpKind::Reduce
        )
    }

    /// Whether the operation needs a root rank.
    pub const fn is_rooted(self) -> bool {
        matches!(
            self,
            OpKind::Broadcast | OpKind::Reduce | OpKind::Scatter | OpKind::Gather
        )
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Accelerator family a communicator runs on.
///
/// The family decides which level-0 topologies are legal and whether
/// the copy engine can reduce on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DevType {
    /// Boards wired as an 8-device ring or 4-device mesh.
    #[default]
    RingBoard,
    /// Fully meshed aggregations.
    MeshBoard,
    /// Super-pod fabric with double-ring level 0 and DMA reduce.
    SuperPod,
}

impl DevType {
    pub const fn name(self) -> &'static str {
        match self {
            DevType::RingBoard => "ring_board",
            DevType::MeshBoard => "mesh_board",
            DevType::SuperPod => "super_pod",
        }
    }

    /// Whether the copy engine can reduce while writing.
    pub const fn supports_dma_reduce(self) -> bool {
        matches!(self, DevType::SuperPod)
    }
}

impl std::fmt::Display for DevType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
