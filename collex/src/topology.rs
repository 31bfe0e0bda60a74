//! Rank placement across aggregations, servers and super-pods.
//!
//! A communicator of `rank_size` ranks is cut into modules (aggregations) of
//! `dev_per_aggregation` consecutive ranks. Level 0 is one module, level 1
//! joins the same device slot across the modules of one super-pod, level 2
//! joins the same (module slot, device slot) across super-pods.

use crate::alg_type::Level0Algo;
use crate::error::{CollexError, Result};
use crate::types::{DevType, Rank};

/// Fixed device orders of the four rings of an 8-device board.
pub const RING_8P_ORDERS: [[u32; 8]; 4] = [
    [0, 1, 2, 6, 5, 4, 7, 3],
    [0, 3, 7, 4, 5, 6, 2, 1],
    [0, 2, 3, 1, 5, 7, 6, 4],
    [0, 4, 6, 7, 5, 1, 3, 2],
];

/// Physical wiring of one aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopoType {
    Ring8P,
    Mesh4P,
    Mesh2P,
    Mesh1P,
    Ring4P,
    NpSingleRing,
    NpDoubleRing,
    NpMesh,
}

impl TopoType {
    /// Level-0 algorithm that matches this wiring.
    pub const fn level0(self) -> Level0Algo {
        match self {
            TopoType::Ring8P => Level0Algo::Ring8P,
            TopoType::Mesh4P => Level0Algo::Mesh4P,
            TopoType::Mesh2P => Level0Algo::Mesh2P,
            TopoType::Mesh1P => Level0Algo::Mesh1P,
            TopoType::Ring4P => Level0Algo::Ring4P,
            TopoType::NpSingleRing => Level0Algo::NpSingleRing,
            TopoType::NpDoubleRing => Level0Algo::NpDoubleRing,
            TopoType::NpMesh => Level0Algo::NpMesh,
        }
    }

    pub const fn is_mesh(self) -> bool {
        matches!(
            self,
            TopoType::NpMesh | TopoType::Mesh4P | TopoType::Mesh2P | TopoType::Mesh1P
        )
    }

    /// Default wiring for a device family and aggregation width.
    pub fn detect(dev_type: DevType, dev_per_aggregation: u32) -> Self {
        match (dev_type, dev_per_aggregation) {
            (DevType::SuperPod, _) => TopoType::NpDoubleRing,
            (DevType::MeshBoard, 1) => TopoType::Mesh1P,
            (DevType::MeshBoard, _) => TopoType::NpMesh,
            (DevType::RingBoard, 8) => TopoType::Ring8P,
            (DevType::RingBoard, 4) => TopoType::Mesh4P,
            (DevType::RingBoard, 2) => TopoType::Mesh2P,
            (DevType::RingBoard, 1) => TopoType::Mesh1P,
            (DevType::RingBoard, _) => TopoType::NpSingleRing,
        }
    }
}

/// Where every rank of a communicator sits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommTopology {
    rank_size: u32,
    dev_per_aggregation: u32,
    modules_per_pod: u32,
    nic_list: Vec<u32>,
    dev_type: DevType,
    topo_type: TopoType,
}

impl CommTopology {
    /// Topology of `rank_size` ranks grouped `dev_per_aggregation` at a time,
    /// one super-pod, every device owning a NIC.
    pub fn new(rank_size: u32, dev_per_aggregation: u32) -> Result<Self> {
        Self::with_dev_type(rank_size, dev_per_aggregation, DevType::default())
    }

    pub fn with_dev_type(rank_size: u32, dev_per_aggregation: u32, dev_type: DevType) -> Result<Self> {
        if rank_size == 0 || dev_per_aggregation == 0 {
            return Err(CollexError::param("rank size and aggregation width must be non-zero"));
        }
        if rank_size % dev_per_aggregation != 0 {
            return Err(CollexError::param(format!(
                "rank size {rank_size} is not a multiple of aggregation width {dev_per_aggregation}"
            )));
        }
        let module_num = rank_size / dev_per_aggregation;
        Ok(Self {
            rank_size,
            dev_per_aggregation,
            modules_per_pod: module_num,
            nic_list: (0..dev_per_aggregation).collect(),
            dev_type,
            topo_type: TopoType::detect(dev_type, dev_per_aggregation),
        })
    }

    /// Override the detected wiring.
    pub fn topo_type(mut self, topo_type: TopoType) -> Result<Self> {
        if topo_type == TopoType::Ring8P && self.dev_per_aggregation != 8 {
            return Err(CollexError::param(format!(
                "8-device ring wiring needs 8 devices per aggregation, got {}",
                self.dev_per_aggregation
            )));
        }
        self.topo_type = topo_type;
        Ok(self)
    }

    /// Restrict NICs to the given device slots.
    pub fn nic_list(mut self, nics: Vec<u32>) -> Result<Self> {
        if nics.is_empty() {
            return Err(CollexError::param("nic list is empty"));
        }
        if let Some(bad) = nics.iter().find(|&&d| d >= self.dev_per_aggregation) {
            return Err(CollexError::param(format!(
                "nic device {bad} outside aggregation of {}",
                self.dev_per_aggregation
            )));
        }
        if self.dev_per_aggregation as usize % nics.len() != 0 {
            return Err(CollexError::param(format!(
                "{} nics do not divide {} devices evenly",
                nics.len(),
                self.dev_per_aggregation
            )));
        }
        let mut nics = nics;
        nics.sort_unstable();
        nics.dedup();
        self.nic_list = nics;
        Ok(self)
    }

    /// Split the modules into super-pods of `modules_per_pod` each.
    pub fn super_pods(mut self, modules_per_pod: u32) -> Result<Self> {
        if modules_per_pod == 0 || self.module_num() % modules_per_pod != 0 {
            return Err(CollexError::param(format!(
                "{} modules cannot form pods of {modules_per_pod}",
                self.module_num()
            )));
        }
        self.modules_per_pod = modules_per_pod;
        Ok(self)
    }

    pub fn rank_size(&self) -> u32 {
        self.rank_size
    }

    pub fn dev_per_aggregation(&self) -> u32 {
        self.dev_per_aggregation
    }

    pub fn module_num(&self) -> u32 {
        self.rank_size / self.dev_per_aggregation
    }

    pub fn modules_per_pod(&self) -> u32 {
        self.modules_per_pod
    }

    pub fn pod_num(&self) -> u32 {
        self.module_num() / self.modules_per_pod
    }

    pub fn dev_type(&self) -> DevType {
        self.dev_type
    }

    pub fn get_topo_type(&self) -> TopoType {
        self.topo_type
    }

    pub fn nics(&self) -> &[u32] {
        &self.nic_list
    }

    /// Every device slot owns a NIC.
    pub fn nics_complete(&self) -> bool {
        self.nic_list.len() == self.dev_per_aggregation as usize
    }

    pub fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.rank_size {
            return Err(CollexError::InvalidRank {
                rank,
                rank_size: self.rank_size,
            });
        }
        Ok(())
    }

    pub fn module_of(&self, rank: Rank) -> u32 {
        rank / self.dev_per_aggregation
    }

    pub fn device_of(&self, rank: Rank) -> u32 {
        rank % self.dev_per_aggregation
    }

    /// Position of `device` in the sorted NIC list.
    pub fn nic_index(&self, device: u32) -> Option<usize> {
        self.nic_list.iter().position(|&d| d == device)
    }

    /// A single mesh-wired module with nothing above it.
    pub fn is_single_mesh_aggregation(&self) -> bool {
        self.module_num() == 1 && self.topo_type.is_mesh()
    }

    /// Members of `rank`'s module, ordered by device slot.
    pub fn level0_ranks(&self, rank: Rank) -> Vec<Rank> {
        let base = self.module_of(rank) * self.dev_per_aggregation;
        (0..self.dev_per_aggregation).map(|d| base + d).collect()
    }

    /// Same device slot across the modules of `rank`'s super-pod.
    pub fn level1_ranks(&self, rank: Rank) -> Vec<Rank> {
        let module = self.module_of(rank);
        let pod_base = (module / self.modules_per_pod) * self.modules_per_pod;
        let device = self.device_of(rank);
        (0..self.modules_per_pod)
            .map(|m| (pod_base + m) * self.dev_per_aggregation + device)
            .collect()
    }

    /// Same module slot and device slot across super-pods.
    pub fn level2_ranks(&self, rank: Rank) -> Vec<Rank> {
        let module = self.module_of(rank);
        let slot = module % self.modules_per_pod;
        let device = self.device_of(rank);
        (0..self.pod_num())
            .map(|p| (p * self.modules_per_pod + slot) * self.dev_per_aggregation + device)
            .collect()
    }

    /// Device orders of the level-0 planes for `level0`.
    ///
    /// The 8-device ring yields its four fixed orders followed by each of
    /// them reversed (same start device), for eight planes. A double ring
    /// yields the natural order and its reverse. Everything else is a
    /// single plane in device order.
    pub fn ring_orders(&self, level0: Level0Algo) -> Vec<Vec<u32>> {
        let natural: Vec<u32> = (0..self.dev_per_aggregation).collect();
        match level0 {
            Level0Algo::Ring8P if self.dev_per_aggregation == 8 => {
                let forward: Vec<Vec<u32>> = RING_8P_ORDERS.iter().map(|o| o.to_vec()).collect();
                let backward: Vec<Vec<u32>> = forward.iter().map(|o| reversed_ring(o)).collect();
                forward.into_iter().chain(backward).collect()
            }
            Level0Algo::NpDoubleRing => {
                let back = reversed_ring(&natural);
                vec![natural, back]
            }
            _ => vec![natural],
        }
    }
}

/// Same ring walked the other way, keeping the first device in place.
fn reversed_ring(order: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(order.len());
    if let Some((&first, rest)) = order.split_first() {
        out.push(first);
        out.extend(rest.iter().rev());
    }
    out
}
