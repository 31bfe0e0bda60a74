//! Three-level algorithm type packed into one integer.
//!
//! Level 0 (intra-aggregation) lives in bits `0..8`, level 1 (inter-server)
//! in `8..16`, level 2 (inter-superpod) in `16..24`. Decoding one level only
//! ever looks at that level's bits.

use crate::error::{CollexError, Result};

/// Bits reserved for each level.
pub const LEVEL_ALGO_WIDTH: u32 = 8;
const LEVEL_MASK: u32 = (1 << LEVEL_ALGO_WIDTH) - 1;
const LEVEL_COUNT: u32 = 3;

/// Intra-aggregation algorithm, one per level-0 topology shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Level0Algo {
    #[default]
    WholeRing = 0,
    Ring8P = 1,
    Mesh4P = 2,
    Mesh2P = 3,
    Mesh1P = 4,
    Ring4P = 5,
    NpSingleRing = 6,
    NpDoubleRing = 7,
    NpMesh = 8,
    NpHd = 9,
    NpStar = 10,
    Reserved = 11,
}

/// Inter-server algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Level1Algo {
    #[default]
    WholeRing = 0,
    Hd = 1,
    Ring = 2,
    Pipeline = 3,
    Nhr = 4,
    NhrV1 = 5,
    Nb = 6,
    Reserved = 7,
}

/// Inter-superpod algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Level2Algo {
    #[default]
    WholeRing = 0,
    Hd = 1,
    Ring = 2,
    Reserved = 3,
}

impl Level0Algo {
    pub const ALL: [Level0Algo; 12] = [
        Level0Algo::WholeRing,
        Level0Algo::Ring8P,
        Level0Algo::Mesh4P,
        Level0Algo::Mesh2P,
        Level0Algo::Mesh1P,
        Level0Algo::Ring4P,
        Level0Algo::NpSingleRing,
        Level0Algo::NpDoubleRing,
        Level0Algo::NpMesh,
        Level0Algo::NpHd,
        Level0Algo::NpStar,
        Level0Algo::Reserved,
    ];

    pub fn from_bits(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Level0Algo::WholeRing => "ALG_LEVEL0_WHOLE_RING",
            Level0Algo::Ring8P => "ALG_LEVEL0_8P_RING",
            Level0Algo::Mesh4P => "ALG_LEVEL0_4P_MESH",
            Level0Algo::Mesh2P => "ALG_LEVEL0_2P_MESH",
            Level0Algo::Mesh1P => "ALG_LEVEL0_1P_MESH",
            Level0Algo::Ring4P => "ALG_LEVEL0_4P_RING",
            Level0Algo::NpSingleRing => "ALG_LEVEL0_NP_SINGLE_RING",
            Level0Algo::NpDoubleRing => "ALG_LEVEL0_NP_DOUBLE_RING",
            Level0Algo::NpMesh => "ALG_LEVEL0_NP_MESH",
            Level0Algo::NpHd => "ALG_LEVEL0_NP_HD",
            Level0Algo::NpStar => "ALG_LEVEL0_NP_STAR",
            Level0Algo::Reserved => "ALG_LEVEL0_RESERVED",
        }
    }

    /// Short name accepted in `COLLEX_ALGO`.
    pub const fn short_name(self) -> &'static str {
        match self {
            Level0Algo::WholeRing => "whole_ring",
            Level0Algo::Ring8P => "8p_ring",
            Level0Algo::Mesh4P => "4p_mesh",
            Level0Algo::Mesh2P => "2p_mesh",
            Level0Algo::Mesh1P => "1p_mesh",
            Level0Algo::Ring4P => "4p_ring",
            Level0Algo::NpSingleRing => "np_single_ring",
            Level0Algo::NpDoubleRing => "np_double_ring",
            Level0Algo::NpMesh => "np_mesh",
            Level0Algo::NpHd => "np_hd",
            Level0Algo::NpStar => "np_star",
            Level0Algo::Reserved => "reserved",
        }
    }
}

impl Level1Algo {
    pub const ALL: [Level1Algo; 8] = [
        Level1Algo::WholeRing,
        Level1Algo::Hd,
        Level1Algo::Ring,
        Level1Algo::Pipeline,
        Level1Algo::Nhr,
        Level1Algo::NhrV1,
        Level1Algo::Nb,
        Level1Algo::Reserved,
    ];

    pub fn from_bits(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Level1Algo::WholeRing => "ALG_LEVEL1_WHOLE_RING",
            Level1Algo::Hd => "ALG_LEVEL1_HD",
            Level1Algo::Ring => "ALG_LEVEL1_RING",
            Level1Algo::Pipeline => "ALG_LEVEL1_PIPELINE",
            Level1Algo::Nhr => "ALG_LEVEL1_NHR",
            Level1Algo::NhrV1 => "ALG_LEVEL1_NHR_V1",
            Level1Algo::Nb => "ALG_LEVEL1_NB",
            Level1Algo::Reserved => "ALG_LEVEL1_RESERVED",
        }
    }

    pub const fn short_name(self) -> &'static str {
        match self {
            Level1Algo::WholeRing => "whole_ring",
            Level1Algo::Hd => "hd",
            Level1Algo::Ring => "ring",
            Level1Algo::Pipeline => "pipeline",
            Level1Algo::Nhr => "nhr",
            Level1Algo::NhrV1 => "nhr_v1",
            Level1Algo::Nb => "nb",
            Level1Algo::Reserved => "reserved",
        }
    }
}

impl Level2Algo {
    pub const ALL: [Level2Algo; 4] = [
        Level2Algo::WholeRing,
        Level2Algo::Hd,
        Level2Algo::Ring,
        Level2Algo::Reserved,
    ];

    pub fn from_bits(v: u32) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Level2Algo::WholeRing => "ALG_LEVEL2_WHOLE_RING",
            Level2Algo::Hd => "ALG_LEVEL2_HD",
            Level2Algo::Ring => "ALG_LEVEL2_RING",
            Level2Algo::Reserved => "ALG_LEVEL2_RESERVED",
        }
    }

    pub const fn short_name(self) -> &'static str {
        match self {
            Level2Algo::WholeRing => "whole_ring",
            Level2Algo::Hd => "hd",
            Level2Algo::Ring => "ring",
            Level2Algo::Reserved => "reserved",
        }
    }
}

/// Packed (level0, level1, level2) algorithm choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AlgType(u32);

impl AlgType {
    pub const fn encode(level0: Level0Algo, level1: Level1Algo, level2: Level2Algo) -> Self {
        Self(
            (level0 as u32)
                | ((level1 as u32) << LEVEL_ALGO_WIDTH)
                | ((level2 as u32) << (2 * LEVEL_ALGO_WIDTH)),
        )
    }

    /// Raw packed value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Validate and wrap a raw packed value.
    pub fn from_raw(raw: u32) -> Result<Self> {
        if !Self::is_supported(raw) {
            return Err(CollexError::Config(format!(
                "unsupported algorithm type {raw:#x}"
            )));
        }
        Ok(Self(raw))
    }

    /// True when every level field maps to an enum constant and no bits are
    /// set above level 2.
    pub fn is_supported(raw: u32) -> bool {
        if raw >> (LEVEL_COUNT * LEVEL_ALGO_WIDTH) != 0 {
            return false;
        }
        Level0Algo::from_bits(field(raw, 0)).is_some()
            && Level1Algo::from_bits(field(raw, 1)).is_some()
            && Level2Algo::from_bits(field(raw, 2)).is_some()
    }

    pub fn level0(self) -> Level0Algo {
        Level0Algo::from_bits(field(self.0, 0)).unwrap_or(Level0Algo::Reserved)
    }

    pub fn level1(self) -> Level1Algo {
        Level1Algo::from_bits(field(self.0, 1)).unwrap_or(Level1Algo::Reserved)
    }

    pub fn level2(self) -> Level2Algo {
        Level2Algo::from_bits(field(self.0, 2)).unwrap_or(Level2Algo::Reserved)
    }

    /// Copy with level 1 replaced.
    pub fn with_level1(self, level1: Level1Algo) -> Self {
        Self::encode(self.level0(), level1, self.level2())
    }

    /// Copy with level 0 replaced.
    pub fn with_level0(self, level0: Level0Algo) -> Self {
        Self::encode(level0, self.level1(), self.level2())
    }

    // ===== Level-1 predicates =====

    pub fn uses_ring(self) -> bool {
        self.level1() == Level1Algo::Ring
    }

    pub fn uses_halving_doubling(self) -> bool {
        self.level1() == Level1Algo::Hd
    }

    pub fn uses_nhr(self) -> bool {
        self.level1() == Level1Algo::Nhr
    }

    pub fn uses_nhr_v1(self) -> bool {
        self.level1() == Level1Algo::NhrV1
    }

    pub fn uses_bruck(self) -> bool {
        self.level1() == Level1Algo::Nb
    }

    pub fn uses_pipeline(self) -> bool {
        self.level1() == Level1Algo::Pipeline
    }

    // ===== Level-2 predicates =====

    pub fn level2_uses_ring(self) -> bool {
        self.level2() == Level2Algo::Ring
    }

    pub fn level2_uses_halving_doubling(self) -> bool {
        self.level2() == Level2Algo::Hd
    }

    // ===== Level-0 predicates =====

    pub fn is_8p_ring(self) -> bool {
        self.level0() == Level0Algo::Ring8P
    }

    pub fn is_double_ring(self) -> bool {
        self.level0() == Level0Algo::NpDoubleRing
    }

    pub fn is_single_ring(self) -> bool {
        matches!(
            self.level0(),
            Level0Algo::NpSingleRing | Level0Algo::Ring4P | Level0Algo::WholeRing
        )
    }

    pub fn is_mesh(self) -> bool {
        matches!(
            self.level0(),
            Level0Algo::NpMesh | Level0Algo::Mesh4P | Level0Algo::Mesh2P | Level0Algo::Mesh1P
        )
    }

    /// Tag suffix naming the level-1 choice.
    pub fn level1_name(self) -> &'static str {
        self.level1().name()
    }

    /// Parse `level0:level1:level2` short names, e.g. `8p_ring:hd:ring`.
    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split(':').map(str::trim).collect();
        let [l0, l1, l2] = parts.as_slice() else {
            return Err(CollexError::Config(format!(
                "algorithm choice {text:?} must be level0:level1:level2"
            )));
        };
        let level0 = Level0Algo::ALL
            .into_iter()
            .find(|a| a.short_name() == *l0)
            .ok_or_else(|| CollexError::Config(format!("unknown level0 algorithm {l0:?}")))?;
        let level1 = Level1Algo::ALL
            .into_iter()
            .find(|a| a.short_name() == *l1)
            .ok_or_else(|| CollexError::Config(format!("unknown level1 algorithm {l1:?}")))?;
        let level2 = Level2Algo::ALL
            .into_iter()
            .find(|a| a.short_name() == *l2)
            .ok_or_else(|| CollexError::Config(format!("unknown level2 algorithm {l2:?}")))?;
        Self::from_raw(Self::encode(level0, level1, level2).raw())
    }
}

impl std::fmt::Display for AlgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.level0().name(),
            self.level1().name(),
            self.level2().name()
        )
    }
}

#[inline]
const fn field(raw: u32, level: u32) -> u32 {
    (raw >> (level * LEVEL_ALGO_WIDTH)) & LEVEL_MASK
}
