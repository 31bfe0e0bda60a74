pub mod alg_type;
pub mod algorithm;
pub mod alloc;
pub mod comm;
pub mod config;
pub mod consistency;
pub mod context;
pub mod device;
pub mod error;
pub mod executor;
pub mod operator;
pub mod param;
pub mod reduce;
pub mod registry;
pub mod resource;
pub mod selector;
pub mod slice;
pub mod topology;
pub mod transport;
pub mod types;

pub use alg_type::{AlgType, Level0Algo, Level1Algo, Level2Algo};
pub use alloc::{LocalAllocator, ResourceAllocator};
pub use comm::Communicator;
pub use config::CollexConfig;
pub use consistency::{ConsistencyChecker, LocalConsistency, OpShape};
pub use context::CommunicatorContext;
pub use device::{DeviceMem, Notify, Stream, StreamTrace};
pub use error::{CollexError, Result};
pub use executor::{CollExecutor, ExecutorCore, ExecutorState};
pub use operator::{AlgSelection, Operator};
pub use param::{AllToAllVInfo, ExecMem, OpParam, SendRecvItem, SendRecvKind};
pub use registry::ExecutorRegistry;
pub use resource::{CommLevel, ResourceRequest, ResourceResponse};
pub use slice::Slice;
pub use topology::{CommTopology, TopoType};
pub use transport::{Direction, LocalFabric};
pub use types::{DataType, DevType, OpKind, Rank, ReduceOp};
