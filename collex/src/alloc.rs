//! Turns a `ResourceRequest` into buffers, streams, notifies and links.

use crate::context::CommunicatorContext;
use crate::device::DeviceMem;
use crate::error::{CollexError, Result};
use crate::resource::{CommLevel, PlaneLinks, ResourceRequest, ResourceResponse};
use crate::transport::LocalFabric;
use crate::types::Rank;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;

pub trait ResourceAllocator: Send + Sync {
    fn allocate(&self, rank: Rank, tag: &str, request: &ResourceRequest) -> Result<ResourceResponse>;
}

/// Allocator backed by host memory and a [`LocalFabric`].
///
/// Transit buffers are allocated once per communicator and shared by every
/// tag; scratch is allocated per request.
pub struct LocalAllocator {
    fabric: Arc<LocalFabric>,
    ctx: Arc<CommunicatorContext>,
    ccl_input: DeviceMem,
    ccl_output: DeviceMem,
    link_timeout: Duration,
}

impl LocalAllocator {
    pub fn new(
        fabric: Arc<LocalFabric>,
        ctx: Arc<CommunicatorContext>,
        ccl_buffer_size: usize,
        link_timeout: Duration,
    ) -> Self {
        Self {
            fabric,
            ctx,
            ccl_input: DeviceMem::alloc(ccl_buffer_size),
            ccl_output: DeviceMem::alloc(ccl_buffer_size),
            link_timeout,
        }
    }

    pub fn transit_buffers(&self) -> (DeviceMem, DeviceMem) {
        (self.ccl_input.clone(), self.ccl_output.clone())
    }
}

impl ResourceAllocator for LocalAllocator {
    fn allocate(&self, rank: Rank, tag: &str, request: &ResourceRequest) -> Result<ResourceResponse> {
        let bundle = self.ctx.stream_bundle(
            tag,
            request.stream_num as usize,
            request.notify_num as usize,
        )?;

        let mut links = IndexMap::new();
        for (&level, planes) in &request.comm_transport {
            let mut built = Vec::with_capacity(planes.len());
            for (index, transport) in planes.iter().enumerate() {
                // both ends of a pair share one p2p plane whatever else they run
                let plane_key = match level {
                    CommLevel::P2p => format!("{tag}/{level}"),
                    _ => format!("{tag}/{level}/{index}"),
                };
                let mut plane_links = Vec::with_capacity(transport.rank_size());
                for req in &transport.transport_requests {
                    if !req.is_valid {
                        plane_links.push(None);
                        continue;
                    }
                    if req.local_user_rank != rank {
                        return Err(CollexError::internal(format!(
                            "{plane_key}: request for rank {} built on rank {rank}",
                            req.local_user_rank
                        )));
                    }
                    plane_links.push(Some(self.fabric.connect(
                        &plane_key,
                        rank,
                        req.remote_user_rank,
                        self.link_timeout,
                    )?));
                }
                built.push(PlaneLinks {
                    plane_key,
                    transport: transport.clone(),
                    links: plane_links,
                });
            }
            links.insert(level, built);
        }

        let scratch = (request.scratch_mem_size > 0)
            .then(|| DeviceMem::alloc(request.scratch_mem_size as usize));
        let (aiv_input, aiv_output) = if request.need_aiv_buffer {
            (
                Some(DeviceMem::alloc(self.ccl_input.size())),
                Some(DeviceMem::alloc(self.ccl_output.size())),
            )
        } else {
            (None, None)
        };

        tracing::debug!(
            rank,
            tag,
            streams = bundle.streams.len(),
            notifies = bundle.notifies.len(),
            scratch = request.scratch_mem_size,
            levels = links.len(),
            "alloc: resources built"
        );

        Ok(ResourceResponse {
            ccl_input: self.ccl_input.clone(),
            ccl_output: self.ccl_output.clone(),
            scratch,
            aiv_input,
            aiv_output,
            streams: bundle.streams,
            notifies: bundle.notifies,
            links,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollexConfig;
    use crate::resource::{MemKind, SingleSubCommTransport};

    #[tokio::test]
    async fn test_allocate_ring_plane() {
        let ctx = Arc::new(CommunicatorContext::new(&CollexConfig::default()));
        let alloc = LocalAllocator::new(
            Arc::new(LocalFabric::new()),
            ctx,
            1024,
            Duration::from_secs(1),
        );
        let mut comm_transport = IndexMap::new();
        comm_transport.insert(
            CommLevel::Level0,
            vec![SingleSubCommTransport::ring(1, vec![0, 1, 2, 3], MemKind::CclInput, MemKind::CclOutput).unwrap()],
        );
        let req = ResourceRequest {
            scratch_mem_size: 256,
            stream_num: 2,
            notify_num: 4,
            need_aiv_buffer: false,
            comm_transport,
        };
        let resp = alloc.allocate(1, "t", &req).unwrap();
        assert_eq!(resp.streams.len(), 2);
        assert_eq!(resp.notifies.len(), 4);
        assert_eq!(resp.scratch.as_ref().map(DeviceMem::size), Some(256));
        let view = resp.sub_comm(CommLevel::Level0, 0).unwrap();
        assert_eq!(view.local_rank, 1);
        assert!(view.link(0).is_ok());
        assert!(view.link(2).is_ok());
        assert!(view.link(3).is_err());
        assert!(resp.check_comm_size(CommLevel::Level0, 2).is_err());
        assert!(resp.covers(&req));

        let mut bigger = req.clone();
        bigger.scratch_mem_size = 512;
        assert!(!resp.covers(&bigger));
        let mut other_plane = req.clone();
        other_plane.comm_transport.insert(
            CommLevel::Level1,
            vec![SingleSubCommTransport::ring(1, vec![1, 5], MemKind::CclInput, MemKind::CclOutput).unwrap()],
        );
        assert!(!resp.covers(&other_plane));
    }
}
