use collex::device::TraceKind;
use collex::{CollexConfig, CommTopology, DataType, ReduceOp, Stream, StreamTrace};
use std::sync::Arc;

use super::helpers::{f32_mem, pattern, read_f32, run_collective, test_config, zeroed_f32};

/// Rank `rank`'s block of the element-wise sum over `world` inputs.
fn expected_block(world: u32, count: usize, rank: u32) -> Vec<f32> {
    let total = count * world as usize;
    let base = rank as usize * count;
    let mut block = vec![0.0f32; count];
    for q in 0..world {
        let input = pattern(q, total);
        for (b, v) in block.iter_mut().zip(&input[base..base + count]) {
            *b += v;
        }
    }
    block
}

async fn check_reduce_scatter(topo: CommTopology, config: CollexConfig, count: usize) {
    let world = topo.rank_size();
    let total = count * world as usize;
    run_collective(topo, config, move |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let input = f32_mem(&pattern(rank, total));
        let output = zeroed_f32(count);

        comm.reduce_scatter("rs", &input, &output, count as u64, DataType::F32, ReduceOp::Sum, &stream)
            .await
            .unwrap();

        assert_eq!(read_f32(&output), expected_block(world, count, rank), "rank {rank} reduce_scatter failed");
    })
    .await;
}

#[tokio::test]
async fn test_reduce_scatter_one_module() {
    check_reduce_scatter(CommTopology::new(2, 2).unwrap(), test_config(), 128).await;
}

#[tokio::test]
async fn test_reduce_scatter_two_mesh_modules() {
    check_reduce_scatter(CommTopology::new(4, 2).unwrap(), test_config(), 200).await;
}

#[tokio::test]
async fn test_reduce_scatter_8p_ring() {
    check_reduce_scatter(CommTopology::new(8, 8).unwrap(), test_config(), 512).await;
}

#[tokio::test]
async fn test_reduce_scatter_chunked_single_ring() {
    // 64 KiB transit / (6 ranks * 4 bytes) = 2730 elements per loop
    check_reduce_scatter(CommTopology::new(6, 3).unwrap(), test_config(), 3000).await;
}

#[tokio::test]
async fn test_reduce_scatter_one_device_per_module() {
    check_reduce_scatter(CommTopology::new(4, 1).unwrap(), test_config(), 64).await;
}

#[tokio::test]
async fn test_deterministic_mesh_rounds_stay_on_one_stream() {
    for deterministic in [true, false] {
        let config = CollexConfig {
            deterministic,
            ..test_config()
        };
        run_collective(CommTopology::new(4, 4).unwrap(), config, move |comm| async move {
            let rank = comm.rank();
            let trace = Arc::new(StreamTrace::new());
            let stream = Stream::with_trace(rank, Arc::clone(&trace)).unwrap();
            let input = f32_mem(&pattern(rank, 4 * 96));
            let output = zeroed_f32(96);

            comm.reduce_scatter("rs_det", &input, &output, 96, DataType::F32, ReduceOp::Sum, &stream)
                .await
                .unwrap();
            assert_eq!(read_f32(&output), expected_block(4, 96, rank), "rank {rank}");

            let events = trace.drain();
            let reduces = events
                .iter()
                .filter(|e| e.kind == TraceKind::Task("link_rx_reduce"))
                .count();
            let posts = events.iter().filter(|e| matches!(e.kind, TraceKind::Post(_))).count();
            if deterministic {
                assert_eq!(reduces, 3, "rank {rank}: {events:?}");
                assert_eq!(posts, 0, "rank {rank}: {events:?}");
            } else {
                assert_eq!(reduces, 0, "rank {rank}: {events:?}");
                assert_eq!(posts, 3, "rank {rank}: {events:?}");
            }
        })
        .await;
    }
}
