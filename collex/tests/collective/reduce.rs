use collex::{CommTopology, DataType, ReduceOp, Stream};

use super::helpers::{f32_mem, pattern, read_f32, run_collective, test_config, zeroed_f32};

async fn check_reduce(topo: CommTopology, root: u32, count: usize, op: ReduceOp) {
    let world = topo.rank_size();
    run_collective(topo, test_config(), move |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let input = f32_mem(&pattern(rank, count));
        let output = zeroed_f32(count);

        comm.reduce("red", &input, &output, count as u64, DataType::F32, op, root, &stream)
            .await
            .unwrap();

        if rank == root {
            let expected: Vec<f32> = (0..count)
                .map(|i| {
                    let column = (0..world).map(|r| pattern(r, count)[i]);
                    match op {
                        ReduceOp::Max => column.fold(f32::MIN, f32::max),
                        _ => column.sum(),
                    }
                })
                .collect();
            assert_eq!(read_f32(&output), expected, "root {rank} reduce failed");
        }
    })
    .await;
}

#[tokio::test]
async fn test_reduce_to_root_0() {
    check_reduce(CommTopology::new(2, 2).unwrap(), 0, 128, ReduceOp::Sum).await;
}

#[tokio::test]
async fn test_reduce_to_non_zero_root() {
    check_reduce(CommTopology::new(4, 2).unwrap(), 3, 256, ReduceOp::Sum).await;
}

#[tokio::test]
async fn test_reduce_max_8p_ring() {
    check_reduce(CommTopology::new(8, 8).unwrap(), 2, 1024, ReduceOp::Max).await;
}

#[tokio::test]
async fn test_reduce_chunked_single_ring() {
    check_reduce(CommTopology::new(6, 3).unwrap(), 5, 20000, ReduceOp::Sum).await;
}

#[tokio::test]
async fn test_reduce_one_device_per_module() {
    check_reduce(CommTopology::new(4, 1).unwrap(), 1, 64, ReduceOp::Sum).await;
}
