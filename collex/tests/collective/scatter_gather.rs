use collex::{CommTopology, DataType, Stream};

use super::helpers::{f32_mem, pattern, read_f32, run_collective, test_config, zeroed_f32};

async fn check_scatter(topo: CommTopology, root: u32, count: usize) {
    let world = topo.rank_size() as usize;
    run_collective(topo, test_config(), move |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let input = if rank == root {
            f32_mem(&pattern(root, count * world))
        } else {
            zeroed_f32(0)
        };
        let output = zeroed_f32(count);

        comm.scatter("sc", &input, &output, count as u64, DataType::F32, root, &stream)
            .await
            .unwrap();

        let whole = pattern(root, count * world);
        let mine = &whole[rank as usize * count..(rank as usize + 1) * count];
        assert_eq!(read_f32(&output), mine, "rank {rank} scatter failed");
    })
    .await;
}

async fn check_gather(topo: CommTopology, root: u32, count: usize) {
    let world = topo.rank_size();
    run_collective(topo, test_config(), move |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let input = f32_mem(&pattern(rank, count));
        let output = zeroed_f32(if rank == root { count * world as usize } else { 0 });

        comm.gather("ga", &input, &output, count as u64, DataType::F32, root, &stream)
            .await
            .unwrap();

        if rank == root {
            let expected: Vec<f32> = (0..world).flat_map(|r| pattern(r, count)).collect();
            assert_eq!(read_f32(&output), expected, "root {rank} gather failed");
        }
    })
    .await;
}

#[tokio::test]
async fn test_scatter_from_root_0() {
    check_scatter(CommTopology::new(2, 2).unwrap(), 0, 64).await;
}

#[tokio::test]
async fn test_scatter_from_non_zero_root() {
    check_scatter(CommTopology::new(4, 2).unwrap(), 2, 100).await;
}

#[tokio::test]
async fn test_scatter_8p_ring() {
    check_scatter(CommTopology::new(8, 8).unwrap(), 7, 256).await;
}

#[tokio::test]
async fn test_scatter_chunked_single_ring() {
    check_scatter(CommTopology::new(6, 3).unwrap(), 1, 3000).await;
}

#[tokio::test]
async fn test_gather_to_root_0() {
    check_gather(CommTopology::new(2, 2).unwrap(), 0, 64).await;
}

#[tokio::test]
async fn test_gather_to_non_zero_root() {
    check_gather(CommTopology::new(4, 2).unwrap(), 3, 100).await;
}

#[tokio::test]
async fn test_gather_chunked_single_ring() {
    check_gather(CommTopology::new(6, 3).unwrap(), 4, 3000).await;
}

#[tokio::test]
async fn test_gather_one_device_per_module() {
    check_gather(CommTopology::new(4, 1).unwrap(), 1, 48).await;
}
