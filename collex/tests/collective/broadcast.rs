use collex::{CommTopology, DataType, Stream};

use super::helpers::{f32_mem, pattern, read_f32, run_collective, test_config};

async fn check_broadcast(topo: CommTopology, root: u32, count: usize) {
    run_collective(topo, test_config(), move |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let initial = if rank == root { pattern(root, count) } else { vec![0.0; count] };
        let buf = f32_mem(&initial);

        comm.broadcast("bc", &buf, count as u64, DataType::F32, root, &stream)
            .await
            .unwrap();

        assert_eq!(read_f32(&buf), pattern(root, count), "rank {rank} broadcast failed");
    })
    .await;
}

#[tokio::test]
async fn test_broadcast_from_root_0() {
    check_broadcast(CommTopology::new(2, 2).unwrap(), 0, 64).await;
}

#[tokio::test]
async fn test_broadcast_from_last_rank() {
    check_broadcast(CommTopology::new(4, 2).unwrap(), 3, 300).await;
}

#[tokio::test]
async fn test_broadcast_8p_ring() {
    check_broadcast(CommTopology::new(8, 8).unwrap(), 5, 1024).await;
}

#[tokio::test]
async fn test_broadcast_chunked_single_ring() {
    check_broadcast(CommTopology::new(6, 3).unwrap(), 4, 20000).await;
}

#[tokio::test]
async fn test_broadcast_one_device_per_module() {
    check_broadcast(CommTopology::new(4, 1).unwrap(), 2, 100).await;
}

#[tokio::test]
async fn test_broadcast_two_super_pods() {
    let topo = CommTopology::new(8, 2).unwrap().super_pods(2).unwrap();
    check_broadcast(topo, 6, 256).await;
}

#[tokio::test]
async fn test_broadcast_single_rank() {
    check_broadcast(CommTopology::new(1, 1).unwrap(), 0, 16).await;
}
