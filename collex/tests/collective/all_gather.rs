use collex::{AlgType, CollexConfig, CommTopology, DataType, Level0Algo, Level1Algo, Level2Algo, Stream};

use super::helpers::{f32_mem, pattern, read_f32, run_collective, test_config, zeroed_f32};

async fn check_all_gather(topo: CommTopology, config: CollexConfig, count: usize) {
    let world = topo.rank_size();
    run_collective(topo, config, move |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let input = f32_mem(&pattern(rank, count));
        let output = zeroed_f32(count * world as usize);

        comm.all_gather("ag", &input, &output, count as u64, DataType::F32, &stream)
            .await
            .unwrap();

        let expected: Vec<f32> = (0..world).flat_map(|r| pattern(r, count)).collect();
        assert_eq!(read_f32(&output), expected, "rank {rank} all_gather failed");
    })
    .await;
}

#[tokio::test]
async fn test_all_gather_one_module() {
    check_all_gather(CommTopology::new(2, 2).unwrap(), test_config(), 64).await;
}

#[tokio::test]
async fn test_all_gather_two_mesh_modules() {
    check_all_gather(CommTopology::new(4, 2).unwrap(), test_config(), 300).await;
}

#[tokio::test]
async fn test_all_gather_8p_ring() {
    check_all_gather(CommTopology::new(8, 8).unwrap(), test_config(), 1024).await;
}

#[tokio::test]
async fn test_all_gather_chunked_single_ring() {
    // 64 KiB transit / (6 ranks * 4 bytes) = 2730 elements per loop
    check_all_gather(CommTopology::new(6, 3).unwrap(), test_config(), 5000).await;
}

#[tokio::test]
async fn test_all_gather_one_device_per_module() {
    check_all_gather(CommTopology::new(4, 1).unwrap(), test_config(), 96).await;
}

#[tokio::test]
async fn test_all_gather_forced_halving_doubling() {
    let config = CollexConfig {
        algo: Some(AlgType::encode(Level0Algo::Mesh2P, Level1Algo::Hd, Level2Algo::Ring)),
        ..test_config()
    };
    check_all_gather(CommTopology::new(8, 2).unwrap(), config, 200).await;
}

#[tokio::test]
async fn test_all_gather_twice_reuses_resources() {
    run_collective(CommTopology::new(4, 2).unwrap(), test_config(), |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        for round in 0..2u32 {
            let input = f32_mem(&pattern(rank + round, 32));
            let output = zeroed_f32(32 * 4);
            comm.all_gather("ag_twice", &input, &output, 32, DataType::F32, &stream)
                .await
                .unwrap();
            let expected: Vec<f32> = (0..4).flat_map(|r| pattern(r + round, 32)).collect();
            assert_eq!(read_f32(&output), expected, "rank {rank} round {round}");
        }
    })
    .await;
}
