use collex::{AllToAllVInfo, CommTopology, DataType, Stream};

use super::helpers::{f32_mem, read_f32, run_collective, test_config, zeroed_f32};

/// Elements rank `from` sends to rank `to`; zero for some pairs.
fn volume(from: u32, to: u32) -> u64 {
    u64::from((from + 2 * to) % 5)
}

fn table(world: u32) -> Vec<AllToAllVInfo> {
    (0..world)
        .map(|i| {
            AllToAllVInfo::packed(
                (0..world).map(|j| volume(i, j)).collect(),
                (0..world).map(|j| volume(j, i)).collect(),
            )
        })
        .collect()
}

fn block(from: u32, to: u32) -> Vec<f32> {
    (0..volume(from, to))
        .map(|k| (from * 1000 + to * 50) as f32 + k as f32)
        .collect()
}

async fn check_all_to_all_v(topo: CommTopology) {
    let world = topo.rank_size();
    run_collective(topo, test_config(), move |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let sent: Vec<f32> = (0..world).flat_map(|to| block(rank, to)).collect();
        let expected: Vec<f32> = (0..world).flat_map(|from| block(from, rank)).collect();
        let input = f32_mem(&sent);
        let output = zeroed_f32(expected.len());

        comm.all_to_all_v("a2a", &input, &output, DataType::F32, table(world), &stream)
            .await
            .unwrap();

        assert_eq!(read_f32(&output), expected, "rank {rank} all_to_all_v failed");
    })
    .await;
}

#[tokio::test]
async fn test_all_to_all_v_full_mesh() {
    check_all_to_all_v(CommTopology::new(4, 4).unwrap()).await;
}

#[tokio::test]
async fn test_all_to_all_v_staged() {
    check_all_to_all_v(CommTopology::new(8, 4).unwrap()).await;
}

#[tokio::test]
async fn test_all_to_all_v_one_device_per_module() {
    check_all_to_all_v(CommTopology::new(3, 1).unwrap()).await;
}

#[tokio::test]
async fn test_all_to_all_v_rejects_short_table() {
    run_collective(CommTopology::new(2, 2).unwrap(), test_config(), |comm| async move {
        let stream = Stream::new(comm.rank()).unwrap();
        let buf = zeroed_f32(8);
        let err = comm
            .all_to_all_v("a2a_bad", &buf, &buf, DataType::F32, table(1), &stream)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), collex::CollexError::Param { .. }), "unexpected error {err}");
    })
    .await;
}
