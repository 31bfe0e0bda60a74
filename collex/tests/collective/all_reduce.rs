use collex::device::TraceKind;
use collex::{
    AlgType, CollexConfig, CommTopology, DataType, DeviceMem, Level0Algo, Level1Algo, Level2Algo,
    ReduceOp, Stream, StreamTrace,
};
use std::sync::Arc;

use super::helpers::{f32_mem, pattern, read_f32, run_collective, test_config, zeroed_f32};

fn summed(world: u32, count: usize) -> Vec<f32> {
    let mut total = vec![0.0f32; count];
    for r in 0..world {
        for (t, v) in total.iter_mut().zip(pattern(r, count)) {
            *t += v;
        }
    }
    total
}

async fn check_all_reduce(topo: CommTopology, config: CollexConfig, count: usize) {
    let world = topo.rank_size();
    run_collective(topo, config, move |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let input = f32_mem(&pattern(rank, count));
        let output = zeroed_f32(count);

        comm.all_reduce("ar", &input, &output, count as u64, DataType::F32, ReduceOp::Sum, &stream)
            .await
            .unwrap();

        assert_eq!(read_f32(&output), summed(world, count), "rank {rank} all_reduce failed");
    })
    .await;
}

#[tokio::test]
async fn test_all_reduce_one_module() {
    check_all_reduce(CommTopology::new(2, 2).unwrap(), test_config(), 256).await;
}

#[tokio::test]
async fn test_all_reduce_two_mesh_modules() {
    check_all_reduce(CommTopology::new(4, 2).unwrap(), test_config(), 512).await;
}

#[tokio::test]
async fn test_all_reduce_8p_ring() {
    check_all_reduce(CommTopology::new(8, 8).unwrap(), test_config(), 2048).await;
}

#[tokio::test]
async fn test_all_reduce_chunked_single_ring() {
    // 64 KiB transit holds 16384 elements per loop
    check_all_reduce(CommTopology::new(6, 3).unwrap(), test_config(), 20000).await;
}

#[tokio::test]
async fn test_all_reduce_one_device_per_module() {
    check_all_reduce(CommTopology::new(4, 1).unwrap(), test_config(), 128).await;
}

#[tokio::test]
async fn test_all_reduce_forced_level1() {
    for level1 in [Level1Algo::Hd, Level1Algo::Nhr, Level1Algo::Ring] {
        let config = CollexConfig {
            algo: Some(AlgType::encode(Level0Algo::Mesh2P, level1, Level2Algo::Ring)),
            ..test_config()
        };
        check_all_reduce(CommTopology::new(8, 2).unwrap(), config, 1024).await;
    }
}

#[tokio::test]
async fn test_all_reduce_in_place_max_i32() {
    run_collective(CommTopology::new(4, 2).unwrap(), test_config(), |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let values: Vec<i32> = (0..64).map(|i| if i % 4 == rank as i32 { 100 + i } else { -i }).collect();
        let buf = DeviceMem::from_vec(values.iter().flat_map(|x| x.to_le_bytes()).collect());

        comm.all_reduce("ar_max", &buf, &buf, 64, DataType::I32, ReduceOp::Max, &stream)
            .await
            .unwrap();

        let got: Vec<i32> = buf
            .read()
            .unwrap()
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let expected: Vec<i32> = (0..64).map(|i| 100 + i).collect();
        assert_eq!(got, expected, "rank {rank} all_reduce max failed");
    })
    .await;
}

#[tokio::test]
async fn test_all_reduce_rejects_short_output() {
    run_collective(CommTopology::new(2, 2).unwrap(), test_config(), |comm| async move {
        let stream = Stream::new(comm.rank()).unwrap();
        let input = zeroed_f32(16);
        let output = zeroed_f32(8);
        let err = comm
            .all_reduce("ar_short", &input, &output, 16, DataType::F32, ReduceOp::Sum, &stream)
            .await
            .unwrap_err();
        assert!(
            matches!(err.root(), collex::CollexError::BufferSizeMismatch { .. }),
            "unexpected error {err}"
        );
    })
    .await;
}

#[tokio::test]
async fn test_inline_and_staged_reduce_agree() {
    for inline_reduce in [true, false] {
        let config = CollexConfig {
            inline_reduce,
            ..test_config()
        };
        run_collective(CommTopology::new(4, 1).unwrap(), config, move |comm| async move {
            let rank = comm.rank();
            let trace = Arc::new(StreamTrace::new());
            let stream = Stream::with_trace(rank, Arc::clone(&trace)).unwrap();
            let input = f32_mem(&pattern(rank, 128));
            let output = zeroed_f32(128);

            comm.all_reduce("ar_attr", &input, &output, 128, DataType::F32, ReduceOp::Sum, &stream)
                .await
                .unwrap();
            assert_eq!(read_f32(&output), summed(4, 128), "rank {rank} inline {inline_reduce}");

            let events = trace.drain();
            let ran = |label: &'static str| events.iter().any(|e| e.kind == TraceKind::Task(label));
            assert_eq!(ran("link_rx_reduce"), inline_reduce, "rank {rank}: {events:?}");
            assert_eq!(ran("local_reduce"), !inline_reduce, "rank {rank}: {events:?}");
        })
        .await;
    }
}
