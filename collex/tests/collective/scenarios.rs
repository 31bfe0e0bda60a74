//! End-to-end checks of resource sizing, loop splitting, divergence
//! detection and the one-rank fast path.

use collex::device::TraceKind;
use collex::executor::ResourceNegotiable;
use collex::{
    AlgType, AllToAllVInfo, CollExecutor, CollexConfig, CommLevel, CommTopology, CommunicatorContext, Communicator,
    ConsistencyChecker, DataType, DeviceMem, ExecutorCore, ExecutorRegistry, Level0Algo, Level1Algo, Level2Algo,
    LocalConsistency, LocalFabric, OpParam, ReduceOp, Stream, StreamTrace,
};
use std::sync::Arc;
use std::time::Duration;

use super::helpers::{RecordingChecker, f32_mem, pattern, read_f32, run_collective, run_on, test_config, zeroed_f32};

#[tokio::test]
async fn test_8p_ring_resources() {
    let config = CollexConfig {
        algo: Some(AlgType::encode(Level0Algo::Ring8P, Level1Algo::Ring, Level2Algo::Ring)),
        ..test_config()
    };
    run_collective(CommTopology::new(8, 8).unwrap(), config, |comm| async move {
        let rank = comm.rank();
        assert!(comm.alg_type(collex::OpKind::AllGather).unwrap().is_8p_ring());
        let stream = Stream::new(rank).unwrap();
        for count in [1usize, 1024] {
            let tag = format!("ag8_{count}");
            let input = f32_mem(&pattern(rank, count));
            let output = zeroed_f32(8 * count);
            comm.all_gather(&tag, &input, &output, count as u64, DataType::F32, &stream)
                .await
                .unwrap();
            let expected: Vec<f32> = (0..8).flat_map(|r| pattern(r, count)).collect();
            assert_eq!(read_f32(&output), expected, "rank {rank} count {count}");

            let resp = comm
                .context()
                .response(&format!("{tag}_AllGatherRingExecutor"))
                .unwrap()
                .expect("resources kept after success");
            assert_eq!(resp.planes(CommLevel::Level0), 8);
            assert_eq!(resp.streams.len(), 7);
            assert_eq!(resp.notifies.len(), 14);
        }
    })
    .await;
}

#[tokio::test]
async fn test_loop_split_registers_each_iteration() {
    let checker = Arc::new(RecordingChecker::new(2));
    let config = CollexConfig {
        ccl_buffer_size: 1024,
        ..test_config()
    };
    let comms = Communicator::local_group_with(
        CommTopology::new(2, 2).unwrap(),
        config,
        Arc::clone(&checker) as Arc<dyn ConsistencyChecker>,
    )
    .unwrap();

    run_on(comms, |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let input = f32_mem(&pattern(rank, 896));
        let output = zeroed_f32(896);
        comm.all_reduce("split", &input, &output, 896, DataType::F32, ReduceOp::Sum, &stream)
            .await
            .unwrap();
        let expected: Vec<f32> = (0..896).map(|i| pattern(0, 896)[i] + pattern(1, 896)[i]).collect();
        assert_eq!(read_f32(&output), expected, "rank {rank}");
    })
    .await;

    for rank in 0..2 {
        assert_eq!(checker.counts_of(rank), vec![256, 256, 256, 128], "rank {rank}");
    }
}

#[tokio::test]
async fn test_divergent_count_is_caught_before_any_transfer() {
    let topo = Arc::new(CommTopology::new(2, 2).unwrap());
    let config = Arc::new(CollexConfig {
        link_timeout: Duration::from_millis(300),
        notify_wait_timeout: Duration::from_millis(300),
        ..test_config()
    });
    let fabric = Arc::new(LocalFabric::new());
    let checker: Arc<dyn ConsistencyChecker> = Arc::new(LocalConsistency::new(2));
    let comms: Vec<Communicator> = (0..2)
        .map(|rank| {
            Communicator::new(
                rank,
                Arc::clone(&topo),
                Arc::clone(&config),
                Arc::clone(&fabric),
                Arc::clone(&checker),
            )
            .unwrap()
        })
        .collect();

    let s0 = Stream::new(0).unwrap();
    let buf0 = zeroed_f32(256);
    let mut first = OpParam::all_reduce("div", buf0.clone(), buf0, 256, DataType::F32, ReduceOp::Sum, s0.clone());
    comms[0].launch(&mut first).unwrap();

    let s1 = Stream::new(1).unwrap();
    let buf1 = zeroed_f32(256);
    let err = comms[1]
        .all_reduce("div", &buf1, &buf1, 128, DataType::F32, ReduceOp::Sum, &s1)
        .await
        .unwrap_err();
    assert!(err.is_divergence(), "expected divergence, got {err}");
    assert_eq!(fabric.transfers_issued(1), 0);
    assert!(fabric.transfers_issued(0) > 0);

    // rank 0 never hears from its peer
    assert!(s0.synchronize().await.is_err());

    // the failed call's resources stay up until released
    let ctx = comms[1].context();
    let kept = ctx.response("div_AllReduceMeshExecutor").unwrap().expect("kept after failure");
    assert!(kept.planes(CommLevel::Level0) > 0);
    comms[1].release("div").unwrap();
    assert!(ctx.response("div_AllReduceMeshExecutor").unwrap().is_none());
    assert_eq!(ctx.scratch_high_water("div_AllReduceMeshExecutor").unwrap(), 0);
}

#[tokio::test]
async fn test_staged_scratch_growth_forces_rebuild() {
    let topo = Arc::new(CommTopology::new(8, 4).unwrap());
    let config = Arc::new(CollexConfig {
        ccl_buffer_size: 1 << 20,
        ..CollexConfig::default()
    });
    let ctx = Arc::new(CommunicatorContext::new(&config));
    let alg = AlgType::encode(topo.get_topo_type().level0(), Level1Algo::Ring, Level2Algo::Ring);
    let core = ExecutorCore::new(5, Arc::clone(&topo), config, alg, ctx, Arc::new(LocalConsistency::new(8)));
    let mut exec = ExecutorRegistry::with_defaults()
        .create("RunAlltoAllVStaged", core)
        .unwrap();

    // 32Ki f32 to every peer: the staging area outgrows the 1 MiB transit size
    let per_peer = 32 * 1024;
    let table: Vec<AllToAllVInfo> = (0..8)
        .map(|_| AllToAllVInfo::packed(vec![per_peer; 8], vec![per_peer; 8]))
        .collect();
    exec.set_executor_extra_info(&table).unwrap();
    let mem = DeviceMem::alloc(8 * per_peer as usize * 4);
    let param = OpParam::all_to_all_v("grow", mem.clone(), mem, DataType::F32, table, Stream::new(0).unwrap());
    let req = exec.calc_res_request(&param).unwrap();

    assert!(req.scratch_mem_size > 1 << 20);
    assert!(exec.check_need_recreate_comm(1 << 20));
    assert!(!exec.check_need_recreate_comm(4 << 20));
}

#[tokio::test]
async fn test_single_rank_is_one_local_copy() {
    let checker = Arc::new(RecordingChecker::new(1));
    let comms = Communicator::local_group_with(
        CommTopology::new(1, 1).unwrap(),
        test_config(),
        Arc::clone(&checker) as Arc<dyn ConsistencyChecker>,
    )
    .unwrap();
    let comm = &comms[0];
    let trace = Arc::new(StreamTrace::new());
    let stream = Stream::with_trace(0, Arc::clone(&trace)).unwrap();
    let input = f32_mem(&pattern(0, 64));
    let output = zeroed_f32(64);

    comm.all_reduce("solo", &input, &output, 64, DataType::F32, ReduceOp::Sum, &stream)
        .await
        .unwrap();

    assert_eq!(read_f32(&output), pattern(0, 64));
    let events = trace.drain();
    assert!(
        events
            .iter()
            .all(|e| !matches!(e.kind, TraceKind::Post(_) | TraceKind::WaitDone(_))),
        "single rank synchronised streams: {events:?}"
    );
    assert_eq!(checker.counts_of(0), vec![64]);
    assert_eq!(comm.alg_type(collex::OpKind::AllReduce).unwrap().level1(), Level1Algo::Ring);
}
