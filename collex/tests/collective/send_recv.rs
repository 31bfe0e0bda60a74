use collex::{CommTopology, DataType, SendRecvItem, SendRecvKind, Stream};

use super::helpers::{f32_mem, pattern, read_f32, run_collective, test_config, zeroed_f32};

#[tokio::test]
async fn test_send_recv_ping_pong() {
    run_collective(CommTopology::new(4, 2).unwrap(), test_config(), |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        // 0 <-> 3 crosses modules, 1 and 2 stay idle
        match rank {
            0 => {
                comm.send("ping", &f32_mem(&pattern(0, 40)), 40, DataType::F32, 3, &stream)
                    .await
                    .unwrap();
                let back = zeroed_f32(40);
                comm.recv("pong", &back, 40, DataType::F32, 3, &stream)
                    .await
                    .unwrap();
                assert_eq!(read_f32(&back), pattern(3, 40));
            }
            3 => {
                let got = zeroed_f32(40);
                comm.recv("ping", &got, 40, DataType::F32, 0, &stream)
                    .await
                    .unwrap();
                assert_eq!(read_f32(&got), pattern(0, 40));
                comm.send("pong", &f32_mem(&pattern(3, 40)), 40, DataType::F32, 0, &stream)
                    .await
                    .unwrap();
            }
            _ => {}
        }
    })
    .await;
}

#[tokio::test]
async fn test_send_recv_repeated_on_one_tag() {
    run_collective(CommTopology::new(2, 2).unwrap(), test_config(), |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        for round in 0..3u32 {
            if rank == 1 {
                comm.send("p", &f32_mem(&pattern(round, 16)), 16, DataType::F32, 0, &stream)
                    .await
                    .unwrap();
            } else {
                let got = zeroed_f32(16);
                comm.recv("p", &got, 16, DataType::F32, 1, &stream)
                    .await
                    .unwrap();
                assert_eq!(read_f32(&got), pattern(round, 16), "round {round}");
            }
        }
    })
    .await;
}

#[tokio::test]
async fn test_batch_send_recv_ring_shift() {
    run_collective(CommTopology::new(4, 2).unwrap(), test_config(), |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let next = (rank + 1) % 4;
        let prev = (rank + 3) % 4;
        let incoming = zeroed_f32(24);
        let items = vec![
            SendRecvItem {
                kind: SendRecvKind::Recv,
                peer: prev,
                mem: incoming.clone(),
                count: 24,
                dtype: DataType::F32,
            },
            SendRecvItem {
                kind: SendRecvKind::Send,
                peer: next,
                mem: f32_mem(&pattern(rank, 24)),
                count: 24,
                dtype: DataType::F32,
            },
        ];

        comm.batch_send_recv("shift", items, &stream).await.unwrap();

        assert_eq!(read_f32(&incoming), pattern(prev, 24), "rank {rank} batch failed");
    })
    .await;
}

#[tokio::test]
async fn test_send_to_self_rejected() {
    run_collective(CommTopology::new(2, 2).unwrap(), test_config(), |comm| async move {
        let rank = comm.rank();
        let stream = Stream::new(rank).unwrap();
        let err = comm
            .send("self", &zeroed_f32(4), 4, DataType::F32, rank, &stream)
            .await
            .unwrap_err();
        assert!(matches!(err.root(), collex::CollexError::Param { .. }), "unexpected error {err}");
    })
    .await;
}
