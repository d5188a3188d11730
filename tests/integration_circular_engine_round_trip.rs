//! Scenario 6 from spec.md §8: circular RDMA mode, `chunk_size = 32 KiB`,
//! `iterations = 2` — every peer's receive cursor must advance by exactly
//! `2 * (10 MiB / 32 KiB) * 32 KiB = 20 MiB`, driven over a real loopback
//! TCP mesh.

use std::sync::Arc;

use rdma_alltoall_bench::gap::circular_engine::{self, CircularEngineConfig, BUFFER_SIZE};
use rdma_alltoall_bench::router::{DefaultRouting, Router, RoutingTable};
use rdma_alltoall_bench::transport::tcp::TcpTransport;
use tokio::net::TcpListener;

async fn loopback_mesh(size: u64) -> Vec<Arc<TcpTransport>> {
    let mut listeners = Vec::new();
    let mut addrs = Vec::new();
    for _ in 0..size {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap());
        listeners.push(listener);
    }
    let mut handles = Vec::new();
    for (rank, listener) in listeners.into_iter().enumerate() {
        let addrs = addrs.clone();
        handles.push(tokio::spawn(async move {
            TcpTransport::connect_mesh(rank as u64, listener, addrs)
                .await
                .unwrap()
        }));
    }
    let mut transports = Vec::new();
    for handle in handles {
        transports.push(handle.await.unwrap());
    }
    transports
}

#[tokio::test]
async fn four_ranks_circular_mode_advances_cursor_by_the_exact_scenario_amount() {
    const CHUNK_SIZE: usize = 32 * 1024;
    let transports = loopback_mesh(4).await;
    let mut tasks = Vec::new();
    for transport in transports {
        let rank = transport.rank();
        let router = Router::new(4, rank, RoutingTable::new(), DefaultRouting::ToAll);
        tasks.push(tokio::spawn(async move {
            circular_engine::run(
                transport,
                &router,
                CircularEngineConfig {
                    iterations: 2,
                    chunk_size: CHUNK_SIZE,
                },
            )
            .await
            .unwrap()
        }));
    }

    let expected_per_peer = 2 * (BUFFER_SIZE / CHUNK_SIZE) * CHUNK_SIZE;
    assert_eq!(expected_per_peer, 20 * 1024 * 1024);

    for task in tasks {
        let result = task.await.unwrap();
        // 3 peers each owe this rank `expected_per_peer` bytes.
        assert_eq!(result.bytes_received, (3 * expected_per_peer) as u64);
        assert_eq!(result.bytes_sent, (3 * expected_per_peer) as u64);
    }
}
