//! Scenario 3 from spec.md §8: three ranks, two channels with priorities
//! `[1, 2]`, re-synchronizing every 2 iterations, driven over a real
//! loopback TCP mesh end-to-end through `Communicator` and the channel
//! runner together (the unit tests in `comm/mod.rs` and
//! `channel_runner.rs` each exercise one half of this in isolation).

use std::sync::Arc;

use rdma_alltoall_bench::channel_runner::{self, ChannelRunnerConfig};
use rdma_alltoall_bench::comm::Communicator;
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
async fn three_ranks_two_channels_close_cleanly_with_priorities() {
    let transports = loopback_mesh(3).await;
    let mut tasks = Vec::new();
    for transport in transports {
        let rank = transport.rank();
        let router = Router::new(3, rank, RoutingTable::new(), DefaultRouting::ToAll);
        tasks.push(tokio::spawn(async move {
            let comm = Communicator::new(transport, &["A", "B"]).await.unwrap();
            channel_runner::run(
                comm,
                &router,
                ChannelRunnerConfig {
                    iterations: 5,
                    iters_to_sync: 2,
                    channel_priorities: vec![1, 2],
                    packet_element_count: 4,
                },
            )
            .await
            .unwrap()
        }));
    }

    // wire_size(4) = 12-byte header + 4*4 payload bytes = 28B per packet.
    const PACKET_BYTES: u64 = 28;
    for task in tasks {
        let result = task.await.unwrap();
        // channel A: 5 * (1+1) = 10 sends/peer, channel B: 5 * (1+2) = 15
        // sends/peer, to 2 peers each.
        let expected_sent = (10 + 15) * 2 * PACKET_BYTES;
        assert_eq!(result.bytes_sent, expected_sent);
        assert_eq!(result.bytes_received, expected_sent);
    }
}
