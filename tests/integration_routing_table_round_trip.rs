//! Scenario 5 from spec.md §8: a routing table missing an entry for one
//! rank, with the `to_none` default, is incomplete and every engine that
//! requires a complete table refuses it at construction.

use std::sync::Arc;

use rdma_alltoall_bench::channel_runner::{self, ChannelRunnerConfig};
use rdma_alltoall_bench::comm::Communicator;
use rdma_alltoall_bench::error::{BenchError, ConfigError};
use rdma_alltoall_bench::gap::tag_engine::{self, TagEngineConfig};
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

fn table_missing_rank_one() -> RoutingTable {
    let mut table = RoutingTable::new();
    table.insert(0, vec![2]);
    table.insert(2, vec![0]);
    table
}

#[tokio::test]
async fn incomplete_table_is_reported_and_refused_by_both_gap_engines() {
    let router = Router::new(3, 0, table_missing_rank_one(), DefaultRouting::ToNone);
    assert!(!router.is_complete());

    let transports = loopback_mesh(3).await;
    let transport = Arc::clone(&transports[0]);
    let err = tag_engine::run(
        transport,
        &router,
        TagEngineConfig {
            iterations: 1,
            max_gap: 1,
            packet_element_count: 1,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        BenchError::Config(ConfigError::IncompleteRoutingTable { rank: 0 })
    ));
}

#[tokio::test]
async fn incomplete_table_is_refused_by_the_channel_runner() {
    let router = Router::new(3, 0, table_missing_rank_one(), DefaultRouting::ToNone);
    let transports = loopback_mesh(3).await;
    let transport = Arc::clone(&transports[0]);
    let comm = Communicator::new(transport, &["packet"]).await.unwrap();
    let err = channel_runner::run(
        comm,
        &router,
        ChannelRunnerConfig {
            iterations: 1,
            iters_to_sync: 1,
            channel_priorities: vec![0],
            packet_element_count: 1,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err,
        BenchError::Config(ConfigError::IncompleteRoutingTable { rank: 0 })
    ));
}
