//! # Benchmark Dispatch
//!
//! Ties the bootstrap connector, routing table, and the mode-specific
//! engine together (SPEC_FULL.md §1 "Process model"): resolves this
//! process's rank/size/peers, connects the `TcpTransport` mesh, loads the
//! routing table, and dispatches to the engine `cli::BenchMode` selects.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::channel_runner::{self, ChannelRunnerConfig};
use crate::cli::{BenchMode, BenchmarkConfig};
use crate::comm::Communicator;
use crate::error::ConfigError;
use crate::gap::{circular_engine, rdma_engine, tag_engine, GapEngineResult};
use crate::router::{DefaultRouting, Router, RoutingTable};
use crate::transport::bootstrap::{self, BootstrapInfo};
use crate::transport::tcp::TcpTransport;

/// Resolves this process's rank/peers and connects the transport mesh,
/// per the bootstrap rule in spec.md §6 Environment.
pub async fn bootstrap_transport(config: &BenchmarkConfig) -> Result<Arc<TcpTransport>> {
    let info: BootstrapInfo = if bootstrap::running_under_mpi() {
        bootstrap::bootstrap_mpi(config.bind_addr).await?
    } else {
        let world_size = config
            .world_size
            .context("--world-size is required outside an MPI launcher")?;
        let rendezvous_addr: SocketAddr = config
            .rendezvous_addr
            .context("--rendezvous-addr is required outside an MPI launcher")?;
        let is_root = config.bind_addr == rendezvous_addr;
        bootstrap::bootstrap_tcp_rendezvous(config.bind_addr, rendezvous_addr, is_root, world_size)
            .await?
    };
    TcpTransport::connect_mesh(info.rank, info.listener, info.peer_addrs)
        .await
        .map_err(Into::into)
}

fn load_router(config: &BenchmarkConfig, rank: u64, world_size: u64) -> Result<Router> {
    let table = match &config.routing_table_path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading routing table {path:?}"))?;
            RoutingTable::parse(&text)?
        }
        None => RoutingTable::new(),
    };
    Ok(Router::new(world_size, rank, table, DefaultRouting::ToAll))
}

/// Runs `config.mode` to completion and returns this rank's id alongside
/// its bandwidth summary.
pub async fn run(config: &BenchmarkConfig) -> Result<(u64, GapEngineResult)> {
    let transport = bootstrap_transport(config).await?;
    let rank = transport.rank();
    let world_size = transport.size();
    let router = load_router(config, rank, world_size)?;

    let result = run_mode(config, transport, &router, world_size).await?;
    Ok((rank, result))
}

async fn run_mode(
    config: &BenchmarkConfig,
    transport: Arc<TcpTransport>,
    router: &Router,
    world_size: u64,
) -> Result<GapEngineResult> {
    match config.mode {
        BenchMode::TagAllToAll => tag_engine::run(
            transport,
            router,
            tag_engine::TagEngineConfig {
                iterations: config.iterations,
                max_gap: config.max_gap,
                packet_element_count: config.packet_element_count,
            },
        )
        .await
        .map_err(Into::into),

        BenchMode::RdmaAllToAll => rdma_engine::run(
            transport,
            router,
            rdma_engine::RdmaEngineConfig {
                iterations: config.iterations,
                max_gap: config.max_gap,
                packet_element_count: config.packet_element_count,
            },
        )
        .await
        .map_err(Into::into),

        BenchMode::MultiChannel => {
            let channel_types: Vec<&'static str> =
                config.channel_priorities.iter().map(|_| "packet").collect();
            let comm = Communicator::new(transport, &channel_types).await?;
            channel_runner::run(
                comm,
                router,
                ChannelRunnerConfig {
                    iterations: config.iterations,
                    iters_to_sync: config.sync_iters,
                    channel_priorities: config.channel_priorities.clone(),
                    packet_element_count: config.packet_element_count,
                },
            )
            .await
            .map_err(Into::into)
        }

        BenchMode::PointToPoint => {
            if world_size != 2 {
                return Err(ConfigError::WorldSizeMismatch {
                    mode: "point_to_point",
                    required: 2,
                    actual: world_size,
                }
                .into());
            }
            tag_engine::run(
                transport,
                router,
                tag_engine::TagEngineConfig {
                    iterations: config.iterations,
                    max_gap: config.max_gap,
                    packet_element_count: config.packet_element_count,
                },
            )
            .await
            .map_err(Into::into)
        }

        BenchMode::CircularRdma => circular_engine::run(
            transport,
            router,
            circular_engine::CircularEngineConfig {
                iterations: config.iterations,
                chunk_size: config.chunk_size,
            },
        )
        .await
        .map_err(Into::into),
    }
}
