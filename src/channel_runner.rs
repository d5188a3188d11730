//! # Channel Runner
//!
//! Grounded on the original's `ucx_channel_runner<ChannelTypes...>`: drives
//! a [`Communicator`] through a fixed number of iterations, sending packets
//! to every destination in the route on every channel (each channel gets
//! `1 + priority` sends per destination per iteration, mirroring
//! `send_random_to_channel`'s `1 + m_channel_priorities[PORT]` loop),
//! periodically synchronizing every channel every `iters_to_sync`
//! iterations, then marking every channel EOF and draining until closed.
//!
//! Where the original spins up one OS thread each for the communicator's
//! own `run()` loop, the sender, and the receiver, this crate spawns one
//! task for each: [`Communicator::run`] drives the wire, the sender loop
//! below drives `send`/`synchronize`/`mark_eof`, and a receive task drains
//! every channel until all are closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::comm::Communicator;
use crate::error::{BenchError, ConfigError};
use crate::gap::GapEngineResult;
use crate::net_stats::NetStats;
use crate::packet::{Packet, PacketGenerator};
use crate::router::Router;
use crate::transport::Transport;

pub struct ChannelRunnerConfig {
    pub iterations: usize,
    pub iters_to_sync: usize,
    /// Extra sends per destination per iteration, per channel: channel `i`
    /// sends `1 + channel_priorities[i]` packets.
    pub channel_priorities: Vec<usize>,
    pub packet_element_count: usize,
}

/// Runs the multi-channel all-to-all to completion and returns this rank's
/// aggregate bandwidth across every channel.
pub async fn run<T: Transport + 'static>(
    comm: Arc<Communicator<T>>,
    router: &Router,
    config: ChannelRunnerConfig,
) -> Result<GapEngineResult, BenchError> {
    if config.iters_to_sync == 0 {
        return Err(ConfigError::ZeroSyncInterval.into());
    }
    if !router.is_complete() {
        return Err(ConfigError::IncompleteRoutingTable { rank: comm.rank() }.into());
    }

    let route = router.route();
    let num_channels = config.channel_priorities.len();
    let stats = Arc::new(Mutex::new(NetStats::new()));

    let wire_task = tokio::spawn(Arc::clone(&comm).run());

    let stopped = Arc::new(AtomicBool::new(false));
    let receiver = tokio::spawn({
        let comm = Arc::clone(&comm);
        let stats = Arc::clone(&stats);
        let stopped = Arc::clone(&stopped);
        async move {
            while !stopped.load(Ordering::Acquire) {
                let mut handled_any = false;
                for channel in 0..num_channels {
                    if let Ok(Some(packet)) = comm.try_receive::<Packet>(channel) {
                        stats.lock().update_received(packet.size());
                        handled_any = true;
                    }
                }
                if !handled_any {
                    tokio::task::yield_now().await;
                }
            }
        }
    });

    let mut generator = PacketGenerator::new(comm.rank(), config.packet_element_count, None);
    for iteration in 0..config.iterations {
        for &dest in &route {
            for (channel, &priority) in config.channel_priorities.iter().enumerate() {
                for _ in 0..=priority {
                    let packet = generator.generate();
                    let bytes = packet.size();
                    comm.send(channel, &packet, dest)?;
                    stats.lock().update_sent(bytes);
                }
            }
        }
        if iteration % config.iters_to_sync == 0 {
            for channel in 0..num_channels {
                comm.synchronize(channel).await?;
            }
        }
    }
    debug!(rank = comm.rank(), "channel runner send loop done");
    for channel in 0..num_channels {
        comm.mark_eof(channel);
    }

    wire_task
        .await
        .map_err(|e| BenchError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
    stopped.store(true, Ordering::Release);
    receiver.await.ok();

    let mut stats = stats.lock();
    stats.finish();
    Ok(GapEngineResult::from(&*stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{DefaultRouting, RoutingTable};
    use crate::transport::tcp::TcpTransport;
    use tokio::net::TcpListener;

    async fn mesh(size: u64) -> Vec<Arc<TcpTransport>> {
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
    async fn three_ranks_complete_multi_channel_all_to_all() {
        let transports = mesh(3).await;
        let mut tasks = Vec::new();
        for transport in transports {
            let router = Router::new(3, transport.rank(), RoutingTable::new(), DefaultRouting::ToAll);
            tasks.push(tokio::spawn(async move {
                let comm = Communicator::new(transport, &["packet", "packet"]).await.unwrap();
                run(
                    comm,
                    &router,
                    ChannelRunnerConfig {
                        iterations: 10,
                        iters_to_sync: 3,
                        channel_priorities: vec![0, 1],
                        packet_element_count: 4,
                    },
                )
                .await
                .unwrap()
            }));
        }
        for task in tasks {
            let result = task.await.unwrap();
            assert!(result.bytes_sent > 0);
            assert!(result.bytes_received > 0);
        }
    }

    #[tokio::test]
    async fn zero_sync_interval_is_rejected() {
        let transports = mesh(2).await;
        let transport = transports[0].clone();
        let router = Router::new(2, 0, RoutingTable::new(), DefaultRouting::ToAll);
        let comm = Communicator::new(transport, &["packet"]).await.unwrap();
        let err = run(
            comm,
            &router,
            ChannelRunnerConfig {
                iterations: 1,
                iters_to_sync: 0,
                channel_priorities: vec![0],
                packet_element_count: 1,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BenchError::Config(ConfigError::ZeroSyncInterval)));
    }
}
