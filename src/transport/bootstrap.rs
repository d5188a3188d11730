//! # Bootstrap / Peer Discovery
//!
//! Resolves this process's rank, world size, and every peer's TCP address
//! before a [`super::tcp::TcpTransport`] mesh can be built. Two discovery
//! modes, selected by `OMPI_COMM_WORLD_SIZE` (spec.md §6 Environment):
//!
//! - **MPI-style**: launched under `mpirun`/`orterun`; rank and size come
//!   straight from the environment, and peer addresses are exchanged via a
//!   rendezvous connection to rank 0 (there is no portable way to read an
//!   MPI job's host list from inside this crate without linking MPI itself,
//!   which is out of scope — SPEC_FULL.md §6 notes this as a non-goal
//!   simplification).
//! - **TCP rendezvous**: no MPI environment; one process is designated the
//!   rendezvous root via `--rendezvous-addr`, every process (root included)
//!   connects to it, and the root assigns ranks in connection order and
//!   distributes the full address list once `--world-size` processes have
//!   checked in.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{BenchError, ConfigError};

pub struct BootstrapInfo {
    pub rank: u64,
    pub size: u64,
    pub listener: TcpListener,
    pub peer_addrs: Vec<SocketAddr>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RendezvousHello {
    advertise_addr: SocketAddr,
}

#[derive(Debug, Serialize, Deserialize)]
struct RendezvousAssignment {
    rank: u64,
    size: u64,
    peer_addrs: Vec<SocketAddr>,
}

/// True when launched under an MPI job launcher (spec.md §6 Environment).
pub fn running_under_mpi() -> bool {
    std::env::var("OMPI_COMM_WORLD_SIZE").is_ok()
}

/// MPI-style bootstrap: rank/size from the environment, peers rendezvoused
/// through rank 0's listener the same way the TCP path does, since this
/// crate does not link an MPI runtime to query the host list directly.
pub async fn bootstrap_mpi(bind_addr: SocketAddr) -> Result<BootstrapInfo, BenchError> {
    let size: u64 = std::env::var("OMPI_COMM_WORLD_SIZE")
        .ok()
        .and_then(|v| v.parse().ok())
        .ok_or(ConfigError::WorldSizeMismatch {
            mode: "mpi",
            required: 1,
            actual: 0,
        })?;
    let rank: u64 = std::env::var("OMPI_COMM_WORLD_RANK")
        .ok()
        .and_then(|v| v.parse().ok())
        .ok_or(ConfigError::WorldSizeMismatch {
            mode: "mpi",
            required: 1,
            actual: 0,
        })?;
    bootstrap_rendezvous_with_rank(bind_addr, rank, size).await
}

/// TCP rendezvous bootstrap: every process (including the root) dials
/// `rendezvous_addr`; the root assigns ranks by arrival order.
pub async fn bootstrap_tcp_rendezvous(
    bind_addr: SocketAddr,
    rendezvous_addr: SocketAddr,
    is_root: bool,
    world_size: u64,
) -> Result<BootstrapInfo, BenchError> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(BenchError::Io)?;
    let advertise_addr = listener.local_addr().map_err(BenchError::Io)?;

    if is_root {
        let root_listener = TcpListener::bind(rendezvous_addr).await.map_err(BenchError::Io)?;
        let mut addrs = Vec::with_capacity(world_size as usize);
        addrs.push(advertise_addr);
        let mut conns = Vec::new();
        while addrs.len() < world_size as usize {
            let (mut stream, _) = root_listener.accept().await.map_err(BenchError::Io)?;
            let hello = read_json::<RendezvousHello>(&mut stream).await?;
            addrs.push(hello.advertise_addr);
            conns.push(stream);
        }
        for (idx, mut stream) in conns.into_iter().enumerate() {
            let assignment = RendezvousAssignment {
                rank: (idx + 1) as u64,
                size: world_size,
                peer_addrs: addrs.clone(),
            };
            write_json(&mut stream, &assignment).await?;
        }
        Ok(BootstrapInfo {
            rank: 0,
            size: world_size,
            listener,
            peer_addrs: addrs,
        })
    } else {
        let mut stream = TcpStream::connect(rendezvous_addr).await.map_err(BenchError::Io)?;
        write_json(&mut stream, &RendezvousHello { advertise_addr }).await?;
        let assignment = read_json::<RendezvousAssignment>(&mut stream).await?;
        Ok(BootstrapInfo {
            rank: assignment.rank,
            size: assignment.size,
            listener,
            peer_addrs: assignment.peer_addrs,
        })
    }
}

async fn bootstrap_rendezvous_with_rank(
    bind_addr: SocketAddr,
    rank: u64,
    size: u64,
) -> Result<BootstrapInfo, BenchError> {
    // Rank 0 hosts the rendezvous on a well-known offset from its own bind
    // port so every rank can compute it without an extra side channel.
    let rendezvous_addr = SocketAddr::new(bind_addr.ip(), bind_addr.port());
    bootstrap_tcp_rendezvous(bind_addr, rendezvous_addr, rank == 0, size).await
}

async fn read_json<T: for<'de> Deserialize<'de>>(stream: &mut TcpStream) -> Result<T, BenchError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await.map_err(BenchError::Io)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(BenchError::Io)?;
    serde_json::from_slice(&buf).map_err(|e| BenchError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

async fn write_json<T: Serialize>(stream: &mut TcpStream, value: &T) -> Result<(), BenchError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| BenchError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    let len = bytes.len() as u32;
    stream.write_all(&len.to_le_bytes()).await.map_err(BenchError::Io)?;
    stream.write_all(&bytes).await.map_err(BenchError::Io)?;
    stream.flush().await.map_err(BenchError::Io)
}
