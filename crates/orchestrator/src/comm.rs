//! In-process communicators.
//!
//! Ranks are threads: [`CommWorld::build`] hands every rank one endpoint of a
//! fully connected channel mesh plus a shared barrier. The interface mirrors
//! non-blocking point-to-point messaging -- sends never block, receives match
//! on (peer, tag) and park out-of-order arrivals -- so the exchange engine is
//! written exactly as it would be against a network transport, which can
//! replace this mesh without touching callers.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use glam::IVec3;
use kernel::error::{Result, SimulationError};

/// How long a matched receive may wait before the rank declares the peer lost.
const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Tag space reserved for collectives, above all exchange tags.
const COLLECTIVE_BASE: u64 = u64::MAX / 2;

/// Tag of the shutdown sentinel on the postprocess link.
pub const SHUTDOWN_TAG: u64 = 424_242;

struct Packet {
    src: usize,
    tag: u64,
    payload: Vec<u8>,
}

/// Builder for a Cartesian communicator world.
pub struct CommWorld;

impl CommWorld {
    /// Create one endpoint per rank of an `nx * ny * nz` periodic Cartesian
    /// grid. Endpoints are meant to be moved into per-rank threads.
    pub fn build(dims: IVec3) -> Vec<CartComm> {
        assert!(dims.x > 0 && dims.y > 0 && dims.z > 0, "rank grid must be positive");
        let size = (dims.x * dims.y * dims.z) as usize;
        let mut senders = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = channel::<Packet>();
            senders.push(tx);
            receivers.push(rx);
        }
        let barrier = Arc::new(Barrier::new(size));
        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| CartComm {
                rank,
                dims,
                coords: CartComm::coords_of(rank, dims),
                senders: senders.clone(),
                receiver,
                parked: Vec::new(),
                barrier: Arc::clone(&barrier),
                collective_seq: 0,
            })
            .collect()
    }
}

/// One rank's endpoint of the Cartesian communicator.
pub struct CartComm {
    rank: usize,
    dims: IVec3,
    coords: IVec3,
    senders: Vec<Sender<Packet>>,
    receiver: Receiver<Packet>,
    parked: Vec<Packet>,
    barrier: Arc<Barrier>,
    collective_seq: u64,
}

impl CartComm {
    fn coords_of(rank: usize, dims: IVec3) -> IVec3 {
        let r = rank as i32;
        IVec3::new(r % dims.x, (r / dims.x) % dims.y, r / (dims.x * dims.y))
    }

    /// This rank's index.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// This rank's Cartesian coordinates.
    pub fn coords(&self) -> IVec3 {
        self.coords
    }

    /// Rank grid dimensions.
    pub fn dims(&self) -> IVec3 {
        self.dims
    }

    /// Number of ranks.
    pub fn size(&self) -> usize {
        (self.dims.x * self.dims.y * self.dims.z) as usize
    }

    /// Rank holding the subdomain in direction `dir`, periodic wrap.
    pub fn neighbor_rank(&self, dir: IVec3) -> usize {
        let c = self.coords + dir;
        let w = IVec3::new(
            c.x.rem_euclid(self.dims.x),
            c.y.rem_euclid(self.dims.y),
            c.z.rem_euclid(self.dims.z),
        );
        (w.x + w.y * self.dims.x + w.z * self.dims.x * self.dims.y) as usize
    }

    /// Non-blocking tagged send.
    pub fn send(&mut self, peer: usize, tag: u64, payload: Vec<u8>) -> Result<()> {
        self.senders[peer]
            .send(Packet {
                src: self.rank,
                tag,
                payload,
            })
            .map_err(|_| SimulationError::Exchange(format!("rank {peer} is gone")))
    }

    /// Blocking receive matching (peer, tag); other arrivals are parked.
    pub fn recv_match(&mut self, peer: usize, tag: u64) -> Result<Vec<u8>> {
        if let Some(pos) = self
            .parked
            .iter()
            .position(|p| p.src == peer && p.tag == tag)
        {
            // plain remove keeps arrival order, so reused tags stay FIFO
            return Ok(self.parked.remove(pos).payload);
        }
        loop {
            let packet = self.receiver.recv_timeout(RECV_TIMEOUT).map_err(|_| {
                SimulationError::Exchange(format!(
                    "rank {} timed out waiting for tag {tag} from rank {peer}",
                    self.rank
                ))
            })?;
            if packet.src == peer && packet.tag == tag {
                return Ok(packet.payload);
            }
            self.parked.push(packet);
        }
    }

    /// Synchronize all ranks.
    pub fn barrier(&self) {
        self.barrier.wait();
    }

    /// Sum a value over all ranks; every rank gets the total.
    pub fn allreduce_sum_u64(&mut self, value: u64) -> Result<u64> {
        let tag = COLLECTIVE_BASE + self.collective_seq;
        self.collective_seq += 1;
        if self.size() == 1 {
            return Ok(value);
        }
        if self.rank == 0 {
            let mut total = value;
            for peer in 1..self.size() {
                let bytes = self.recv_match(peer, tag)?;
                total += u64::from_le_bytes(bytes.try_into().map_err(|_| {
                    SimulationError::Exchange("malformed reduction payload".into())
                })?);
            }
            for peer in 1..self.size() {
                self.send(peer, tag, total.to_le_bytes().to_vec())?;
            }
            Ok(total)
        } else {
            self.send(0, tag, value.to_le_bytes().to_vec())?;
            let bytes = self.recv_match(0, tag)?;
            Ok(u64::from_le_bytes(bytes.try_into().map_err(|_| {
                SimulationError::Exchange("malformed reduction payload".into())
            })?))
        }
    }
}

/// Point-to-point link between a simulation rank and its postprocess peer.
pub struct InterComm {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
}

impl InterComm {
    /// Create a connected pair: (simulation side, postprocess side).
    pub fn pair() -> (InterComm, InterComm) {
        let (tx_a, rx_b) = channel::<Packet>();
        let (tx_b, rx_a) = channel::<Packet>();
        (InterComm { tx: tx_a, rx: rx_a }, InterComm { tx: tx_b, rx: rx_b })
    }

    /// Ship a tagged payload to the peer.
    pub fn send(&self, tag: u64, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send(Packet {
                src: 0,
                tag,
                payload,
            })
            .map_err(|_| SimulationError::Exchange("postprocess peer is gone".into()))
    }

    /// Tell the peer the run finished cleanly.
    pub fn send_shutdown_sentinel(&self) -> Result<()> {
        self.send(SHUTDOWN_TAG, (-1i32).to_le_bytes().to_vec())
    }

    /// Blocking receive of the next payload, as (tag, bytes).
    pub fn recv(&self) -> Result<(u64, Vec<u8>)> {
        let p = self
            .rx
            .recv_timeout(RECV_TIMEOUT)
            .map_err(|_| SimulationError::Exchange("postprocess link timed out".into()))?;
        Ok((p.tag, p.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_ranks_wrap_periodically() {
        let world = CommWorld::build(IVec3::new(2, 1, 1));
        let c0 = &world[0];
        assert_eq!(c0.neighbor_rank(IVec3::new(1, 0, 0)), 1);
        assert_eq!(c0.neighbor_rank(IVec3::new(-1, 0, 0)), 1);
        assert_eq!(c0.neighbor_rank(IVec3::new(0, 1, 0)), 0);
    }

    #[test]
    fn out_of_order_arrivals_are_parked() {
        let mut world = CommWorld::build(IVec3::new(2, 1, 1));
        let mut c1 = world.pop().unwrap();
        let mut c0 = world.pop().unwrap();
        c1.send(0, 7, vec![7]).unwrap();
        c1.send(0, 8, vec![8]).unwrap();
        assert_eq!(c0.recv_match(1, 8).unwrap(), vec![8]);
        assert_eq!(c0.recv_match(1, 7).unwrap(), vec![7]);
    }

    #[test]
    fn allreduce_sums_across_threads() {
        let world = CommWorld::build(IVec3::new(3, 1, 1));
        let handles: Vec<_> = world
            .into_iter()
            .map(|mut c| {
                std::thread::spawn(move || c.allreduce_sum_u64(c.rank() as u64 + 1).unwrap())
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 6);
        }
    }

    #[test]
    fn intercomm_sentinel_roundtrip() {
        let (sim, post) = InterComm::pair();
        sim.send_shutdown_sentinel().unwrap();
        let (tag, bytes) = post.recv().unwrap();
        assert_eq!(tag, SHUTDOWN_TAG);
        assert_eq!(i32::from_le_bytes(bytes.try_into().unwrap()), -1);
    }
}
