//! Exchange engines: how packed fragments move between subdomains.

use kernel::error::Result;

use crate::comm::CartComm;
use crate::fragments::{self, BULK_ID, NUM_FRAGMENTS};
use crate::world::World;

use super::Exchanger;

/// Two-phase delivery of an exchanger's fragments.
pub trait ExchangeEngine: Send {
    /// Size, pack and send.
    fn init(&mut self, comm: &mut CartComm, world: &mut World) -> Result<()>;

    /// Await delivery and unpack; after this the target partition is
    /// well-formed.
    fn finalize(&mut self, comm: &mut CartComm, world: &mut World) -> Result<()>;
}

/// Engine for a single-subdomain run: `finalize` swaps the send and receive
/// buffers (the periodic neighbour in every direction is the rank itself), so
/// no messages exist at all.
pub struct SingleNodeEngine {
    exchanger: Box<dyn Exchanger>,
}

impl SingleNodeEngine {
    /// Wrap an exchanger.
    pub fn new(exchanger: Box<dyn Exchanger>) -> Self {
        Self { exchanger }
    }
}

impl ExchangeEngine for SingleNodeEngine {
    fn init(&mut self, _comm: &mut CartComm, world: &mut World) -> Result<()> {
        for i in 0..self.exchanger.count() {
            if !self.exchanger.need_exchange(i, world) {
                tracing::debug!(
                    exchange = self.exchanger.label(),
                    helper = i,
                    "exchange skipped"
                );
                continue;
            }
            self.exchanger.prepare_sizes(i, world)?;
            self.exchanger.prepare_data(i, world)?;
        }
        Ok(())
    }

    fn finalize(&mut self, _comm: &mut CartComm, world: &mut World) -> Result<()> {
        for i in 0..self.exchanger.count() {
            if !self.exchanger.need_exchange(i, world) {
                continue;
            }
            let label = self.exchanger.label();
            let helper = self.exchanger.helper_mut(i);
            if helper.send_sizes[BULK_ID] != 0 {
                tracing::error!(
                    exchange = label,
                    pv = helper.pv,
                    size = helper.send_sizes[BULK_ID],
                    "non-empty message to itself detected; the exchanger is broken"
                );
            }
            helper.swap_send_recv();
            self.exchanger.combine_and_upload(i, world)?;
        }
        Ok(())
    }
}

/// Engine for multi-rank runs: tagged non-blocking point-to-point over the
/// Cartesian communicator. Receives for all 26 neighbour fragments are
/// expected up-front (the self slot never crosses the wire); sends go out as
/// soon as the data is packed; `finalize` waits and unpacks.
///
/// A fragment `f` travels to the rank in direction `dir(f)` with tag
/// `tag_base * 27 + f`; the receiver files it under the mirrored slot, so
/// both sides agree on which buffer region a message belongs to.
pub struct ClusterEngine {
    exchanger: Box<dyn Exchanger>,
}

impl ClusterEngine {
    /// Wrap an exchanger.
    pub fn new(exchanger: Box<dyn Exchanger>) -> Self {
        Self { exchanger }
    }
}

impl ExchangeEngine for ClusterEngine {
    fn init(&mut self, comm: &mut CartComm, world: &mut World) -> Result<()> {
        for i in 0..self.exchanger.count() {
            if !self.exchanger.need_exchange(i, world) {
                continue;
            }
            self.exchanger.prepare_sizes(i, world)?;
            self.exchanger.prepare_data(i, world)?;

            let helper = self.exchanger.helper(i);
            let tag_base = helper.tag_base;
            let mut outgoing = Vec::with_capacity(NUM_FRAGMENTS - 1);
            for f in 0..NUM_FRAGMENTS {
                if f == BULK_ID {
                    continue;
                }
                let peer = comm.neighbor_rank(fragments::dir(f));
                outgoing.push((peer, tag_base * NUM_FRAGMENTS as u64 + f as u64, helper.send_fragment(f).to_vec()));
            }
            for (peer, tag, payload) in outgoing {
                comm.send(peer, tag, payload)?;
            }
        }
        Ok(())
    }

    fn finalize(&mut self, comm: &mut CartComm, world: &mut World) -> Result<()> {
        for i in 0..self.exchanger.count() {
            if !self.exchanger.need_exchange(i, world) {
                continue;
            }
            let tag_base = self.exchanger.helper(i).tag_base;
            let unit = self.exchanger.helper(i).unit_size;

            // slot f holds what the neighbour in direction dir(f) sent us,
            // i.e. its fragment mirror(f)
            let mut arrived: [Vec<u8>; NUM_FRAGMENTS] = Default::default();
            for f in 0..NUM_FRAGMENTS {
                if f == BULK_ID {
                    continue;
                }
                let peer = comm.neighbor_rank(fragments::dir(f));
                let tag = tag_base * NUM_FRAGMENTS as u64 + fragments::mirror(f) as u64;
                arrived[f] = comm.recv_match(peer, tag)?;
            }

            let helper = self.exchanger.helper_mut(i);
            for f in 0..NUM_FRAGMENTS {
                helper.recv_sizes[f] = arrived[f].len() / unit.max(1);
            }
            helper.compute_recv_offsets();
            for f in 0..NUM_FRAGMENTS {
                let a = helper.recv_offsets[f] * unit;
                helper.recv_buf[a..a + arrived[f].len()].copy_from_slice(&arrived[f]);
            }
            self.exchanger.combine_and_upload(i, world)?;
        }
        Ok(())
    }
}
