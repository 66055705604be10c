//! Per-(vector, exchange-kind) buffer bookkeeping and byte packing.

use glam::Vec3;
use kernel::channels::{entry_size, DataKind};
use kernel::error::{Result, SimulationError};
use kernel::particles::ParticleStorage;

use crate::fragments::NUM_FRAGMENTS;

/// Send/recv bookkeeping of one attached particle vector.
///
/// Sizes count packed entities (particles or objects); byte positions are
/// `offset * unit_size`. Buffers only ever grow within a run.
pub struct ExchangeHelper {
    /// Index of the attached particle vector.
    pub pv: usize,
    /// Base of this helper's message tag space.
    pub tag_base: u64,
    /// Bytes per packed entity.
    pub unit_size: usize,
    /// Entities to send per fragment.
    pub send_sizes: [usize; NUM_FRAGMENTS],
    /// Prefix sum over `send_sizes` (with end sentinel).
    pub send_offsets: [usize; NUM_FRAGMENTS + 1],
    /// Packed send bytes.
    pub send_buf: Vec<u8>,
    /// Entities received per fragment.
    pub recv_sizes: [usize; NUM_FRAGMENTS],
    /// Prefix sum over `recv_sizes` (with end sentinel).
    pub recv_offsets: [usize; NUM_FRAGMENTS + 1],
    /// Packed receive bytes.
    pub recv_buf: Vec<u8>,
}

impl ExchangeHelper {
    /// Helper for vector `pv` with a unique tag base.
    pub fn new(pv: usize, tag_base: u64) -> Self {
        Self {
            pv,
            tag_base,
            unit_size: 0,
            send_sizes: [0; NUM_FRAGMENTS],
            send_offsets: [0; NUM_FRAGMENTS + 1],
            send_buf: Vec::new(),
            recv_sizes: [0; NUM_FRAGMENTS],
            recv_offsets: [0; NUM_FRAGMENTS + 1],
            recv_buf: Vec::new(),
        }
    }

    /// Reset send sizes for a new exchange round.
    pub fn clear_send(&mut self) {
        self.send_sizes = [0; NUM_FRAGMENTS];
    }

    /// Prefix-sum send sizes and grow the send buffer to fit.
    pub fn compute_send_offsets(&mut self) {
        let mut running = 0;
        for f in 0..NUM_FRAGMENTS {
            self.send_offsets[f] = running;
            running += self.send_sizes[f];
        }
        self.send_offsets[NUM_FRAGMENTS] = running;
        let needed = running * self.unit_size;
        if self.send_buf.len() < needed {
            self.send_buf.resize(needed, 0);
        }
    }

    /// Prefix-sum receive sizes and grow the receive buffer to fit.
    pub fn compute_recv_offsets(&mut self) {
        let mut running = 0;
        for f in 0..NUM_FRAGMENTS {
            self.recv_offsets[f] = running;
            running += self.recv_sizes[f];
        }
        self.recv_offsets[NUM_FRAGMENTS] = running;
        let needed = running * self.unit_size;
        if self.recv_buf.len() < needed {
            self.recv_buf.resize(needed, 0);
        }
    }

    /// Total entities queued for sending.
    pub fn total_send(&self) -> usize {
        self.send_offsets[NUM_FRAGMENTS]
    }

    /// Byte slice of one send fragment.
    pub fn send_fragment(&self, f: usize) -> &[u8] {
        let a = self.send_offsets[f] * self.unit_size;
        let b = self.send_offsets[f + 1] * self.unit_size;
        &self.send_buf[a..b]
    }

    /// Byte slice of one receive fragment.
    pub fn recv_fragment(&self, f: usize) -> &[u8] {
        let a = self.recv_offsets[f] * self.unit_size;
        let b = self.recv_offsets[f + 1] * self.unit_size;
        &self.recv_buf[a..b]
    }

    /// Mutable byte slice of entity `slot` in the send buffer.
    pub fn send_entity_mut(&mut self, slot: usize) -> &mut [u8] {
        let a = slot * self.unit_size;
        &mut self.send_buf[a..a + self.unit_size]
    }

    /// Single-node delivery: the send side becomes the receive side.
    pub fn swap_send_recv(&mut self) {
        self.recv_sizes = self.send_sizes;
        self.recv_offsets = self.send_offsets;
        std::mem::swap(&mut self.send_buf, &mut self.recv_buf);
    }
}

/// Byte layout of one packed particle: position, velocity, id, then the
/// configured extra channels in name order.
#[derive(Debug, Clone)]
pub struct PackSpec {
    /// Extra channels to carry, with their kinds.
    pub channels: Vec<(String, DataKind)>,
}

/// Bytes of the intrinsic particle fields (position + velocity + id).
pub const INTRINSIC_SIZE: usize = 12 + 12 + 8;

impl PackSpec {
    /// Spec carrying only the intrinsic fields.
    pub fn intrinsic() -> Self {
        Self {
            channels: Vec::new(),
        }
    }

    /// Spec carrying the named channels of `storage` on top of intrinsics.
    pub fn with_channels(storage: &ParticleStorage, names: &[String]) -> Result<Self> {
        let mut channels = Vec::with_capacity(names.len());
        for name in names {
            let kind = storage.channels.kind_of(name).ok_or_else(|| {
                SimulationError::Configuration(format!(
                    "pack spec references unknown channel '{name}'"
                ))
            })?;
            channels.push((name.clone(), kind));
        }
        Ok(Self { channels })
    }

    /// Bytes per packed particle.
    pub fn unit_size(&self) -> usize {
        INTRINSIC_SIZE + self.channels.iter().map(|(_, k)| entry_size(*k)).sum::<usize>()
    }

    /// Pack particle `i` of `storage` into `out`, translating its position by
    /// `shift` so the receiver sees its own local frame.
    pub fn pack(&self, storage: &ParticleStorage, i: usize, shift: Vec3, out: &mut [u8]) -> Result<()> {
        debug_assert_eq!(out.len(), self.unit_size());
        let shifted = storage.positions[i] + shift;
        out[0..12].copy_from_slice(bytemuck::bytes_of(&shifted));
        out[12..24].copy_from_slice(bytemuck::bytes_of(&storage.velocities[i]));
        out[24..32].copy_from_slice(&storage.ids[i].to_le_bytes());
        let mut cursor = INTRINSIC_SIZE;
        for (name, kind) in &self.channels {
            let es = entry_size(*kind);
            let bytes = storage.channels.data(name)?.bytes();
            out[cursor..cursor + es].copy_from_slice(&bytes[i * es..(i + 1) * es]);
            cursor += es;
        }
        Ok(())
    }

    /// Append every particle in `bytes` to `storage`; returns the count.
    /// Channels not in the spec are zero-extended afterwards.
    pub fn unpack_append(&self, bytes: &[u8], storage: &mut ParticleStorage) -> Result<usize> {
        let unit = self.unit_size();
        debug_assert_eq!(bytes.len() % unit, 0);
        let count = bytes.len() / unit;
        for e in 0..count {
            let rec = &bytes[e * unit..(e + 1) * unit];
            let position: Vec3 = bytemuck::pod_read_unaligned(&rec[0..12]);
            let velocity: Vec3 = bytemuck::pod_read_unaligned(&rec[12..24]);
            let id = u64::from_le_bytes(rec[24..32].try_into().expect("fixed width"));
            storage.push(position, velocity, id);
            let mut cursor = INTRINSIC_SIZE;
            for (name, kind) in &self.channels {
                let es = entry_size(*kind);
                storage
                    .channels
                    .data_mut(name)?
                    .push_from_bytes(&rec[cursor..cursor + es]);
                cursor += es;
            }
        }
        storage.align_channels();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel::channels::Persistence;

    #[test]
    fn pack_unpack_roundtrip_with_channel_and_shift() {
        let mut src = ParticleStorage::new();
        src.channels
            .create_channel("densities", DataKind::Float, Persistence::Transient, 0)
            .unwrap();
        src.push(Vec3::new(1.0, 2.0, 3.0), Vec3::new(-1.0, 0.0, 0.5), 77);
        src.align_channels();
        src.channels.floats_mut("densities").unwrap()[0] = 4.5;

        let spec = PackSpec::with_channels(&src, &["densities".to_string()]).unwrap();
        assert_eq!(spec.unit_size(), INTRINSIC_SIZE + 4);

        let mut buf = vec![0u8; spec.unit_size()];
        spec.pack(&src, 0, Vec3::new(-8.0, 0.0, 0.0), &mut buf).unwrap();

        let mut dst = ParticleStorage::new();
        dst.channels
            .create_channel("densities", DataKind::Float, Persistence::Transient, 0)
            .unwrap();
        let n = spec.unpack_append(&buf, &mut dst).unwrap();
        assert_eq!(n, 1);
        assert_eq!(dst.positions[0], Vec3::new(-7.0, 2.0, 3.0));
        assert_eq!(dst.velocities[0], Vec3::new(-1.0, 0.0, 0.5));
        assert_eq!(dst.ids[0], 77);
        assert_eq!(dst.channels.floats("densities").unwrap()[0], 4.5);
    }
}
