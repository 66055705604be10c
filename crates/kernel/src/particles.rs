//! Particle and object containers.
//!
//! A `ParticleVector` is one named species. It owns two partitions: `local`
//! (resident particles) and `halo` (read-only ghost copies, valid between an
//! exchange finalize and the next redistribute). An object vector is a
//! particle vector whose particles are grouped into fixed-size objects; halo
//! exchange then ships whole objects.

use glam::Vec3;

use crate::channels::{channel_names, ComExtent, DataKind, ExtraDataManager, Persistence};
use crate::error::{Result, SimulationError};

/// Compose a globally unique particle id from the owning rank and a local
/// allocation index (two 32-bit halves of one `u64`).
#[inline]
pub fn particle_id(rank: u32, index: u64) -> u64 {
    ((rank as u64) << 32) | (index & 0xffff_ffff)
}

/// Struct-of-arrays storage of one partition.
///
/// All arrays are parallel: index `i` across every array (and every channel)
/// refers to the same particle. Separate arrays rather than an interleaved
/// record keep channel packing and reordering branch-free.
#[derive(Debug, Clone, Default)]
pub struct ParticleStorage {
    /// Positions, local (subdomain-centered) frame.
    pub positions: Vec<Vec3>,
    /// Velocities.
    pub velocities: Vec<Vec3>,
    /// Globally unique ids.
    pub ids: Vec<u64>,
    /// Named extra channels, all kept at `positions.len()` entries.
    pub channels: ExtraDataManager,
}

impl ParticleStorage {
    /// Empty storage with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether the partition is empty.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Append one particle. Channels are not touched; call
    /// [`Self::align_channels`] after a batch of pushes.
    pub fn push(&mut self, position: Vec3, velocity: Vec3, id: u64) {
        self.positions.push(position);
        self.velocities.push(velocity);
        self.ids.push(id);
    }

    /// Resize every channel to the current particle count.
    pub fn align_channels(&mut self) {
        self.channels.resize_all(self.len());
    }

    /// Drop all particles, keeping the channel layout.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.ids.clear();
        self.channels.truncate();
    }

    /// Permute storage so particle `i` moves to slot `order[i]`.
    /// Persistent channels follow; transient channels are resized and zeroed.
    pub fn apply_order(&mut self, order: &[u32]) {
        debug_assert_eq!(order.len(), self.len());
        let mut positions = vec![Vec3::ZERO; self.len()];
        let mut velocities = vec![Vec3::ZERO; self.len()];
        let mut ids = vec![0u64; self.len()];
        for (i, &dst) in order.iter().enumerate() {
            positions[dst as usize] = self.positions[i];
            velocities[dst as usize] = self.velocities[i];
            ids[dst as usize] = self.ids[i];
        }
        self.positions = positions;
        self.velocities = velocities;
        self.ids = ids;
        self.channels.apply_order(order);
    }

    /// Keep only particles flagged in `keep`.
    pub fn retain_by_mask(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.len());
        let mut w = 0;
        for i in 0..self.len() {
            if keep[i] {
                self.positions[w] = self.positions[i];
                self.velocities[w] = self.velocities[i];
                self.ids[w] = self.ids[i];
                w += 1;
            }
        }
        self.positions.truncate(w);
        self.velocities.truncate(w);
        self.ids.truncate(w);
        self.channels.retain_by_mask(keep);
    }

    /// Move the particles flagged in `take` out into a new storage that keeps
    /// the same channel layout (used by belonging splitters).
    pub fn split_off_by_mask(&mut self, take: &[bool]) -> ParticleStorage {
        debug_assert_eq!(take.len(), self.len());
        let mut out = ParticleStorage::new();
        for (name, kind, persistence) in self.channel_layout() {
            out.channels
                .create_channel(&name, kind, persistence, 0)
                .expect("fresh manager cannot conflict");
        }
        for i in 0..self.len() {
            if take[i] {
                out.push(self.positions[i], self.velocities[i], self.ids[i]);
            }
        }
        for name in self.channels.names() {
            let es = crate::channels::entry_size(self.channels.kind_of(&name).unwrap());
            let src = self.channels.data(&name).unwrap();
            let bytes = src.bytes();
            let dst = out.channels.data_mut(&name).unwrap();
            for i in 0..take.len() {
                if take[i] {
                    dst.push_from_bytes(&bytes[i * es..(i + 1) * es]);
                }
            }
        }
        let keep: Vec<bool> = take.iter().map(|t| !t).collect();
        self.retain_by_mask(&keep);
        out
    }

    /// Append all particles of `other`; channels present on both sides carry
    /// their data, the rest are zero-extended.
    pub fn append(&mut self, other: &ParticleStorage) {
        self.positions.extend_from_slice(&other.positions);
        self.velocities.extend_from_slice(&other.velocities);
        self.ids.extend_from_slice(&other.ids);
        for name in self.channels.names() {
            if other.channels.check_exists(&name) {
                let es = crate::channels::entry_size(self.channels.kind_of(&name).unwrap());
                let src = other.channels.data(&name).unwrap().bytes().to_vec();
                let dst = self.channels.data_mut(&name).unwrap();
                for i in 0..other.len() {
                    dst.push_from_bytes(&src[i * es..(i + 1) * es]);
                }
            }
        }
        self.align_channels();
    }

    fn channel_layout(&self) -> Vec<(String, DataKind, Persistence)> {
        self.channels
            .names()
            .into_iter()
            .map(|n| {
                let kind = self.channels.kind_of(&n).unwrap();
                let p = self.channels.persistence_of(&n).unwrap();
                (n, kind, p)
            })
            .collect()
    }
}

/// Immutable triangle topology shared by every object of one vector.
#[derive(Debug, Clone)]
pub struct Mesh {
    /// Vertices per object; must equal the object size.
    pub n_vertices: usize,
    /// Triangles as vertex-index triples.
    pub triangles: Vec<[u32; 3]>,
}

impl Mesh {
    /// Check that every triangle references a valid vertex.
    pub fn validate(&self) -> Result<()> {
        for t in &self.triangles {
            if t.iter().any(|&v| v as usize >= self.n_vertices) {
                return Err(SimulationError::Invariant(format!(
                    "mesh triangle {t:?} references a vertex beyond {}",
                    self.n_vertices
                )));
            }
        }
        Ok(())
    }
}

/// Per-object bookkeeping of an object vector.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Particles per object (fixed).
    pub object_size: usize,
    /// Optional shared mesh topology.
    pub mesh: Option<Mesh>,
    /// Per-object channels of the local partition.
    pub local: ExtraDataManager,
    /// Per-object channels of the halo partition.
    pub halo: ExtraDataManager,
}

/// One named species of particles, optionally grouped into objects.
#[derive(Debug, Clone)]
pub struct ParticleVector {
    name: String,
    /// Mass of each particle.
    pub mass: f32,
    /// Resident partition; mutated only by integrators, redistribution,
    /// bouncers and belonging splitters.
    pub local: ParticleStorage,
    /// Ghost partition, rebuilt by halo exchange.
    pub halo: ParticleStorage,
    motion_stamp: u64,
    /// Present iff this is an object vector.
    pub objects: Option<ObjectInfo>,
}

impl ParticleVector {
    /// New plain particle vector with the standard `forces` channel.
    pub fn new(name: &str, mass: f32) -> Self {
        let mut pv = Self {
            name: name.to_string(),
            mass,
            local: ParticleStorage::new(),
            halo: ParticleStorage::new(),
            motion_stamp: 0,
            objects: None,
        };
        for part in [&mut pv.local, &mut pv.halo] {
            part.channels
                .create_channel(channel_names::FORCES, DataKind::Float3, Persistence::Transient, 0)
                .expect("fresh manager cannot conflict");
        }
        pv
    }

    /// New object vector. `object_size` particles form one object; a mesh, if
    /// given, must have exactly `object_size` vertices.
    pub fn new_object(name: &str, mass: f32, object_size: usize, mesh: Option<Mesh>) -> Result<Self> {
        if object_size == 0 {
            return Err(SimulationError::Configuration(format!(
                "object vector '{name}' with zero object size"
            )));
        }
        if let Some(m) = &mesh {
            m.validate()?;
            if m.n_vertices != object_size {
                return Err(SimulationError::Invariant(format!(
                    "object vector '{name}': object size {object_size} != mesh vertices {}",
                    m.n_vertices
                )));
            }
        }
        let mut pv = Self::new(name, mass);
        let mut local = ExtraDataManager::new();
        let mut halo = ExtraDataManager::new();
        for m in [&mut local, &mut halo] {
            m.create_channel(
                channel_names::COM_EXTENTS,
                DataKind::ComExtent,
                Persistence::Transient,
                0,
            )
            .expect("fresh manager cannot conflict");
        }
        pv.objects = Some(ObjectInfo {
            object_size,
            mesh,
            local,
            halo,
        });
        Ok(pv)
    }

    /// Species name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this vector groups particles into objects.
    pub fn is_object(&self) -> bool {
        self.objects.is_some()
    }

    /// Stamp that advances whenever local particle positions change.
    pub fn motion_stamp(&self) -> u64 {
        self.motion_stamp
    }

    /// Record a mutation of local positions (triggers cell-list rebuilds).
    pub fn bump_motion_stamp(&mut self) {
        self.motion_stamp += 1;
    }

    /// Number of local objects; fails if particles do not tile into objects.
    pub fn local_object_count(&self) -> Result<usize> {
        self.object_count(self.local.len())
    }

    /// Number of halo objects.
    pub fn halo_object_count(&self) -> Result<usize> {
        self.object_count(self.halo.len())
    }

    fn object_count(&self, n: usize) -> Result<usize> {
        let info = self.objects.as_ref().ok_or_else(|| {
            SimulationError::Configuration(format!("'{}' is not an object vector", self.name))
        })?;
        if n % info.object_size != 0 {
            return Err(SimulationError::Invariant(format!(
                "object vector '{}': {n} particles do not tile into objects of {}",
                self.name, info.object_size
            )));
        }
        Ok(n / info.object_size)
    }

    /// Recompute the `com_extents` per-object channel of the local partition.
    pub fn update_com_extents_local(&mut self) -> Result<()> {
        let n_obj = self.local_object_count()?;
        let info = self.objects.as_mut().expect("checked by local_object_count");
        info.local.resize(channel_names::COM_EXTENTS, n_obj)?;
        let entries = info.local.com_extents_mut(channel_names::COM_EXTENTS)?;
        let size = info.object_size;
        for (o, entry) in entries.iter_mut().enumerate() {
            *entry = com_extent_of(&self.local.positions[o * size..(o + 1) * size]);
        }
        Ok(())
    }
}

fn com_extent_of(positions: &[Vec3]) -> ComExtent {
    let mut com = Vec3::ZERO;
    let mut low = Vec3::splat(f32::MAX);
    let mut high = Vec3::splat(f32::MIN);
    for &p in positions {
        com += p;
        low = low.min(p);
        high = high.max(p);
    }
    ComExtent {
        com: com / positions.len().max(1) as f32,
        low,
        high,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_tags(n: usize) -> ParticleStorage {
        let mut s = ParticleStorage::new();
        s.channels
            .create_channel("tag", DataKind::Int, Persistence::Persistent, 0)
            .unwrap();
        for i in 0..n {
            s.push(Vec3::splat(i as f32), Vec3::ZERO, i as u64);
        }
        s.align_channels();
        if let crate::channels::ChannelData::Int(v) = s.channels.data_mut("tag").unwrap() {
            for (i, t) in v.iter_mut().enumerate() {
                *t = 100 + i as i32;
            }
        }
        s
    }

    #[test]
    fn split_off_moves_particles_and_channels() {
        let mut s = storage_with_tags(4);
        let taken = s.split_off_by_mask(&[false, true, false, true]);
        assert_eq!(s.len(), 2);
        assert_eq!(taken.len(), 2);
        assert_eq!(s.ids, vec![0, 2]);
        assert_eq!(taken.ids, vec![1, 3]);
        assert_eq!(taken.channels.data("tag").unwrap(), &crate::channels::ChannelData::Int(vec![101, 103]));
    }

    #[test]
    fn append_carries_shared_channels() {
        let mut a = storage_with_tags(2);
        let b = storage_with_tags(3);
        a.append(&b);
        assert_eq!(a.len(), 5);
        assert_eq!(a.channels.data("tag").unwrap().len(), 5);
    }

    #[test]
    fn object_size_must_tile() {
        let mut ov = ParticleVector::new_object("cells", 1.0, 3, None).unwrap();
        for i in 0..7 {
            ov.local.push(Vec3::splat(i as f32), Vec3::ZERO, i as u64);
        }
        ov.local.align_channels();
        assert!(ov.local_object_count().is_err());
        ov.local.push(Vec3::ZERO, Vec3::ZERO, 7);
        ov.local.push(Vec3::ZERO, Vec3::ZERO, 8);
        ov.local.align_channels();
        assert_eq!(ov.local_object_count().unwrap(), 3);
    }

    #[test]
    fn mesh_vertex_count_checked() {
        let mesh = Mesh {
            n_vertices: 4,
            triangles: vec![[0, 1, 2], [0, 2, 3]],
        };
        assert!(ParticleVector::new_object("rbc", 1.0, 5, Some(mesh.clone())).is_err());
        assert!(ParticleVector::new_object("rbc", 1.0, 4, Some(mesh)).is_ok());
    }

    #[test]
    fn com_extent_of_a_cube() {
        let mut ov = ParticleVector::new_object("box", 1.0, 2, None).unwrap();
        ov.local.push(Vec3::new(-1.0, 0.0, 0.0), Vec3::ZERO, 0);
        ov.local.push(Vec3::new(3.0, 2.0, 0.0), Vec3::ZERO, 1);
        ov.local.align_channels();
        ov.update_com_extents_local().unwrap();
        let ce = ov.objects.as_ref().unwrap().local.com_extents(channel_names::COM_EXTENTS).unwrap()[0];
        assert_eq!(ce.com, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(ce.low, Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(ce.high, Vec3::new(3.0, 2.0, 0.0));
    }
}
