//! Named per-particle / per-object data channels.
//!
//! Each channel is a typed contiguous buffer with a persistence flag:
//! persistent channels survive redistribution and restart, transient ones are
//! cleared every step and never leave the rank unless an exchanger ships them
//! explicitly. The byte-level accessors back the exchange packers.

use std::collections::BTreeMap;

use glam::{Vec3, Vec4};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SimulationError};

/// Element type of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataKind {
    /// One `f32` per entry.
    Float,
    /// One `Vec3` per entry.
    Float3,
    /// One `Vec4` per entry.
    Float4,
    /// One `i32` per entry.
    Int,
    /// Symmetric second-rank tensor, six floats.
    Stress,
    /// Center of mass plus axis-aligned extent (per-object).
    ComExtent,
}

/// Whether a channel outlives the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Persistence {
    /// Packed during redistribution, written to checkpoints.
    Persistent,
    /// Cleared each step; never packed implicitly.
    Transient,
}

/// Symmetric stress tensor, stored as the six upper-triangle components.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
#[allow(missing_docs)]
pub struct Stress {
    pub xx: f32,
    pub xy: f32,
    pub xz: f32,
    pub yy: f32,
    pub yz: f32,
    pub zz: f32,
}

impl std::ops::AddAssign for Stress {
    fn add_assign(&mut self, o: Self) {
        self.xx += o.xx;
        self.xy += o.xy;
        self.xz += o.xz;
        self.yy += o.yy;
        self.yz += o.yz;
        self.zz += o.zz;
    }
}

/// Per-object center of mass and axis-aligned bounding extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct ComExtent {
    /// Center of mass, local frame.
    pub com: Vec3,
    /// Lower corner of the bounding box.
    pub low: Vec3,
    /// Upper corner of the bounding box.
    pub high: Vec3,
}

impl ComExtent {
    /// Translate the record by `shift` (used when an object changes frames).
    pub fn shifted(self, shift: Vec3) -> Self {
        Self {
            com: self.com + shift,
            low: self.low + shift,
            high: self.high + shift,
        }
    }
}

/// Bytes occupied by one entry of the given kind.
pub fn entry_size(kind: DataKind) -> usize {
    match kind {
        DataKind::Float => 4,
        DataKind::Float3 => 12,
        DataKind::Float4 => 16,
        DataKind::Int => 4,
        DataKind::Stress => 24,
        DataKind::ComExtent => 36,
    }
}

/// Typed storage of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ChannelData {
    Float(Vec<f32>),
    Float3(Vec<Vec3>),
    Float4(Vec<Vec4>),
    Int(Vec<i32>),
    Stress(Vec<Stress>),
    ComExtent(Vec<ComExtent>),
}

impl ChannelData {
    fn empty(kind: DataKind) -> Self {
        match kind {
            DataKind::Float => Self::Float(Vec::new()),
            DataKind::Float3 => Self::Float3(Vec::new()),
            DataKind::Float4 => Self::Float4(Vec::new()),
            DataKind::Int => Self::Int(Vec::new()),
            DataKind::Stress => Self::Stress(Vec::new()),
            DataKind::ComExtent => Self::ComExtent(Vec::new()),
        }
    }

    /// Element type of this buffer.
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Float(_) => DataKind::Float,
            Self::Float3(_) => DataKind::Float3,
            Self::Float4(_) => DataKind::Float4,
            Self::Int(_) => DataKind::Int,
            Self::Stress(_) => DataKind::Stress,
            Self::ComExtent(_) => DataKind::ComExtent,
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        match self {
            Self::Float(v) => v.len(),
            Self::Float3(v) => v.len(),
            Self::Float4(v) => v.len(),
            Self::Int(v) => v.len(),
            Self::Stress(v) => v.len(),
            Self::ComExtent(v) => v.len(),
        }
    }

    /// Whether the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resize, zero-filling new entries.
    pub fn resize(&mut self, len: usize) {
        match self {
            Self::Float(v) => v.resize(len, 0.0),
            Self::Float3(v) => v.resize(len, Vec3::ZERO),
            Self::Float4(v) => v.resize(len, Vec4::ZERO),
            Self::Int(v) => v.resize(len, 0),
            Self::Stress(v) => v.resize(len, Stress::default()),
            Self::ComExtent(v) => v.resize(len, ComExtent::default()),
        }
    }

    /// Zero every entry, keeping the length.
    pub fn clear_values(&mut self) {
        match self {
            Self::Float(v) => v.iter_mut().for_each(|x| *x = 0.0),
            Self::Float3(v) => v.iter_mut().for_each(|x| *x = Vec3::ZERO),
            Self::Float4(v) => v.iter_mut().for_each(|x| *x = Vec4::ZERO),
            Self::Int(v) => v.iter_mut().for_each(|x| *x = 0),
            Self::Stress(v) => v.iter_mut().for_each(|x| *x = Stress::default()),
            Self::ComExtent(v) => v.iter_mut().for_each(|x| *x = ComExtent::default()),
        }
    }

    /// Raw bytes of the whole buffer.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Float(v) => bytemuck::cast_slice(v),
            Self::Float3(v) => bytemuck::cast_slice(v),
            Self::Float4(v) => bytemuck::cast_slice(v),
            Self::Int(v) => bytemuck::cast_slice(v),
            Self::Stress(v) => bytemuck::cast_slice(v),
            Self::ComExtent(v) => bytemuck::cast_slice(v),
        }
    }

    /// Append one entry decoded from `bytes` (length must match the kind).
    /// Reads are unaligned: the bytes come from packed wire buffers.
    pub fn push_from_bytes(&mut self, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), entry_size(self.kind()));
        match self {
            Self::Float(v) => v.push(bytemuck::pod_read_unaligned(bytes)),
            Self::Float3(v) => v.push(bytemuck::pod_read_unaligned(bytes)),
            Self::Float4(v) => v.push(bytemuck::pod_read_unaligned(bytes)),
            Self::Int(v) => v.push(bytemuck::pod_read_unaligned(bytes)),
            Self::Stress(v) => v.push(bytemuck::pod_read_unaligned(bytes)),
            Self::ComExtent(v) => v.push(bytemuck::pod_read_unaligned(bytes)),
        }
    }

    /// Overwrite entry `idx` from raw bytes.
    pub fn write_from_bytes(&mut self, idx: usize, bytes: &[u8]) {
        match self {
            Self::Float(v) => v[idx] = bytemuck::pod_read_unaligned(bytes),
            Self::Float3(v) => v[idx] = bytemuck::pod_read_unaligned(bytes),
            Self::Float4(v) => v[idx] = bytemuck::pod_read_unaligned(bytes),
            Self::Int(v) => v[idx] = bytemuck::pod_read_unaligned(bytes),
            Self::Stress(v) => v[idx] = bytemuck::pod_read_unaligned(bytes),
            Self::ComExtent(v) => v[idx] = bytemuck::pod_read_unaligned(bytes),
        }
    }

    /// Add raw-byte entry into entry `idx` (reverse reduction).
    pub fn add_from_bytes(&mut self, idx: usize, bytes: &[u8]) -> Result<()> {
        match self {
            Self::Float(v) => v[idx] += bytemuck::pod_read_unaligned::<f32>(bytes),
            Self::Float3(v) => v[idx] += bytemuck::pod_read_unaligned::<Vec3>(bytes),
            Self::Float4(v) => v[idx] += bytemuck::pod_read_unaligned::<Vec4>(bytes),
            Self::Int(v) => v[idx] += bytemuck::pod_read_unaligned::<i32>(bytes),
            Self::Stress(v) => v[idx] += bytemuck::pod_read_unaligned::<Stress>(bytes),
            Self::ComExtent(_) => {
                return Err(SimulationError::Invariant(
                    "com/extent entries cannot be accumulated".into(),
                ))
            }
        }
        Ok(())
    }

    /// Keep only entries whose flag in `keep` is set, preserving order.
    pub fn retain_by_mask(&mut self, keep: &[bool]) {
        fn retain<T: Copy>(v: &mut Vec<T>, keep: &[bool]) {
            let mut w = 0;
            for i in 0..v.len() {
                if keep[i] {
                    v[w] = v[i];
                    w += 1;
                }
            }
            v.truncate(w);
        }
        match self {
            Self::Float(v) => retain(v, keep),
            Self::Float3(v) => retain(v, keep),
            Self::Float4(v) => retain(v, keep),
            Self::Int(v) => retain(v, keep),
            Self::Stress(v) => retain(v, keep),
            Self::ComExtent(v) => retain(v, keep),
        }
    }

    /// Permute entries so that entry `i` moves to position `order[i]`.
    pub fn apply_order(&mut self, order: &[u32]) {
        fn permute<T: Copy + Default>(v: &mut Vec<T>, order: &[u32]) {
            let mut out = vec![T::default(); v.len()];
            for (i, &dst) in order.iter().enumerate() {
                out[dst as usize] = v[i];
            }
            *v = out;
        }
        match self {
            Self::Float(v) => permute(v, order),
            Self::Float3(v) => permute(v, order),
            Self::Float4(v) => permute(v, order),
            Self::Int(v) => permute(v, order),
            Self::Stress(v) => permute(v, order),
            Self::ComExtent(v) => permute(v, order),
        }
    }

    /// `self[i] += src[order[i]]` for all entries (cell-list accumulate).
    pub fn accumulate_ordered(&mut self, src: &ChannelData, order: &[u32]) -> Result<()> {
        if self.kind() != src.kind() {
            return Err(SimulationError::Invariant(format!(
                "accumulate between mismatched kinds {:?} and {:?}",
                self.kind(),
                src.kind()
            )));
        }
        match (self, src) {
            (Self::Float(d), Self::Float(s)) => {
                for (i, &o) in order.iter().enumerate() {
                    d[i] += s[o as usize];
                }
            }
            (Self::Float3(d), Self::Float3(s)) => {
                for (i, &o) in order.iter().enumerate() {
                    d[i] += s[o as usize];
                }
            }
            (Self::Float4(d), Self::Float4(s)) => {
                for (i, &o) in order.iter().enumerate() {
                    d[i] += s[o as usize];
                }
            }
            (Self::Int(d), Self::Int(s)) => {
                for (i, &o) in order.iter().enumerate() {
                    d[i] += s[o as usize];
                }
            }
            (Self::Stress(d), Self::Stress(s)) => {
                for (i, &o) in order.iter().enumerate() {
                    d[i] += s[o as usize];
                }
            }
            _ => {
                return Err(SimulationError::Invariant(
                    "com/extent entries cannot be accumulated".into(),
                ))
            }
        }
        Ok(())
    }

    /// `self[order[i]] = src[i]` for all entries (cell-list gather).
    pub fn scatter_ordered(&mut self, src: &ChannelData, order: &[u32]) -> Result<()> {
        if self.kind() != src.kind() {
            return Err(SimulationError::Invariant(format!(
                "gather between mismatched kinds {:?} and {:?}",
                self.kind(),
                src.kind()
            )));
        }
        fn scatter<T: Copy>(d: &mut [T], s: &[T], order: &[u32]) {
            for (i, &o) in order.iter().enumerate() {
                d[o as usize] = s[i];
            }
        }
        match (self, src) {
            (Self::Float(d), Self::Float(s)) => scatter(d, s, order),
            (Self::Float3(d), Self::Float3(s)) => scatter(d, s, order),
            (Self::Float4(d), Self::Float4(s)) => scatter(d, s, order),
            (Self::Int(d), Self::Int(s)) => scatter(d, s, order),
            (Self::Stress(d), Self::Stress(s)) => scatter(d, s, order),
            (Self::ComExtent(d), Self::ComExtent(s)) => scatter(d, s, order),
            _ => unreachable!(),
        }
        Ok(())
    }
}

/// One named channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    /// Lifetime class of the channel.
    pub persistence: Persistence,
    /// Typed contents.
    pub data: ChannelData,
}

/// Named-channel storage with persistence flags.
///
/// A `BTreeMap` keeps iteration order deterministic, which the exchange
/// packers and checkpoint records rely on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraDataManager {
    channels: BTreeMap<String, Channel>,
}

impl ExtraDataManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel, sized to `len`. Re-creating with the same kind is a
    /// no-op; a different kind is a type conflict.
    pub fn create_channel(
        &mut self,
        name: &str,
        kind: DataKind,
        persistence: Persistence,
        len: usize,
    ) -> Result<()> {
        if let Some(existing) = self.channels.get(name) {
            if existing.data.kind() != kind {
                return Err(SimulationError::ChannelTypeConflict {
                    name: name.to_string(),
                    existing: existing.data.kind(),
                    requested: kind,
                });
            }
            return Ok(());
        }
        let mut data = ChannelData::empty(kind);
        data.resize(len);
        self.channels.insert(
            name.to_string(),
            Channel { persistence, data },
        );
        Ok(())
    }

    /// Whether a channel with this name exists.
    pub fn check_exists(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    /// Element type of a channel, if present.
    pub fn kind_of(&self, name: &str) -> Option<DataKind> {
        self.channels.get(name).map(|c| c.data.kind())
    }

    /// Persistence flag of a channel, if present.
    pub fn persistence_of(&self, name: &str) -> Option<Persistence> {
        self.channels.get(name).map(|c| c.persistence)
    }

    /// All channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Channel names with the given persistence, sorted.
    pub fn names_with_persistence(&self, p: Persistence) -> Vec<String> {
        self.channels
            .iter()
            .filter(|(_, c)| c.persistence == p)
            .map(|(n, _)| n.clone())
            .collect()
    }

    fn get(&self, name: &str) -> Result<&Channel> {
        self.channels
            .get(name)
            .ok_or_else(|| SimulationError::Configuration(format!("no channel named '{name}'")))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Channel> {
        self.channels
            .get_mut(name)
            .ok_or_else(|| SimulationError::Configuration(format!("no channel named '{name}'")))
    }

    /// Typed read access to a channel's data.
    pub fn data(&self, name: &str) -> Result<&ChannelData> {
        Ok(&self.get(name)?.data)
    }

    /// Typed write access to a channel's data.
    pub fn data_mut(&mut self, name: &str) -> Result<&mut ChannelData> {
        Ok(&mut self.get_mut(name)?.data)
    }

    /// `f32` view of a channel.
    pub fn floats(&self, name: &str) -> Result<&[f32]> {
        match &self.get(name)?.data {
            ChannelData::Float(v) => Ok(v),
            other => Err(kind_mismatch(name, DataKind::Float, other.kind())),
        }
    }

    /// Mutable `f32` view of a channel.
    pub fn floats_mut(&mut self, name: &str) -> Result<&mut [f32]> {
        match &mut self.get_mut(name)?.data {
            ChannelData::Float(v) => Ok(v),
            other => Err(kind_mismatch(name, DataKind::Float, other.kind())),
        }
    }

    /// `Vec3` view of a channel.
    pub fn float3s(&self, name: &str) -> Result<&[Vec3]> {
        match &self.get(name)?.data {
            ChannelData::Float3(v) => Ok(v),
            other => Err(kind_mismatch(name, DataKind::Float3, other.kind())),
        }
    }

    /// Mutable `Vec3` view of a channel.
    pub fn float3s_mut(&mut self, name: &str) -> Result<&mut [Vec3]> {
        match &mut self.get_mut(name)?.data {
            ChannelData::Float3(v) => Ok(v),
            other => Err(kind_mismatch(name, DataKind::Float3, other.kind())),
        }
    }

    /// `ComExtent` view of a channel.
    pub fn com_extents(&self, name: &str) -> Result<&[ComExtent]> {
        match &self.get(name)?.data {
            ChannelData::ComExtent(v) => Ok(v),
            other => Err(kind_mismatch(name, DataKind::ComExtent, other.kind())),
        }
    }

    /// Mutable `ComExtent` view of a channel.
    pub fn com_extents_mut(&mut self, name: &str) -> Result<&mut [ComExtent]> {
        match &mut self.get_mut(name)?.data {
            ChannelData::ComExtent(v) => Ok(v),
            other => Err(kind_mismatch(name, DataKind::ComExtent, other.kind())),
        }
    }

    /// Zero a channel in place.
    pub fn clear(&mut self, name: &str) -> Result<()> {
        self.get_mut(name)?.data.clear_values();
        Ok(())
    }

    /// Resize one channel, zero-filling new entries.
    pub fn resize(&mut self, name: &str, len: usize) -> Result<()> {
        self.get_mut(name)?.data.resize(len);
        Ok(())
    }

    /// Resize every channel to `len`.
    pub fn resize_all(&mut self, len: usize) {
        for c in self.channels.values_mut() {
            c.data.resize(len);
        }
    }

    /// Move a channel's buffer out, leaving an empty one behind.
    ///
    /// Used by the interaction executor to hold output buffers while the rest
    /// of the manager stays readable; pair with [`Self::restore`].
    pub fn take(&mut self, name: &str) -> Result<ChannelData> {
        let c = self.get_mut(name)?;
        let kind = c.data.kind();
        Ok(std::mem::replace(&mut c.data, ChannelData::empty(kind)))
    }

    /// Put back a buffer previously moved out with [`Self::take`].
    pub fn restore(&mut self, name: &str, data: ChannelData) -> Result<()> {
        self.get_mut(name)?.data = data;
        Ok(())
    }

    /// Permute persistent channels by `order`; transient channels are resized
    /// to the permutation length and zeroed (a cell-list build invalidates
    /// them anyway).
    pub fn apply_order(&mut self, order: &[u32]) {
        for c in self.channels.values_mut() {
            match c.persistence {
                Persistence::Persistent => c.data.apply_order(order),
                Persistence::Transient => {
                    c.data.resize(order.len());
                    c.data.clear_values();
                }
            }
        }
    }

    /// Drop entries not flagged in `keep`, across every channel.
    pub fn retain_by_mask(&mut self, keep: &[bool]) {
        for c in self.channels.values_mut() {
            c.data.retain_by_mask(keep);
        }
    }

    /// Truncate every channel to zero length.
    pub fn truncate(&mut self) {
        for c in self.channels.values_mut() {
            c.data.resize(0);
        }
    }
}

fn kind_mismatch(name: &str, wanted: DataKind, got: DataKind) -> SimulationError {
    SimulationError::Invariant(format!(
        "channel '{name}' holds {got:?}, accessed as {wanted:?}"
    ))
}

/// Names of the channels the engine itself knows about.
pub mod channel_names {
    /// Per-particle force accumulator (transient).
    pub const FORCES: &str = "forces";
    /// Per-particle number density (transient, intermediate stage).
    pub const DENSITIES: &str = "densities";
    /// Per-particle virial stress (transient, stride-activated).
    pub const STRESSES: &str = "stresses";
    /// Per-object center of mass and extent (transient).
    pub const COM_EXTENTS: &str = "com_extents";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent_for_same_kind() {
        let mut m = ExtraDataManager::new();
        m.create_channel("densities", DataKind::Float, Persistence::Transient, 4)
            .unwrap();
        m.create_channel("densities", DataKind::Float, Persistence::Transient, 4)
            .unwrap();
        assert!(m.check_exists("densities"));
    }

    #[test]
    fn create_conflicting_kind_fails() {
        let mut m = ExtraDataManager::new();
        m.create_channel("q", DataKind::Float, Persistence::Transient, 1)
            .unwrap();
        let err = m
            .create_channel("q", DataKind::Float3, Persistence::Transient, 1)
            .unwrap_err();
        assert!(matches!(err, SimulationError::ChannelTypeConflict { .. }));
    }

    #[test]
    fn accumulate_and_scatter_follow_order() {
        let mut pv = ChannelData::Float(vec![1.0, 2.0, 3.0]);
        // cell order: particle 0 -> slot 2, 1 -> slot 0, 2 -> slot 1
        let order = [2u32, 0, 1];
        let cl = ChannelData::Float(vec![10.0, 20.0, 30.0]);
        pv.accumulate_ordered(&cl, &order).unwrap();
        assert_eq!(pv, ChannelData::Float(vec![31.0, 12.0, 23.0]));

        let mut gathered = ChannelData::Float(vec![0.0; 3]);
        gathered.scatter_ordered(&pv, &order).unwrap();
        assert_eq!(gathered, ChannelData::Float(vec![12.0, 23.0, 31.0]));
    }

    #[test]
    fn apply_order_spares_only_persistent() {
        let mut m = ExtraDataManager::new();
        m.create_channel("tag", DataKind::Int, Persistence::Persistent, 3)
            .unwrap();
        m.create_channel("forces", DataKind::Float3, Persistence::Transient, 3)
            .unwrap();
        if let ChannelData::Int(v) = m.data_mut("tag").unwrap() {
            v.copy_from_slice(&[7, 8, 9]);
        }
        m.apply_order(&[2, 0, 1]);
        assert_eq!(m.data("tag").unwrap(), &ChannelData::Int(vec![8, 9, 7]));
        assert_eq!(m.data("forces").unwrap().len(), 3);
    }

    #[test]
    fn byte_roundtrip_per_entry() {
        let mut c = ChannelData::Float3(vec![Vec3::new(1.0, 2.0, 3.0)]);
        let bytes = c.bytes().to_vec();
        c.push_from_bytes(&bytes[0..12]);
        assert_eq!(c.len(), 2);
        if let ChannelData::Float3(v) = &c {
            assert_eq!(v[1], Vec3::new(1.0, 2.0, 3.0));
        }
    }
}
