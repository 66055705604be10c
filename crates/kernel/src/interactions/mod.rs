//! Pairwise interactions.
//!
//! The engine treats interaction numerics as black boxes characterised only by
//! their cutoff and their channel traffic. An interaction declares which
//! channels it reads and writes (with an optional every-N activity stride);
//! the interaction manager builds directed [`PairPass`]es over cell-list
//! views and the kernels fold a per-pair closure over them.

mod density;
mod dpd;
mod exec;
mod mdpd;
pub mod rng;

pub use density::PairwiseDensity;
pub use dpd::PairwiseDpd;
pub use exec::{run_force, run_scalar};
pub use mdpd::PairwiseMdpd;

use std::path::Path;

use glam::Vec3;

use crate::celllist::CellListInfo;
use crate::channels::{ChannelData, DataKind, Stress};
use crate::error::Result;
use crate::state::SimulationState;

/// Pipeline stage of an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionStage {
    /// Produces scalar/vector fields consumed by other interactions this step.
    Intermediate,
    /// Produces forces/stresses consumed by integrators.
    Final,
}

/// When a declared channel is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelActivity {
    /// Live on every step.
    Always,
    /// Live when `step % n == 0`.
    Every(u64),
}

impl ChannelActivity {
    /// Whether the channel is touched on `step`.
    pub fn is_active(&self, step: u64) -> bool {
        match self {
            Self::Always => true,
            Self::Every(n) => *n > 0 && step % n == 0,
        }
    }
}

/// A channel an interaction reads or writes.
#[derive(Debug, Clone)]
pub struct InteractionChannel {
    /// Channel name.
    pub name: String,
    /// Element type, used to create the channel on every storage that needs it.
    pub kind: DataKind,
    /// Activity predicate.
    pub activity: ChannelActivity,
}

impl InteractionChannel {
    /// Channel active on every step.
    pub fn always(name: &str, kind: DataKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            activity: ChannelActivity::Always,
        }
    }

    /// Channel active every `n` steps.
    pub fn every(name: &str, kind: DataKind, n: u64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            activity: ChannelActivity::Every(n),
        }
    }
}

/// The fields a pair kernel may fetch for one particle.
#[derive(Debug, Clone, Copy)]
pub struct PairParticle {
    /// Position in the frame of the pass.
    pub position: Vec3,
    /// Velocity.
    pub velocity: Vec3,
    /// Global id (pair noise is symmetric in these).
    pub id: u64,
    /// Number density, zero unless the pass fetches `densities`.
    pub density: f32,
}

/// Read-only view of one side of a pass.
#[derive(Clone, Copy)]
pub struct SideView<'a> {
    /// Positions, in the ordering of the owning storage.
    pub positions: &'a [Vec3],
    /// Velocities, parallel to `positions`.
    pub velocities: &'a [Vec3],
    /// Ids, parallel to `positions`.
    pub ids: &'a [u64],
    /// Particle mass of the species.
    pub mass: f32,
    /// `densities` channel when the interaction declared it as input.
    pub densities: Option<&'a [f32]>,
}

impl<'a> SideView<'a> {
    /// Number of particles on this side.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether this side is empty.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Assemble the fetchable fields of particle `i`.
    #[inline]
    pub fn fetch(&self, i: usize) -> PairParticle {
        PairParticle {
            position: self.positions[i],
            velocity: self.velocities[i],
            id: self.ids[i],
            density: self.densities.map_or(0.0, |d| d[i]),
        }
    }
}

/// Cell-grid view used for neighbor candidate enumeration.
#[derive(Clone, Copy)]
pub struct GridView<'a> {
    /// Grid geometry.
    pub info: CellListInfo,
    /// Prefix-summed cell starts (with end sentinel).
    pub starts: &'a [u32],
    /// Per-cell counts.
    pub sizes: &'a [u32],
}

impl GridView<'_> {
    /// Invoke `f` for every particle index in the 3x3x3 cell neighborhood of
    /// `pos`. No distance filtering; the runners do that.
    #[inline]
    pub fn for_each_candidate(&self, pos: Vec3, mut f: impl FnMut(usize)) {
        let c = self.info.cell_coords(pos);
        let n = self.info.ncells;
        for dz in -1i32..=1 {
            let z = c.z + dz;
            if z < 0 || z >= n.z {
                continue;
            }
            for dy in -1i32..=1 {
                let y = c.y + dy;
                if y < 0 || y >= n.y {
                    continue;
                }
                for dx in -1i32..=1 {
                    let x = c.x + dx;
                    if x < 0 || x >= n.x {
                        continue;
                    }
                    let cell = self.info.encode(glam::IVec3::new(x, y, z));
                    let start = self.starts[cell] as usize;
                    let count = self.sizes[cell] as usize;
                    for s in start..start + count {
                        f(s);
                    }
                }
            }
        }
    }
}

/// Shape of one directed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    /// dst and src are the same cell-ordered set; the grid indexes it.
    LocalSelf,
    /// Distinct local sets; the grid indexes src.
    LocalCross,
    /// src is a halo partition; the grid indexes dst.
    Halo,
}

/// Output buffers of one pass, moved out of the owning channel storage for
/// the duration of the pass.
#[derive(Default)]
pub struct OutputSet {
    entries: Vec<(String, ChannelData)>,
}

impl OutputSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a taken buffer under its channel name.
    pub fn insert(&mut self, name: String, data: ChannelData) {
        self.entries.push((name, data));
    }

    /// Whether a channel buffer is present.
    pub fn has(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Whether no buffers were taken.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mutable `f32` buffer by name.
    pub fn floats_mut(&mut self, name: &str) -> Option<&mut [f32]> {
        self.entries.iter_mut().find_map(|(n, d)| match d {
            ChannelData::Float(v) if n == name => Some(v.as_mut_slice()),
            _ => None,
        })
    }

    /// Mutable `Vec3` buffer by name.
    pub fn float3s_mut(&mut self, name: &str) -> Option<&mut [Vec3]> {
        self.entries.iter_mut().find_map(|(n, d)| match d {
            ChannelData::Float3(v) if n == name => Some(v.as_mut_slice()),
            _ => None,
        })
    }

    /// Simultaneous force and stress buffers (the stress one may be absent on
    /// off-stride steps).
    pub fn force_and_stress(&mut self) -> (Option<&mut [Vec3]>, Option<&mut [Stress]>) {
        use crate::channels::channel_names::{FORCES, STRESSES};
        let mut force = None;
        let mut stress = None;
        for (n, d) in &mut self.entries {
            match d {
                ChannelData::Float3(v) if n == FORCES => force = Some(v.as_mut_slice()),
                ChannelData::Stress(v) if n == STRESSES => stress = Some(v.as_mut_slice()),
                _ => {}
            }
        }
        (force, stress)
    }

    /// Hand the buffers back for restoration.
    pub fn into_entries(self) -> Vec<(String, ChannelData)> {
        self.entries
    }
}

/// One directed execution pass handed to an interaction.
pub struct PairPass<'a> {
    /// Global clock (step number seeds the pair noise).
    pub state: &'a SimulationState,
    /// Pass shape.
    pub kind: PassKind,
    /// Side whose output channels are accumulated.
    pub dst: SideView<'a>,
    /// Side that only sources neighbor data (equal to `dst` for
    /// [`PassKind::LocalSelf`]).
    pub src: SideView<'a>,
    /// Cell grid (over src for local passes, over dst for halo passes).
    pub grid: GridView<'a>,
    /// Output buffers on the dst side.
    pub out: &'a mut OutputSet,
    /// Output buffers on the halo side, present when the src species is an
    /// object vector whose halo results are reverse-reduced to the owner.
    pub halo_out: Option<&'a mut OutputSet>,
}

/// A pairwise interaction, characterised by cutoff and channel traffic.
pub trait Interaction: Send {
    /// Unique name used in registration and logs.
    fn name(&self) -> &str;

    /// Interaction cutoff radius.
    fn rc(&self) -> f32;

    /// Which pipeline stage the outputs feed.
    fn stage(&self) -> InteractionStage;

    /// Channels read from cell lists during execution.
    fn input_channels(&self) -> Vec<InteractionChannel> {
        Vec::new()
    }

    /// Channels written during execution.
    fn output_channels(&self) -> Vec<InteractionChannel>;

    /// Run one directed pass.
    fn execute(&self, pass: PairPass<'_>) -> Result<()>;

    /// Write private state to a restart folder (most interactions have none).
    fn checkpoint(&self, _rank: usize, _folder: &Path) -> Result<()> {
        Ok(())
    }

    /// Read private state back from a restart folder.
    fn restart(&mut self, _rank: usize, _folder: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activity_strides() {
        assert!(ChannelActivity::Always.is_active(17));
        let every5 = ChannelActivity::Every(5);
        assert!(every5.is_active(0));
        assert!(!every5.is_active(4));
        assert!(every5.is_active(10));
        assert!(!ChannelActivity::Every(0).is_active(0));
    }
}
