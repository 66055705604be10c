//! Initial conditions.

use glam::Vec3;

use crate::error::Result;
use crate::particles::{particle_id, ParticleVector};
use crate::state::SimulationState;

/// Populates a freshly registered particle vector.
pub trait InitialConditions: Send {
    /// Fill the local partition of `pv` for the subdomain of `rank`.
    fn exec(&self, rank: u32, state: &SimulationState, pv: &mut ParticleVector) -> Result<()>;
}

/// Deterministic lattice fill at (approximately) a target number density.
///
/// Particles start at rest on a regular grid; ids are globally unique across
/// ranks.
pub struct UniformIc {
    /// Requested particles per unit volume.
    pub number_density: f32,
}

impl UniformIc {
    /// Uniform fill with the given number density.
    pub fn new(number_density: f32) -> Self {
        Self { number_density }
    }
}

impl InitialConditions for UniformIc {
    fn exec(&self, rank: u32, state: &SimulationState, pv: &mut ParticleVector) -> Result<()> {
        if self.number_density <= 0.0 {
            pv.local.align_channels();
            return Ok(());
        }
        let l = state.domain.local_size;
        let per_unit = self.number_density.cbrt();
        let n = [
            ((l.x * per_unit).round() as usize).max(1),
            ((l.y * per_unit).round() as usize).max(1),
            ((l.z * per_unit).round() as usize).max(1),
        ];
        let h = Vec3::new(l.x / n[0] as f32, l.y / n[1] as f32, l.z / n[2] as f32);

        let mut index = 0u64;
        for i in 0..n[0] {
            for j in 0..n[1] {
                for k in 0..n[2] {
                    let x = Vec3::new(
                        (i as f32 + 0.5) * h.x,
                        (j as f32 + 0.5) * h.y,
                        (k as f32 + 0.5) * h.z,
                    ) - 0.5 * l;
                    pv.local.push(x, Vec3::ZERO, particle_id(rank, index));
                    index += 1;
                }
            }
        }
        pv.local.align_channels();
        pv.bump_motion_stamp();
        tracing::info!(
            pv = pv.name(),
            particles = pv.local.len(),
            "uniform initial conditions applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DomainInfo;
    use glam::IVec3;

    #[test]
    fn lattice_density_close_to_target() {
        let domain = DomainInfo::new(Vec3::splat(4.0), IVec3::ZERO, IVec3::ONE);
        let state = SimulationState::new(0.01, domain);
        let mut pv = ParticleVector::new("solvent", 1.0);
        UniformIc::new(8.0).exec(0, &state, &mut pv).unwrap();

        let volume = 4.0f32.powi(3);
        let density = pv.local.len() as f32 / volume;
        assert!((density - 8.0).abs() / 8.0 < 0.05, "density {density}");

        // all resident, ids unique
        for &x in &pv.local.positions {
            assert!(state.domain.contains_local(x));
        }
        let mut ids = pv.local.ids.clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), pv.local.len());
    }
}
