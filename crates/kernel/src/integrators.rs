//! Particle integrators.
//!
//! Integrators are the only tasks that advance local positions during a step;
//! every implementation must bump the motion stamp so cell lists rebuild.

use std::path::Path;

use glam::Vec3;

use crate::channels::channel_names::FORCES;
use crate::error::Result;
use crate::particles::ParticleVector;
use crate::state::SimulationState;

/// Advances one particle vector per step from its accumulated forces.
pub trait Integrator: Send {
    /// Unique name used in registration and logs.
    fn name(&self) -> &str;

    /// Declare needed channels on the vector before the run starts.
    fn set_prerequisites(&self, _pv: &mut ParticleVector) -> Result<()> {
        Ok(())
    }

    /// Advance the local partition by one `dt`.
    fn execute(&self, state: &SimulationState, pv: &mut ParticleVector) -> Result<()>;

    /// Write private state to a restart folder.
    fn checkpoint(&self, _rank: usize, _folder: &Path) -> Result<()> {
        Ok(())
    }

    /// Read private state back.
    fn restart(&mut self, _rank: usize, _folder: &Path) -> Result<()> {
        Ok(())
    }
}

/// Velocity-Verlet in its force-kick + drift form: `v += f/m dt; x += v dt`.
pub struct VelocityVerlet {
    name: String,
}

impl VelocityVerlet {
    /// New integrator with the given registration name.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl Integrator for VelocityVerlet {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, state: &SimulationState, pv: &mut ParticleVector) -> Result<()> {
        let dt = state.dt;
        let inv_m = 1.0 / pv.mass;
        let storage = &mut pv.local;
        let forces = storage.channels.float3s(FORCES)?;
        for i in 0..storage.positions.len() {
            storage.velocities[i] += forces[i] * (inv_m * dt);
            storage.positions[i] += storage.velocities[i] * dt;
        }
        pv.bump_motion_stamp();
        Ok(())
    }
}

/// Rigid translation: overwrites velocities with a constant field and drifts.
/// Useful for inflow species and as a deterministic motion source in tests.
pub struct Translate {
    name: String,
    /// Imposed velocity.
    pub velocity: Vec3,
}

impl Translate {
    /// New translator with the given registration name.
    pub fn new(name: &str, velocity: Vec3) -> Self {
        Self {
            name: name.to_string(),
            velocity,
        }
    }
}

impl Integrator for Translate {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, state: &SimulationState, pv: &mut ParticleVector) -> Result<()> {
        let dt = state.dt;
        let v = self.velocity;
        for i in 0..pv.local.positions.len() {
            pv.local.velocities[i] = v;
            pv.local.positions[i] += v * dt;
        }
        pv.bump_motion_stamp();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DomainInfo;
    use glam::IVec3;

    fn state() -> SimulationState {
        SimulationState::new(0.1, DomainInfo::new(Vec3::splat(8.0), IVec3::ZERO, IVec3::ONE))
    }

    #[test]
    fn velocity_verlet_kicks_then_drifts() {
        let mut pv = ParticleVector::new("solvent", 2.0);
        pv.local.push(Vec3::ZERO, Vec3::new(1.0, 0.0, 0.0), 0);
        pv.local.align_channels();
        pv.local.channels.float3s_mut(FORCES).unwrap()[0] = Vec3::new(0.0, 4.0, 0.0);

        let stamp = pv.motion_stamp();
        VelocityVerlet::new("vv").execute(&state(), &mut pv).unwrap();

        // v = (1, 0.2, 0), x = v * dt
        assert!((pv.local.velocities[0] - Vec3::new(1.0, 0.2, 0.0)).length() < 1e-6);
        assert!((pv.local.positions[0] - Vec3::new(0.1, 0.02, 0.0)).length() < 1e-6);
        assert!(pv.motion_stamp() > stamp);
    }

    #[test]
    fn translate_imposes_velocity() {
        let mut pv = ParticleVector::new("inflow", 1.0);
        pv.local.push(Vec3::ZERO, Vec3::new(9.0, 9.0, 9.0), 0);
        pv.local.align_channels();
        Translate::new("shift", Vec3::new(2.0, 0.0, 0.0))
            .execute(&state(), &mut pv)
            .unwrap();
        assert_eq!(pv.local.velocities[0], Vec3::new(2.0, 0.0, 0.0));
        assert!((pv.local.positions[0].x - 0.2).abs() < 1e-6);
    }
}
