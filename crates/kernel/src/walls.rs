//! Walls: static boundaries particles bounce off.
//!
//! Signed-distance geometry is an external collaborator; the engine sees a
//! wall as something that can purge its interior at setup, reflect particles
//! after integration, and count violators for the periodic integrity check.

use std::path::Path;

use glam::Vec3;

use crate::error::Result;
use crate::particles::ParticleVector;
use crate::state::{DomainInfo, SimulationState};

/// A static boundary bound to particle vectors by the driver.
pub trait Wall: Send {
    /// Unique name used in registration and logs.
    fn name(&self) -> &str;

    /// One-time geometry setup for this subdomain.
    fn setup(&mut self, _domain: &DomainInfo) -> Result<()> {
        Ok(())
    }

    /// Remove particles that start inside the wall. Returns how many went.
    fn remove_inner(&self, domain: &DomainInfo, pv: &mut ParticleVector) -> Result<usize>;

    /// Reflect particles that penetrated the wall during integration.
    fn bounce(&self, state: &SimulationState, pv: &mut ParticleVector) -> Result<()>;

    /// Count particles currently inside the wall (integrity check).
    fn check(&self, state: &SimulationState, pv: &ParticleVector) -> Result<usize>;

    /// Write private state to a restart folder.
    fn checkpoint(&self, _rank: usize, _folder: &Path) -> Result<()> {
        Ok(())
    }

    /// Read private state back.
    fn restart(&mut self, _rank: usize, _folder: &Path) -> Result<()> {
        Ok(())
    }
}

/// Half-space wall: the plane through `point` with outward `normal`; the
/// normal side is the allowed region. Both are global-frame quantities.
pub struct PlaneWall {
    name: String,
    /// A point on the plane.
    pub point: Vec3,
    /// Unit normal pointing into the allowed half-space.
    pub normal: Vec3,
}

impl PlaneWall {
    /// New plane wall; the normal is normalized here.
    pub fn new(name: &str, point: Vec3, normal: Vec3) -> Self {
        Self {
            name: name.to_string(),
            point,
            normal: normal.normalize(),
        }
    }

    #[inline]
    fn signed_distance(&self, domain: &DomainInfo, local: Vec3) -> f32 {
        (domain.local_to_global(local) - self.point).dot(self.normal)
    }
}

impl Wall for PlaneWall {
    fn name(&self) -> &str {
        &self.name
    }

    fn remove_inner(&self, domain: &DomainInfo, pv: &mut ParticleVector) -> Result<usize> {
        let keep: Vec<bool> = pv
            .local
            .positions
            .iter()
            .map(|&x| self.signed_distance(domain, x) >= 0.0)
            .collect();
        let removed = keep.iter().filter(|k| !**k).count();
        if removed > 0 {
            pv.local.retain_by_mask(&keep);
            pv.bump_motion_stamp();
            tracing::info!(
                wall = self.name.as_str(),
                pv = pv.name(),
                removed,
                "removed particles inside wall"
            );
        }
        Ok(removed)
    }

    fn bounce(&self, state: &SimulationState, pv: &mut ParticleVector) -> Result<()> {
        let domain = &state.domain;
        let mut bounced = false;
        for i in 0..pv.local.positions.len() {
            let s = self.signed_distance(domain, pv.local.positions[i]);
            if s >= 0.0 {
                continue;
            }
            pv.local.positions[i] -= 2.0 * s * self.normal;
            let v = pv.local.velocities[i];
            pv.local.velocities[i] = v - 2.0 * v.dot(self.normal) * self.normal;
            bounced = true;
        }
        if bounced {
            pv.bump_motion_stamp();
        }
        Ok(())
    }

    fn check(&self, state: &SimulationState, pv: &ParticleVector) -> Result<usize> {
        let inside = pv
            .local
            .positions
            .iter()
            .filter(|&&x| self.signed_distance(&state.domain, x) < 0.0)
            .count();
        if inside > 0 {
            tracing::warn!(
                wall = self.name.as_str(),
                pv = pv.name(),
                inside,
                step = state.current_step,
                "wall integrity check found particles inside"
            );
        }
        Ok(inside)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;

    fn setup() -> (SimulationState, PlaneWall) {
        let domain = DomainInfo::new(Vec3::splat(8.0), IVec3::ZERO, IVec3::ONE);
        let state = SimulationState::new(0.1, domain);
        // floor at global y = 2, allowed above
        let wall = PlaneWall::new("floor", Vec3::new(0.0, 2.0, 0.0), Vec3::Y);
        (state, wall)
    }

    #[test]
    fn remove_inner_purges_the_wrong_side() {
        let (state, wall) = setup();
        let mut pv = ParticleVector::new("solvent", 1.0);
        // global y = local y + 4
        pv.local.push(Vec3::new(0.0, -3.0, 0.0), Vec3::ZERO, 0); // global y = 1, inside
        pv.local.push(Vec3::new(0.0, 0.0, 0.0), Vec3::ZERO, 1); // global y = 4, outside
        pv.local.align_channels();
        let removed = wall.remove_inner(&state.domain, &mut pv).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(pv.local.ids, vec![1]);
    }

    #[test]
    fn bounce_reflects_position_and_velocity() {
        let (state, wall) = setup();
        let mut pv = ParticleVector::new("solvent", 1.0);
        pv.local.push(Vec3::new(0.0, -2.5, 0.0), Vec3::new(0.0, -1.0, 0.0), 0); // global y = 1.5
        pv.local.align_channels();
        wall.bounce(&state, &mut pv).unwrap();
        // reflected to global y = 2.5 -> local y = -1.5
        assert!((pv.local.positions[0].y + 1.5).abs() < 1e-5);
        assert!((pv.local.velocities[0].y - 1.0).abs() < 1e-5);
        assert_eq!(wall.check(&state, &pv).unwrap(), 0);
    }
}
