//! Object-belonging checkers.
//!
//! A checker partitions a particle vector into the part lying inside the
//! geometry of an object vector and the part outside. The driver owns the
//! actual particle movement; checkers only classify.

use std::path::Path;

use glam::Vec3;

use crate::error::{Result, SimulationError};
use crate::particles::ParticleVector;

/// Classifies particles as inside/outside the objects of one vector.
pub trait ObjectBelongingChecker: Send {
    /// Unique name used in registration and logs.
    fn name(&self) -> &str;

    /// Bind-time validation against the object vector.
    fn setup(&mut self, ov: &ParticleVector) -> Result<()> {
        if !ov.is_object() {
            return Err(SimulationError::Configuration(format!(
                "belonging checker '{}' bound to non-object vector '{}'",
                self.name(),
                ov.name()
            )));
        }
        Ok(())
    }

    /// Extra object channels halo exchange must carry for this checker.
    fn channels_to_exchange(&self) -> Vec<String> {
        Vec::new()
    }

    /// For each position, whether it lies inside any local object of `ov`.
    fn classify(&self, ov: &ParticleVector, positions: &[Vec3]) -> Result<Vec<bool>>;

    /// Write private state to a restart folder.
    fn checkpoint(&self, _rank: usize, _folder: &Path) -> Result<()> {
        Ok(())
    }

    /// Read private state back.
    fn restart(&mut self, _rank: usize, _folder: &Path) -> Result<()> {
        Ok(())
    }
}

/// Inside = within a fixed radius of any object's center of mass. Stands in
/// for the mesh-inclusion test, which is an external collaborator.
pub struct SphereBelongingChecker {
    name: String,
    /// Inclusion radius around each object's center of mass.
    pub radius: f32,
}

impl SphereBelongingChecker {
    /// New sphere checker.
    pub fn new(name: &str, radius: f32) -> Self {
        Self {
            name: name.to_string(),
            radius,
        }
    }
}

impl ObjectBelongingChecker for SphereBelongingChecker {
    fn name(&self) -> &str {
        &self.name
    }

    fn classify(&self, ov: &ParticleVector, positions: &[Vec3]) -> Result<Vec<bool>> {
        let info = ov.objects.as_ref().ok_or_else(|| {
            SimulationError::Configuration(format!(
                "belonging checker '{}' executed on non-object vector '{}'",
                self.name,
                ov.name()
            ))
        })?;
        let size = info.object_size;
        let n_obj = ov.local_object_count()?;
        let coms: Vec<Vec3> = (0..n_obj)
            .map(|o| {
                ov.local.positions[o * size..(o + 1) * size]
                    .iter()
                    .copied()
                    .sum::<Vec3>()
                    / size as f32
            })
            .collect();

        let r2 = self.radius * self.radius;
        Ok(positions
            .iter()
            .map(|&x| coms.iter().any(|&c| (x - c).length_squared() < r2))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_distance_to_object_com() {
        let mut ov = ParticleVector::new_object("cell", 1.0, 2, None).unwrap();
        ov.local.push(Vec3::new(-1.0, 0.0, 0.0), Vec3::ZERO, 0);
        ov.local.push(Vec3::new(1.0, 0.0, 0.0), Vec3::ZERO, 1);
        ov.local.align_channels();

        let checker = SphereBelongingChecker::new("sphere", 0.5);
        let flags = checker
            .classify(&ov, &[Vec3::ZERO, Vec3::new(3.0, 0.0, 0.0)])
            .unwrap();
        assert_eq!(flags, vec![true, false]);
    }
}
