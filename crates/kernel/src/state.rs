//! Global clock and subdomain geometry.
//!
//! `SimulationState` is process-wide but owned and mutated only by the driver;
//! every component receives it as an explicit handle.

use std::fs;
use std::path::Path;

use glam::{IVec3, Vec3};

use crate::error::{Result, SimulationError};

/// Geometry of the local subdomain inside the global box.
///
/// Local coordinates are centered on the subdomain: a resident particle
/// satisfies `-local_size/2 <= x < local_size/2` per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainInfo {
    /// Extent of the whole simulation box.
    pub global_size: Vec3,
    /// Lower corner of this subdomain in global coordinates.
    pub global_start: Vec3,
    /// Extent of this subdomain.
    pub local_size: Vec3,
}

impl DomainInfo {
    /// Build the subdomain of rank `coords` in a `ranks` Cartesian grid that
    /// splits `global_size` evenly.
    pub fn new(global_size: Vec3, coords: IVec3, ranks: IVec3) -> Self {
        let local_size = global_size / ranks.as_vec3();
        let global_start = local_size * coords.as_vec3();
        Self {
            global_size,
            global_start,
            local_size,
        }
    }

    /// Map a local (subdomain-centered) coordinate to the global frame.
    #[inline]
    pub fn local_to_global(&self, x: Vec3) -> Vec3 {
        x + self.global_start + 0.5 * self.local_size
    }

    /// Map a global coordinate to the local frame.
    #[inline]
    pub fn global_to_local(&self, x: Vec3) -> Vec3 {
        x - self.global_start - 0.5 * self.local_size
    }

    /// Whether a local coordinate is resident in this subdomain.
    #[inline]
    pub fn contains_local(&self, x: Vec3) -> bool {
        let h = 0.5 * self.local_size;
        x.x >= -h.x && x.x < h.x && x.y >= -h.y && x.y < h.y && x.z >= -h.z && x.z < h.z
    }
}

/// Global clock plus the local subdomain geometry.
#[derive(Debug, Clone)]
pub struct SimulationState {
    /// Current timestep index.
    pub current_step: u64,
    /// Current simulation time.
    pub current_time: f64,
    /// Timestep size.
    pub dt: f32,
    /// Local subdomain geometry.
    pub domain: DomainInfo,
}

impl SimulationState {
    /// Fresh state at time zero.
    pub fn new(dt: f32, domain: DomainInfo) -> Self {
        Self {
            current_step: 0,
            current_time: 0.0,
            dt,
            domain,
        }
    }

    /// Write the two-value text record (`current_time current_step`).
    pub fn write_record(&self, path: &Path) -> Result<()> {
        fs::write(path, format!("{} {}\n", self.current_time, self.current_step))?;
        Ok(())
    }

    /// Read the clock back from a text record written by [`Self::write_record`].
    pub fn read_record(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path).map_err(|e| {
            SimulationError::Restart(format!("cannot read state record {}: {e}", path.display()))
        })?;
        let mut it = text.split_whitespace();
        let time = it
            .next()
            .and_then(|t| t.parse::<f64>().ok())
            .ok_or_else(|| SimulationError::Restart("malformed time in state record".into()))?;
        let step = it
            .next()
            .and_then(|t| t.parse::<u64>().ok())
            .ok_or_else(|| SimulationError::Restart("malformed step in state record".into()))?;
        self.current_time = time;
        self.current_step = step;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_global_roundtrip() {
        let domain = DomainInfo::new(Vec3::new(16.0, 8.0, 8.0), IVec3::new(1, 0, 0), IVec3::new(2, 1, 1));
        assert_eq!(domain.local_size, Vec3::new(8.0, 8.0, 8.0));
        assert_eq!(domain.global_start, Vec3::new(8.0, 0.0, 0.0));

        let x = Vec3::new(1.5, -2.0, 3.0);
        let g = domain.local_to_global(x);
        assert_eq!(g, Vec3::new(13.5, 2.0, 7.0));
        assert!((domain.global_to_local(g) - x).length() < 1e-6);
    }

    #[test]
    fn residency_is_half_open() {
        let domain = DomainInfo::new(Vec3::splat(8.0), IVec3::ZERO, IVec3::ONE);
        assert!(domain.contains_local(Vec3::new(-4.0, 0.0, 0.0)));
        assert!(!domain.contains_local(Vec3::new(4.0, 0.0, 0.0)));
    }

    #[test]
    fn state_record_roundtrip() {
        let domain = DomainInfo::new(Vec3::splat(4.0), IVec3::ZERO, IVec3::ONE);
        let mut state = SimulationState::new(0.01, domain);
        state.current_step = 42;
        state.current_time = 0.42;

        let path = std::env::temp_dir().join(format!("state_record_{}", std::process::id()));
        state.write_record(&path).unwrap();

        let mut fresh = SimulationState::new(0.01, domain);
        fresh.read_record(&path).unwrap();
        assert_eq!(fresh.current_step, 42);
        assert_eq!(fresh.current_time, 0.42);
        std::fs::remove_file(&path).ok();
    }
}
