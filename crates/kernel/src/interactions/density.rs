//! Number-density summation (intermediate stage).

use std::f32::consts::PI;

use crate::channels::channel_names::DENSITIES;
use crate::channels::DataKind;
use crate::error::Result;

use super::{exec, Interaction, InteractionChannel, InteractionStage, PairPass};

/// Mass-weighted density with the quadratic core kernel
/// `w(r) = 15 / (2 pi rc^3) (1 - r/rc)^2`.
pub struct PairwiseDensity {
    name: String,
    rc: f32,
}

impl PairwiseDensity {
    /// Density interaction with the given cutoff.
    pub fn new(name: &str, rc: f32) -> Self {
        Self {
            name: name.to_string(),
            rc,
        }
    }
}

impl Interaction for PairwiseDensity {
    fn name(&self) -> &str {
        &self.name
    }

    fn rc(&self) -> f32 {
        self.rc
    }

    fn stage(&self) -> InteractionStage {
        InteractionStage::Intermediate
    }

    fn output_channels(&self) -> Vec<InteractionChannel> {
        vec![InteractionChannel::always(DENSITIES, DataKind::Float)]
    }

    fn execute(&self, pass: PairPass<'_>) -> Result<()> {
        let rc = self.rc;
        let norm = 15.0 / (2.0 * PI * rc * rc * rc);
        let src_mass = pass.src.mass;

        exec::run_scalar(pass, rc, DENSITIES, move |dst, src| {
            let r = (dst.position - src.position).length();
            let arg = 1.0 - r / rc;
            src_mass * norm * arg * arg
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::celllist::CellList;
    use crate::channels::{channel_names, ChannelData};
    use crate::interactions::{GridView, OutputSet, PassKind, SideView};
    use crate::particles::ParticleVector;
    use crate::state::{DomainInfo, SimulationState};
    use glam::{IVec3, Vec3};

    #[test]
    fn touching_pair_gets_symmetric_density() {
        let domain = DomainInfo::new(Vec3::splat(4.0), IVec3::ZERO, IVec3::ONE);
        let state = SimulationState::new(0.01, domain);
        let mut pv = ParticleVector::new("solvent", 2.0);
        pv.local.push(Vec3::new(-0.2, 0.0, 0.0), Vec3::ZERO, 0);
        pv.local.push(Vec3::new(0.2, 0.0, 0.0), Vec3::ZERO, 1);
        pv.local.align_channels();
        pv.bump_motion_stamp();
        let mut cl = CellList::new(1.0, Vec3::splat(4.0), true).unwrap();
        cl.build(&mut pv).unwrap();

        let dens = PairwiseDensity::new("density", 1.0);
        let mut out = OutputSet::new();
        out.insert(
            channel_names::DENSITIES.to_string(),
            ChannelData::Float(vec![0.0; 2]),
        );
        let side = SideView {
            positions: &pv.local.positions,
            velocities: &pv.local.velocities,
            ids: &pv.local.ids,
            mass: pv.mass,
            densities: None,
        };
        dens.execute(PairPass {
            state: &state,
            kind: PassKind::LocalSelf,
            dst: side,
            src: side,
            grid: GridView {
                info: cl.info,
                starts: &cl.cell_starts,
                sizes: &cl.cell_sizes,
            },
            out: &mut out,
            halo_out: None,
        })
        .unwrap();

        let d = out.floats_mut(channel_names::DENSITIES).unwrap();
        assert!(d[0] > 0.0);
        assert_eq!(d[0], d[1]);
        // mass-weighted: w(0.4) * mass
        let expected = 2.0 * 15.0 / (2.0 * PI) * (1.0f32 - 0.4).powi(2);
        assert!((d[0] - expected).abs() < 1e-4);
    }
}
