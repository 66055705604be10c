//! Classical dissipative-particle-dynamics pair force.

use glam::Vec3;

use crate::channels::channel_names::{FORCES, STRESSES};
use crate::channels::DataKind;
use crate::error::Result;

use super::rng;
use super::{exec, Interaction, InteractionChannel, InteractionStage, PairPass};

/// DPD force: conservative + dissipative + random, all with the standard
/// `(1 - r/rc)` envelope raised to `power` for the weight function.
pub struct PairwiseDpd {
    name: String,
    rc: f32,
    /// Conservative repulsion amplitude.
    pub a: f32,
    /// Dissipation coefficient.
    pub gamma: f32,
    /// Thermostat target temperature (in energy units).
    pub kbt: f32,
    /// Envelope exponent of the random/dissipative weight.
    pub power: f32,
    stress_every: Option<u64>,
}

impl PairwiseDpd {
    /// Plain DPD without stress output.
    pub fn new(name: &str, rc: f32, a: f32, gamma: f32, kbt: f32, power: f32) -> Self {
        Self {
            name: name.to_string(),
            rc,
            a,
            gamma,
            kbt,
            power,
            stress_every: None,
        }
    }

    /// Also write per-particle virial stress every `every` steps.
    pub fn with_stress(mut self, every: u64) -> Self {
        self.stress_every = Some(every);
        self
    }
}

impl Interaction for PairwiseDpd {
    fn name(&self) -> &str {
        &self.name
    }

    fn rc(&self) -> f32 {
        self.rc
    }

    fn stage(&self) -> InteractionStage {
        InteractionStage::Final
    }

    fn output_channels(&self) -> Vec<InteractionChannel> {
        let mut out = vec![InteractionChannel::always(FORCES, DataKind::Float3)];
        if let Some(every) = self.stress_every {
            out.push(InteractionChannel::every(STRESSES, DataKind::Stress, every));
        }
        out
    }

    fn execute(&self, pass: PairPass<'_>) -> Result<()> {
        let dt = pass.state.dt;
        let sigma = (2.0 * self.gamma * self.kbt / dt).sqrt();
        let seed = rng::step_seed(pass.state.current_step);
        let (rc, a, gamma, power) = (self.rc, self.a, self.gamma, self.power);

        exec::run_force(pass, rc, move |dst, src| {
            let dr = dst.position - src.position;
            let rij = dr.length();
            let argwr = 1.0 - rij / rc;
            let wr = argwr.powf(power);

            let dr_r = dr / rij;
            let du = dst.velocity - src.velocity;
            let rdotv = dr_r.dot(du);
            let xi = rng::mean0var1(seed, dst.id, src.id);

            let strength = a * argwr - (gamma * wr * rdotv + sigma * xi) * wr;
            dr_r * strength
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
    use glam::IVec3;

    fn two_body_forces(p0: Vec3, p1: Vec3) -> Vec<Vec3> {
        let domain = DomainInfo::new(Vec3::splat(4.0), IVec3::ZERO, IVec3::ONE);
        let state = SimulationState::new(0.01, domain);
        let mut pv = ParticleVector::new("solvent", 1.0);
        pv.local.push(p0, Vec3::new(0.3, 0.0, 0.0), 0);
        pv.local.push(p1, Vec3::new(-0.1, 0.2, 0.0), 1);
        pv.local.align_channels();
        pv.bump_motion_stamp();
        let mut cl = CellList::new(1.0, Vec3::splat(4.0), true).unwrap();
        cl.build(&mut pv).unwrap();

        let dpd = PairwiseDpd::new("dpd", 1.0, 25.0, 4.5, 1.0, 0.5);
        let mut out = OutputSet::new();
        out.insert(
            channel_names::FORCES.to_string(),
            ChannelData::Float3(vec![Vec3::ZERO; 2]),
        );
        let side = SideView {
            positions: &pv.local.positions,
            velocities: &pv.local.velocities,
            ids: &pv.local.ids,
            mass: 1.0,
            densities: None,
        };
        let pass = PairPass {
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
        };
        dpd.execute(pass).unwrap();
        out.float3s_mut(channel_names::FORCES).unwrap().to_vec()
    }

    #[test]
    fn pair_force_is_antisymmetric() {
        let f = two_body_forces(Vec3::new(-0.2, 0.0, 0.0), Vec3::new(0.3, 0.1, 0.0));
        assert!((f[0] + f[1]).length() < 1e-5, "net force {:?}", f[0] + f[1]);
        assert!(f[0].length() > 0.0);
    }

    #[test]
    fn out_of_range_pair_is_silent() {
        let f = two_body_forces(Vec3::new(-1.2, 0.0, 0.0), Vec3::new(1.2, 0.0, 0.0));
        assert_eq!(f[0], Vec3::ZERO);
        assert_eq!(f[1], Vec3::ZERO);
    }
}
