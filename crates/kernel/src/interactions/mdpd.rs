//! Many-body DPD pair force (final stage, consumes `densities`).

use crate::channels::channel_names::{DENSITIES, FORCES};
use crate::channels::DataKind;
use crate::error::Result;

use super::rng;
use super::{exec, Interaction, InteractionChannel, InteractionStage, PairPass};

/// Many-body DPD: the conservative part gains a density-dependent repulsion
/// with its own (shorter) range `rd`, so the equation of state supports
/// liquid-vapour coexistence. Dissipative and random parts are plain DPD.
pub struct PairwiseMdpd {
    name: String,
    rc: f32,
    /// Density-repulsion range (`rd < rc`).
    pub rd: f32,
    /// Attractive amplitude (usually negative).
    pub a: f32,
    /// Density-repulsion amplitude.
    pub b: f32,
    /// Dissipation coefficient.
    pub gamma: f32,
    /// Thermostat target temperature.
    pub kbt: f32,
    /// Envelope exponent of the random/dissipative weight.
    pub power: f32,
}

impl PairwiseMdpd {
    /// Many-body DPD with the given parameter set.
    #[allow(clippy::too_many_arguments)]
    pub fn new(name: &str, rc: f32, rd: f32, a: f32, b: f32, gamma: f32, kbt: f32, power: f32) -> Self {
        Self {
            name: name.to_string(),
            rc,
            rd,
            a,
            b,
            gamma,
            kbt,
            power,
        }
    }
}

impl Interaction for PairwiseMdpd {
    fn name(&self) -> &str {
        &self.name
    }

    fn rc(&self) -> f32 {
        self.rc
    }

    fn stage(&self) -> InteractionStage {
        InteractionStage::Final
    }

    fn input_channels(&self) -> Vec<InteractionChannel> {
        vec![InteractionChannel::always(DENSITIES, DataKind::Float)]
    }

    fn output_channels(&self) -> Vec<InteractionChannel> {
        vec![InteractionChannel::always(FORCES, DataKind::Float3)]
    }

    fn execute(&self, pass: PairPass<'_>) -> Result<()> {
        let dt = pass.state.dt;
        let sigma = (2.0 * self.gamma * self.kbt / dt).sqrt();
        let seed = rng::step_seed(pass.state.current_step);
        let (rc, rd, a, b, gamma, power) = (self.rc, self.rd, self.a, self.b, self.gamma, self.power);

        exec::run_force(pass, rc, move |dst, src| {
            let dr = dst.position - src.position;
            let rij = dr.length();
            let argwr = 1.0 - rij / rc;
            let argwd = (1.0 - rij / rd).max(0.0);
            let wr = argwr.powf(power);

            let dr_r = dr / rij;
            let du = dst.velocity - src.velocity;
            let rdotv = dr_r.dot(du);
            let xi = rng::mean0var1(seed, dst.id, src.id);

            let strength = a * argwr + b * argwd * (src.density + dst.density)
                - (gamma * wr * rdotv + sigma * xi) * wr;
            dr_r * strength
        })
    }
}
