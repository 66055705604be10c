//! Intermediate-then-final pipeline: the density field must be accumulated
//! and gathered into the consumer's cell list before any final kernel runs.
//! A probing final interaction records what it actually saw.

use std::sync::{Arc, Mutex};

use glam::{IVec3, Vec3};
use kernel::channels::channel_names::{DENSITIES, FORCES};
use kernel::channels::DataKind;
use kernel::error::Result;
use kernel::interactions::{
    Interaction, InteractionChannel, InteractionStage, PairPass, PairwiseDensity,
};
use kernel::particles::ParticleVector;
use orchestrator::{CommWorld, Simulation, SimulationConfig};

/// Final-stage interaction that records the density values visible on its
/// destination view at execution time.
struct DensityProbe {
    name: String,
    rc: f32,
    seen: Arc<Mutex<Vec<f32>>>,
}

impl Interaction for DensityProbe {
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
        let densities = pass.dst.densities.expect("probe declared the input");
        self.seen.lock().unwrap().extend_from_slice(densities);
        Ok(())
    }
}

#[test]
fn density_is_gathered_before_the_final_stage_runs() {
    let mut world = CommWorld::build(IVec3::ONE);
    let comm = world.remove(0);
    let config = SimulationConfig::new("pipeline", [1, 1, 1], [8.0, 8.0, 8.0], 0.01);
    let mut sim = Simulation::new(comm, None, config).unwrap();

    let mut pv = ParticleVector::new("solvent", 1.0);
    pv.local.push(Vec3::new(-0.15, 0.0, 0.0), Vec3::ZERO, 0);
    pv.local.push(Vec3::new(0.15, 0.0, 0.0), Vec3::ZERO, 1);
    pv.local.align_channels();
    sim.register_particle_vector(pv, None, 0).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    sim.register_interaction(Box::new(PairwiseDensity::new("density", 1.0)))
        .unwrap();
    sim.register_interaction(Box::new(DensityProbe {
        name: "probe".to_string(),
        rc: 0.8,
        seen: Arc::clone(&seen),
    }))
    .unwrap();
    sim.set_interaction("density", "solvent", "solvent").unwrap();
    sim.set_interaction("probe", "solvent", "solvent").unwrap();

    sim.run(1).unwrap();

    // two cutoffs -> the probe runs on the smaller, secondary cell list, so
    // nonzero values prove accumulate + gather happened first
    assert_eq!(sim.cell_list_cutoffs("solvent").unwrap(), vec![1.0, 0.8]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2, "probe ran once over both particles");
    for &d in seen.iter() {
        assert!(d > 0.0, "density was not gathered before the final stage");
    }
}

#[test]
fn overlapping_writers_on_one_pair_are_rejected() {
    let mut world = CommWorld::build(IVec3::ONE);
    let comm = world.remove(0);
    let config = SimulationConfig::new("dup", [1, 1, 1], [8.0, 8.0, 8.0], 0.01);
    let mut sim = Simulation::new(comm, None, config).unwrap();

    let mut pv = ParticleVector::new("solvent", 1.0);
    pv.local.push(Vec3::ZERO, Vec3::ZERO, 0);
    pv.local.align_channels();
    sim.register_particle_vector(pv, None, 0).unwrap();

    sim.register_interaction(Box::new(kernel::interactions::PairwiseDpd::new(
        "dpd_a", 1.0, 25.0, 4.5, 1.0, 1.0,
    )))
    .unwrap();
    sim.register_interaction(Box::new(kernel::interactions::PairwiseDpd::new(
        "dpd_b", 1.0, 25.0, 4.5, 1.0, 1.0,
    )))
    .unwrap();
    sim.set_interaction("dpd_a", "solvent", "solvent").unwrap();
    sim.set_interaction("dpd_b", "solvent", "solvent").unwrap();

    let err = sim.run(1).unwrap_err();
    assert!(err.to_string().contains("both write channel"), "{err}");
}
