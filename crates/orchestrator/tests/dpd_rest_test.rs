//! DPD fluid at rest: the thermostat drives the lattice start towards the
//! target temperature while total momentum stays at zero.

use glam::IVec3;
use kernel::ic::UniformIc;
use kernel::integrators::VelocityVerlet;
use kernel::interactions::PairwiseDpd;
use kernel::particles::ParticleVector;
use orchestrator::{CommWorld, Simulation, SimulationConfig};

const KBT: f32 = 1.0;

fn temperature(sim: &Simulation, name: &str) -> f64 {
    let pv = sim.particle_vector(name).unwrap();
    let m = pv.mass as f64;
    let n = pv.local.len();
    let twice_kinetic: f64 = pv
        .local
        .velocities
        .iter()
        .map(|v| m * v.length_squared() as f64)
        .sum();
    twice_kinetic / (3.0 * n as f64)
}

#[test]
fn dpd_rest_conserves_momentum_and_thermalizes() {
    let mut world = CommWorld::build(IVec3::ONE);
    let comm = world.remove(0);
    let config = SimulationConfig::new("rest", [1, 1, 1], [6.0, 6.0, 6.0], 0.01);
    let mut sim = Simulation::new(comm, None, config).unwrap();

    sim.register_particle_vector(
        ParticleVector::new("solvent", 1.0),
        Some(Box::new(UniformIc::new(4.0))),
        0,
    )
    .unwrap();
    sim.register_interaction(Box::new(PairwiseDpd::new("dpd", 1.0, 25.0, 4.5, KBT, 0.5)))
        .unwrap();
    sim.register_integrator(Box::new(VelocityVerlet::new("vv"))).unwrap();
    sim.set_interaction("dpd", "solvent", "solvent").unwrap();
    sim.set_integrator("vv", "solvent").unwrap();

    // let the thermostat equilibrate, then average the estimator a little
    sim.run(200).unwrap();
    let mut t_avg = 0.0;
    for _ in 0..4 {
        sim.run(25).unwrap();
        t_avg += temperature(&sim, "solvent");
    }
    t_avg /= 4.0;

    let pv = sim.particle_vector("solvent").unwrap();
    let n = pv.local.len();
    assert!(n > 500, "lattice fill produced {n} particles");

    // momentum per particle stays at numerical zero
    let mut momentum = glam::Vec3::ZERO;
    for &v in &pv.local.velocities {
        momentum += v * pv.mass;
    }
    assert!(
        momentum.length() / (n as f32) < 1e-3,
        "net momentum per particle {}",
        momentum.length() / n as f32
    );

    // kinetic temperature within 5% of the thermostat target
    assert!(
        (t_avg - KBT as f64).abs() / (KBT as f64) < 0.05,
        "temperature {t_avg} vs target {KBT}"
    );

    // particle count untouched by 300 steps of halo exchange + redistribution
    assert_eq!(pv.local.len(), n);
}
