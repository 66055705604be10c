//! Checkpoint round-trip: running 10 + 10 steps through a checkpoint equals
//! running 20 steps straight, bit for bit.

use std::path::PathBuf;

use glam::IVec3;
use kernel::ic::UniformIc;
use kernel::integrators::VelocityVerlet;
use kernel::interactions::PairwiseDpd;
use kernel::particles::ParticleVector;
use orchestrator::{CommWorld, Simulation, SimulationConfig};

fn build_sim(folder: &PathBuf) -> Simulation {
    let mut world = CommWorld::build(IVec3::ONE);
    let comm = world.remove(0);
    let mut config = SimulationConfig::new("roundtrip", [1, 1, 1], [4.0, 4.0, 4.0], 0.01);
    config.checkpoint_folder = folder.display().to_string();
    Simulation::new(comm, None, config).unwrap()
}

fn register_components(sim: &mut Simulation, with_ic: bool) {
    let ic: Option<Box<dyn kernel::ic::InitialConditions>> = if with_ic {
        Some(Box::new(UniformIc::new(4.0)))
    } else {
        None
    };
    sim.register_particle_vector(ParticleVector::new("solvent", 1.0), ic, 0)
        .unwrap();
    sim.register_interaction(Box::new(PairwiseDpd::new("dpd", 1.0, 25.0, 4.5, 1.0, 0.5)))
        .unwrap();
    sim.register_integrator(Box::new(VelocityVerlet::new("vv"))).unwrap();
    sim.set_interaction("dpd", "solvent", "solvent").unwrap();
    sim.set_integrator("vv", "solvent").unwrap();
}

#[test]
fn checkpoint_then_restart_matches_a_straight_run() {
    let folder = std::env::temp_dir().join(format!("roundtrip_{}", std::process::id()));
    std::fs::remove_dir_all(&folder).ok();

    // run A: 10 steps, checkpoint
    let mut a = build_sim(&folder);
    register_components(&mut a, true);
    a.run(10).unwrap();
    a.checkpoint().unwrap();
    assert_eq!(a.state().current_step, 10);

    // run B: fresh driver restarted from the folder, 10 more steps
    let mut b = build_sim(&folder);
    b.restart(&folder).unwrap();
    register_components(&mut b, false);
    assert_eq!(b.state().current_step, 10);
    assert_eq!(b.state().current_time, a.state().current_time);
    b.run(10).unwrap();

    // run C: 20 steps straight
    let mut c = build_sim(&folder);
    register_components(&mut c, true);
    c.run(20).unwrap();

    let pv_b = b.particle_vector("solvent").unwrap();
    let pv_c = c.particle_vector("solvent").unwrap();
    assert_eq!(pv_b.local.len(), pv_c.local.len());
    assert_eq!(pv_b.local.ids, pv_c.local.ids);
    assert_eq!(pv_b.local.positions, pv_c.local.positions);
    assert_eq!(pv_b.local.velocities, pv_c.local.velocities);
    assert_eq!(b.state().current_step, c.state().current_step);
    assert_eq!(b.state().current_time, c.state().current_time);

    std::fs::remove_dir_all(&folder).ok();
}
