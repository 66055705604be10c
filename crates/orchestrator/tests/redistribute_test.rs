//! Redistribution across a two-rank world: particles shifted by one whole
//! subdomain all change owner, none are lost or invented.

use std::thread;

use glam::{IVec3, Vec3};
use kernel::ic::UniformIc;
use kernel::integrators::Translate;
use kernel::particles::ParticleVector;
use orchestrator::comm::CartComm;
use orchestrator::{CommWorld, Simulation, SimulationConfig};

struct RankOutcome {
    initial_ids: Vec<u64>,
    final_ids: Vec<u64>,
    all_resident: bool,
}

fn run_rank(comm: CartComm, populated: bool) -> RankOutcome {
    let config = SimulationConfig::new("shift", [2, 1, 1], [16.0, 8.0, 8.0], 1.0);
    let mut sim = Simulation::new(comm, None, config).unwrap();

    let ic: Option<Box<dyn kernel::ic::InitialConditions>> = if populated {
        Some(Box::new(UniformIc::new(1.0)))
    } else {
        None
    };
    sim.register_particle_vector(ParticleVector::new("solvent", 1.0), ic, 0)
        .unwrap();
    // one step of dt = 1 at v = +local_size.x moves every particle one
    // subdomain to the right
    sim.register_integrator(Box::new(Translate::new("conveyor", Vec3::new(8.0, 0.0, 0.0))))
        .unwrap();
    sim.set_integrator("conveyor", "solvent").unwrap();

    let initial_ids = {
        let mut ids = sim.particle_vector("solvent").unwrap().local.ids.clone();
        ids.sort_unstable();
        ids
    };

    sim.run(1).unwrap();

    let pv = sim.particle_vector("solvent").unwrap();
    let mut final_ids = pv.local.ids.clone();
    final_ids.sort_unstable();
    let all_resident = pv
        .local
        .positions
        .iter()
        .all(|&x| sim.state().domain.contains_local(x));
    RankOutcome {
        initial_ids,
        final_ids,
        all_resident,
    }
}

#[test]
fn shifted_particles_change_owner_and_are_conserved() {
    let mut world = CommWorld::build(IVec3::new(2, 1, 1));
    let comm1 = world.pop().unwrap();
    let comm0 = world.pop().unwrap();

    let h0 = thread::spawn(move || run_rank(comm0, true));
    let h1 = thread::spawn(move || run_rank(comm1, false));
    let r0 = h0.join().expect("rank 0 panicked");
    let r1 = h1.join().expect("rank 1 panicked");

    assert!(!r0.initial_ids.is_empty());
    assert!(r1.initial_ids.is_empty());

    // every particle of rank 0 is now resident on rank 1, rank 0 is empty
    assert!(r0.final_ids.is_empty(), "rank 0 still holds {} particles", r0.final_ids.len());
    assert_eq!(r1.final_ids, r0.initial_ids);
    assert!(r1.all_resident);
}
