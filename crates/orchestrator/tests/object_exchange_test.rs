//! Objects cross subdomain boundaries atomically: redistribution moves every
//! particle of an object together (here onto the periodic image of the same
//! single rank).

use glam::{IVec3, Vec3};
use kernel::particles::ParticleVector;
use orchestrator::{CommWorld, Simulation, SimulationConfig};

const OBJ_SIZE: usize = 4;

fn push_object(ov: &mut ParticleVector, center: Vec3, first_id: u64) {
    let offsets = [
        Vec3::new(0.2, 0.0, 0.0),
        Vec3::new(-0.2, 0.0, 0.0),
        Vec3::new(0.0, 0.2, 0.0),
        Vec3::new(0.0, 0.0, 0.2),
    ];
    for (k, off) in offsets.iter().enumerate() {
        ov.local.push(center + *off, Vec3::ZERO, first_id + k as u64);
    }
}

#[test]
fn object_redistribution_keeps_objects_whole() {
    let mut world = CommWorld::build(IVec3::ONE);
    let comm = world.remove(0);
    let config = SimulationConfig::new("vesicles", [1, 1, 1], [8.0, 8.0, 8.0], 0.1);
    let mut sim = Simulation::new(comm, None, config).unwrap();

    let mut ov = ParticleVector::new_object("cells", 1.0, OBJ_SIZE, None).unwrap();
    push_object(&mut ov, Vec3::new(0.0, 0.0, 0.0), 0);
    // this one has drifted past the +x face: its center of mass is outside
    push_object(&mut ov, Vec3::new(4.3, 0.0, 0.0), 10);
    push_object(&mut ov, Vec3::new(-2.0, 1.0, 1.0), 20);
    ov.local.align_channels();
    sim.register_particle_vector(ov, None, 0).unwrap();

    sim.run(1).unwrap();

    let pv = sim.particle_vector("cells").unwrap();
    assert_eq!(pv.local.len(), 3 * OBJ_SIZE);
    assert_eq!(pv.local_object_count().unwrap(), 3);

    // nothing lost
    let mut ids = pv.local.ids.clone();
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3, 10, 11, 12, 13, 20, 21, 22, 23]);

    // survivors are compacted in registration order, the arrival is appended
    let com_of = |o: usize| -> Vec3 {
        pv.local.positions[o * OBJ_SIZE..(o + 1) * OBJ_SIZE]
            .iter()
            .copied()
            .sum::<Vec3>()
            / OBJ_SIZE as f32
    };
    assert_eq!(&pv.local.ids[0..OBJ_SIZE], &[0, 1, 2, 3]);
    assert!(com_of(0).distance(Vec3::ZERO) < 1e-4);
    assert_eq!(&pv.local.ids[OBJ_SIZE..2 * OBJ_SIZE], &[20, 21, 22, 23]);
    assert!(com_of(1).distance(Vec3::new(-2.0, 1.0, 1.0)) < 1e-4);

    // the crossing object arrived whole, wrapped onto the periodic image
    assert_eq!(&pv.local.ids[2 * OBJ_SIZE..3 * OBJ_SIZE], &[10, 11, 12, 13]);
    assert!(
        (com_of(2).x - (4.3 - 8.0)).abs() < 1e-4,
        "unexpected wrapped com {:?}",
        com_of(2)
    );
}

#[test]
fn halo_objects_are_never_partial() {
    let mut world = CommWorld::build(IVec3::ONE);
    let comm = world.remove(0);
    let config = SimulationConfig::new("halo", [1, 1, 1], [8.0, 8.0, 8.0], 0.1);
    let mut sim = Simulation::new(comm, None, config).unwrap();

    let mut ov = ParticleVector::new_object("cells", 1.0, OBJ_SIZE, None).unwrap();
    // near the +x face: bounding box within the default cutoff of the border
    push_object(&mut ov, Vec3::new(3.5, 0.0, 0.0), 0);
    // interior: not exchanged
    push_object(&mut ov, Vec3::new(0.0, 0.0, 0.0), 10);
    ov.local.align_channels();
    sim.register_particle_vector(ov, None, 0).unwrap();

    sim.run(1).unwrap();

    let pv = sim.particle_vector("cells").unwrap();
    // whole multiples of the object size only
    assert_eq!(pv.halo.len() % OBJ_SIZE, 0);
    assert!(pv.halo.len() > 0, "boundary object should appear in the halo");
    // the interior object sent no ghosts
    assert!(!pv.halo.ids.contains(&10));
}
