//! Bounce-back through the full step pipeline: a particle drifting into an
//! object is reflected, and the object receives the reaction momentum.

use glam::{IVec3, Vec3};
use kernel::bouncers::BounceFromSphere;
use kernel::channels::channel_names::FORCES;
use kernel::integrators::VelocityVerlet;
use kernel::particles::ParticleVector;
use kernel::walls::PlaneWall;
use orchestrator::{CommWorld, Simulation, SimulationConfig};

#[test]
fn bounced_particle_reflects_and_object_takes_the_impulse() {
    let mut world = CommWorld::build(IVec3::ONE);
    let comm = world.remove(0);
    let config = SimulationConfig::new("bounce", [1, 1, 1], [8.0, 8.0, 8.0], 0.2);
    let mut sim = Simulation::new(comm, None, config).unwrap();

    let mut ov = ParticleVector::new_object("cells", 1.0, 2, None).unwrap();
    ov.local.push(Vec3::new(-0.3, 0.0, 0.0), Vec3::ZERO, 100);
    ov.local.push(Vec3::new(0.3, 0.0, 0.0), Vec3::ZERO, 101);
    ov.local.align_channels();
    sim.register_particle_vector(ov, None, 0).unwrap();

    let mut pv = ParticleVector::new("solvent", 1.0);
    pv.local.push(Vec3::new(0.6, 0.0, 0.0), Vec3::new(-1.0, 0.0, 0.0), 0);
    pv.local.align_channels();
    sim.register_particle_vector(pv, None, 0).unwrap();

    sim.register_integrator(Box::new(VelocityVerlet::new("vv"))).unwrap();
    sim.set_integrator("vv", "solvent").unwrap();
    sim.register_bouncer(Box::new(BounceFromSphere::new("sphere", 0.5))).unwrap();
    sim.set_bouncer("sphere", "cells", "solvent").unwrap();

    sim.run(1).unwrap();

    // drift put the particle at x = 0.4, inside the sphere; the bounce puts
    // it back to 0.6 with the radial velocity flipped
    let pv = sim.particle_vector("solvent").unwrap();
    assert!((pv.local.positions[0].x - 0.6).abs() < 1e-5, "{:?}", pv.local.positions[0]);
    assert!((pv.local.velocities[0].x - 1.0).abs() < 1e-5);

    // reaction: dv = +2 at mass 1 over dt 0.2 -> -10 along x, shared by the
    // object's two particles
    let ov = sim.particle_vector("cells").unwrap();
    let f = ov.local.channels.float3s(FORCES).unwrap();
    let total = f[0] + f[1];
    assert!((total.x + 10.0).abs() < 1e-3, "reaction {total:?}");
    assert_eq!(f[0], f[1]);
}

#[test]
fn wall_bounce_keeps_particles_on_the_allowed_side() {
    let mut world = CommWorld::build(IVec3::ONE);
    let comm = world.remove(0);
    let config = SimulationConfig::new("wall", [1, 1, 1], [8.0, 8.0, 8.0], 0.2);
    let mut sim = Simulation::new(comm, None, config).unwrap();

    let mut pv = ParticleVector::new("solvent", 1.0);
    // heading down towards the floor at global y = 2 (local y = -2)
    pv.local.push(Vec3::new(0.0, -1.7, 0.0), Vec3::new(0.0, -2.0, 0.0), 0);
    // this one starts below the floor and is purged at setup
    pv.local.push(Vec3::new(0.0, -3.0, 0.0), Vec3::ZERO, 1);
    pv.local.align_channels();
    sim.register_particle_vector(pv, None, 0).unwrap();
    sim.register_integrator(Box::new(VelocityVerlet::new("vv"))).unwrap();
    sim.set_integrator("vv", "solvent").unwrap();
    sim.register_wall(
        Box::new(PlaneWall::new("floor", Vec3::new(0.0, 2.0, 0.0), Vec3::Y)),
        1,
    )
    .unwrap();
    sim.set_wall_bounce("floor", "solvent").unwrap();

    sim.run(1).unwrap();

    let pv = sim.particle_vector("solvent").unwrap();
    assert_eq!(pv.local.len(), 1, "inner particle was not purged");
    assert_eq!(pv.local.ids, vec![0]);
    // drift to y = -2.1 penetrates by 0.1, reflection puts it at -1.9
    assert!((pv.local.positions[0].y + 1.9).abs() < 1e-5);
    assert!((pv.local.velocities[0].y - 2.0).abs() < 1e-5);
}
