//! Exchange-layer laws on a single rank: the buffer-swap delivery and the
//! halo -> owner reverse reduction of object results.

use std::collections::HashMap;

use glam::{IVec3, Vec3};
use kernel::channels::channel_names::FORCES;
use kernel::particles::ParticleVector;
use kernel::state::{DomainInfo, SimulationState};
use orchestrator::comm::CommWorld;
use orchestrator::exchange::{
    ExchangeEngine, ObjectHaloExchanger, ObjectReverseExchanger, SingleNodeEngine,
};
use orchestrator::world::{CellListStore, World};

#[test]
fn halo_forces_are_reduced_back_to_the_owner() {
    let mut comms = CommWorld::build(IVec3::ONE);
    let mut comm = comms.remove(0);

    let domain = DomainInfo::new(Vec3::splat(8.0), IVec3::ZERO, IVec3::ONE);
    let state = SimulationState::new(0.01, domain);

    // one two-particle object close to the +x face
    let mut ov = ParticleVector::new_object("cells", 1.0, 2, None).unwrap();
    ov.local.push(Vec3::new(3.6, 0.0, 0.0), Vec3::ZERO, 0);
    ov.local.push(Vec3::new(3.8, 0.5, 0.0), Vec3::ZERO, 1);
    ov.local.align_channels();

    let mut pvs = vec![ov];
    let mut cell_lists = CellListStore::default();
    let mut halo_maps = HashMap::new();

    let mut halo = ObjectHaloExchanger::new();
    halo.attach(0, 1.0, Vec::new(), 1);
    let mut halo_engine = SingleNodeEngine::new(Box::new(halo));
    {
        let mut world = World {
            state: &state,
            pvs: &mut pvs,
            cell_lists: &mut cell_lists,
            halo_maps: &mut halo_maps,
        };
        halo_engine.init(&mut comm, &mut world).unwrap();
        halo_engine.finalize(&mut comm, &mut world).unwrap();
    }

    // the object projects onto the +x face (and nothing else)
    assert_eq!(pvs[0].halo.len(), 2);
    assert_eq!(pvs[0].halo.ids, vec![0, 1]);
    // shifted into the neighbour's frame
    assert!((pvs[0].halo.positions[0].x - (3.6 - 8.0)).abs() < 1e-5);

    // a neighbour-side kernel deposits forces on the halo copies
    {
        let f = pvs[0].halo.channels.float3s_mut(FORCES).unwrap();
        f[0] = Vec3::new(1.0, 2.0, 0.0);
        f[1] = Vec3::new(-0.5, 0.0, 0.25);
    }

    let mut reverse = ObjectReverseExchanger::new();
    reverse.attach(0, vec![FORCES.to_string()], 2);
    let mut reverse_engine = SingleNodeEngine::new(Box::new(reverse));
    {
        let mut world = World {
            state: &state,
            pvs: &mut pvs,
            cell_lists: &mut cell_lists,
            halo_maps: &mut halo_maps,
        };
        reverse_engine.init(&mut comm, &mut world).unwrap();
        reverse_engine.finalize(&mut comm, &mut world).unwrap();
    }

    // reverse reduction *adds* into the owner's per-particle forces
    let f = pvs[0].local.channels.float3s(FORCES).unwrap();
    assert!((f[0] - Vec3::new(1.0, 2.0, 0.0)).length() < 1e-6);
    assert!((f[1] - Vec3::new(-0.5, 0.0, 0.25)).length() < 1e-6);
}
