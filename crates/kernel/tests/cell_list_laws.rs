//! Structural laws of the cell-list family.

use glam::Vec3;
use kernel::celllist::CellList;
use kernel::channels::{DataKind, Persistence};
use kernel::particles::ParticleVector;

fn scattered_pv(n: usize, l: f32) -> ParticleVector {
    let mut pv = ParticleVector::new("solvent", 1.0);
    // deterministic but unordered positions
    let mut x = 0.37_f32;
    for i in 0..n {
        let mut coords = [0.0f32; 3];
        for c in &mut coords {
            x = (x * 16807.0).fract();
            *c = (x - 0.5) * l;
        }
        pv.local.push(Vec3::from_array(coords), Vec3::ZERO, i as u64);
    }
    pv.local.align_channels();
    pv.bump_motion_stamp();
    pv
}

#[test]
fn sorted_positions_lie_inside_their_cell_range() {
    let l = 6.0;
    let mut pv = scattered_pv(500, l * 0.98);
    let mut cl = CellList::new(1.0, Vec3::splat(l), false).unwrap();
    cl.build(&mut pv).unwrap();

    for i in 0..pv.local.len() {
        let c = cl.info.cell_id_clamped(pv.local.positions[i]);
        let pos = cl.order[i];
        assert!(cl.cell_starts[c] <= pos && pos < cl.cell_starts[c + 1]);
    }

    // sizes are consistent with starts
    for c in 0..cl.info.total_cells {
        assert_eq!(cl.cell_starts[c] + cl.cell_sizes[c], cl.cell_starts[c + 1]);
    }
}

#[test]
fn accumulate_then_gather_reproduces_vector_channels() {
    let l = 4.0;
    let mut pv = scattered_pv(200, l * 0.98);
    pv.local
        .channels
        .create_channel("densities", DataKind::Float, Persistence::Transient, pv.local.len())
        .unwrap();

    let mut cl = CellList::new(1.0, Vec3::splat(l), false).unwrap();
    cl.require_channel("densities", DataKind::Float).unwrap();
    cl.build(&mut pv).unwrap();

    // pretend an interaction wrote per-particle values in cell order
    {
        let d = cl.channels.floats_mut("densities").unwrap();
        for (slot, v) in d.iter_mut().enumerate() {
            *v = slot as f32 + 1.0;
        }
    }
    let names = vec!["densities".to_string()];
    cl.accumulate_channels(&names, &mut pv).unwrap();
    cl.gather_channels(&names, &pv).unwrap();

    // the gathered copy equals the vector's channel in reordered indexing
    let pv_values = pv.local.channels.floats("densities").unwrap();
    let cl_values = cl.channels.floats("densities").unwrap();
    for i in 0..pv.local.len() {
        assert_eq!(cl_values[cl.order[i] as usize], pv_values[i]);
    }
}
