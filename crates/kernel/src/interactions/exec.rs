//! Pass runners folding a per-pair closure over a [`PairPass`].
//!
//! Local passes iterate dst particles in parallel; each particle sums over
//! its neighbor candidates and writes only its own output slot, so the loop
//! is race-free. Halo passes scatter into dst slots and therefore run
//! serially (halo work is boundary-proportional).

use glam::Vec3;
use rayon::prelude::*;

use crate::channels::channel_names::FORCES;
use crate::channels::Stress;
use crate::error::{Result, SimulationError};

use super::{PairPass, PairParticle, PassKind};

#[inline]
fn pair_stress(dr: Vec3, f: Vec3) -> Stress {
    Stress {
        xx: 0.5 * dr.x * f.x,
        xy: 0.5 * dr.x * f.y,
        xz: 0.5 * dr.x * f.z,
        yy: 0.5 * dr.y * f.y,
        yz: 0.5 * dr.y * f.z,
        zz: 0.5 * dr.z * f.z,
    }
}

/// Fold a force closure (`f(dst, src)` = force on dst) over the pass,
/// accumulating into the `forces` buffer and, when present, per-particle
/// virial into `stresses`.
pub fn run_force<F>(pass: PairPass<'_>, rc: f32, f: F) -> Result<()>
where
    F: Fn(&PairParticle, &PairParticle) -> Vec3 + Sync,
{
    let PairPass {
        kind,
        dst,
        src,
        grid,
        out,
        halo_out,
        ..
    } = pass;
    let rc2 = rc * rc;
    let (forces, stresses) = out.force_and_stress();
    let forces = forces.ok_or_else(|| {
        SimulationError::Invariant("force pass without a 'forces' output buffer".into())
    })?;

    match kind {
        PassKind::LocalSelf | PassKind::LocalCross => {
            let exclude_self = kind == PassKind::LocalSelf;
            if let Some(stresses) = stresses {
                // stride-activated stress steps also want the virial; keep
                // this path serial, it runs rarely
                for i in 0..dst.len() {
                    let pi = dst.fetch(i);
                    let mut facc = Vec3::ZERO;
                    let mut sacc = Stress::default();
                    grid.for_each_candidate(pi.position, |j| {
                        if exclude_self && j == i {
                            return;
                        }
                        let pj = src.fetch(j);
                        let dr = pi.position - pj.position;
                        let r2 = dr.length_squared();
                        if r2 > rc2 || r2 == 0.0 {
                            return;
                        }
                        let fij = f(&pi, &pj);
                        facc += fij;
                        sacc += pair_stress(dr, fij);
                    });
                    forces[i] += facc;
                    stresses[i] += sacc;
                }
            } else {
                forces.par_iter_mut().enumerate().for_each(|(i, slot)| {
                    let pi = dst.fetch(i);
                    let mut acc = Vec3::ZERO;
                    grid.for_each_candidate(pi.position, |j| {
                        if exclude_self && j == i {
                            return;
                        }
                        let pj = src.fetch(j);
                        let dr = pi.position - pj.position;
                        let r2 = dr.length_squared();
                        if r2 > rc2 || r2 == 0.0 {
                            return;
                        }
                        acc += f(&pi, &pj);
                    });
                    *slot += acc;
                });
            }
        }
        PassKind::Halo => {
            let mut halo_forces = halo_out.and_then(|h| h.float3s_mut(FORCES));
            for h in 0..src.len() {
                let ph = src.fetch(h);
                let mut back = Vec3::ZERO;
                grid.for_each_candidate(ph.position, |j| {
                    let pj = dst.fetch(j);
                    let dr = pj.position - ph.position;
                    let r2 = dr.length_squared();
                    if r2 > rc2 || r2 == 0.0 {
                        return;
                    }
                    let fj = f(&pj, &ph);
                    forces[j] += fj;
                    back += f(&ph, &pj);
                });
                if let Some(hf) = halo_forces.as_deref_mut() {
                    hf[h] += back;
                }
            }
        }
    }
    Ok(())
}

/// Fold a scalar closure over the pass, accumulating into `channel`.
pub fn run_scalar<F>(pass: PairPass<'_>, rc: f32, channel: &str, f: F) -> Result<()>
where
    F: Fn(&PairParticle, &PairParticle) -> f32 + Sync,
{
    let PairPass {
        kind,
        dst,
        src,
        grid,
        out,
        halo_out,
        ..
    } = pass;
    let rc2 = rc * rc;
    let values = out.floats_mut(channel).ok_or_else(|| {
        SimulationError::Invariant(format!("scalar pass without a '{channel}' output buffer"))
    })?;

    match kind {
        PassKind::LocalSelf | PassKind::LocalCross => {
            let exclude_self = kind == PassKind::LocalSelf;
            values.par_iter_mut().enumerate().for_each(|(i, slot)| {
                let pi = dst.fetch(i);
                let mut acc = 0.0f32;
                grid.for_each_candidate(pi.position, |j| {
                    if exclude_self && j == i {
                        return;
                    }
                    let pj = src.fetch(j);
                    let r2 = (pi.position - pj.position).length_squared();
                    if r2 > rc2 || r2 == 0.0 {
                        return;
                    }
                    acc += f(&pi, &pj);
                });
                *slot += acc;
            });
        }
        PassKind::Halo => {
            let mut halo_values = halo_out.and_then(|h| h.floats_mut(channel));
            for h in 0..src.len() {
                let ph = src.fetch(h);
                let mut back = 0.0f32;
                grid.for_each_candidate(ph.position, |j| {
                    let pj = dst.fetch(j);
                    let r2 = (pj.position - ph.position).length_squared();
                    if r2 > rc2 || r2 == 0.0 {
                        return;
                    }
                    values[j] += f(&pj, &ph);
                    back += f(&ph, &pj);
                });
                if let Some(hv) = halo_values.as_deref_mut() {
                    hv[h] += back;
                }
            }
        }
    }
    Ok(())
}
