//! Particle-level exchangers: boundary halos and redistribution.

use glam::IVec3;
use kernel::channels::Persistence;
use kernel::error::{Result, SimulationError};

use crate::fragments::{self, BULK_ID};
use crate::world::World;

use super::helper::{ExchangeHelper, PackSpec};
use super::Exchanger;

/// Candidate direction components of one axis given the coordinate's distance
/// to the two faces: 0 always, plus -1/+1 when within `margin` of a face.
#[inline]
fn axis_dirs(x: f32, half: f32, margin: f32) -> [Option<i32>; 3] {
    [
        Some(0),
        (x < -half + margin).then_some(-1),
        (x >= half - margin).then_some(1),
    ]
}

struct HaloItem {
    helper: ExchangeHelper,
    rc: f32,
    extra: Vec<String>,
    spec: Option<PackSpec>,
    /// (particle index, fragment) pairs computed by `prepare_sizes`.
    plan: Vec<(u32, u8)>,
}

/// Copies every local particle within `rc` of a subdomain face into the
/// fragment(s) it projects onto (up to seven near a corner). Positions are
/// shifted so the receiver sees them in its own local frame; the receiver's
/// halo partition is rebuilt wholesale.
#[derive(Default)]
pub struct ParticleHaloExchanger {
    items: Vec<HaloItem>,
}

impl ParticleHaloExchanger {
    /// Empty exchanger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a particle vector with a halo thickness and the extra channels
    /// to ship along.
    pub fn attach(&mut self, pv: usize, rc: f32, extra: Vec<String>, tag_base: u64) {
        self.items.push(HaloItem {
            helper: ExchangeHelper::new(pv, tag_base),
            rc,
            extra,
            spec: None,
            plan: Vec::new(),
        });
    }
}

impl Exchanger for ParticleHaloExchanger {
    fn label(&self) -> &'static str {
        "particle halo"
    }

    fn count(&self) -> usize {
        self.items.len()
    }

    fn helper(&self, i: usize) -> &ExchangeHelper {
        &self.items[i].helper
    }

    fn helper_mut(&mut self, i: usize) -> &mut ExchangeHelper {
        &mut self.items[i].helper
    }

    fn prepare_sizes(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &world.pvs[item.helper.pv];
        if item.spec.is_none() {
            let spec = PackSpec::with_channels(&pv.local, &item.extra)?;
            item.helper.unit_size = spec.unit_size();
            item.spec = Some(spec);
        }
        let half = 0.5 * world.state.domain.local_size;
        let rc = item.rc;

        item.plan.clear();
        item.helper.clear_send();
        for (idx, &x) in pv.local.positions.iter().enumerate() {
            let xs = axis_dirs(x.x, half.x, rc);
            let ys = axis_dirs(x.y, half.y, rc);
            let zs = axis_dirs(x.z, half.z, rc);
            for dx in xs.into_iter().flatten() {
                for dy in ys.into_iter().flatten() {
                    for dz in zs.into_iter().flatten() {
                        if dx == 0 && dy == 0 && dz == 0 {
                            continue;
                        }
                        let f = fragments::id(IVec3::new(dx, dy, dz));
                        item.plan.push((idx as u32, f as u8));
                        item.helper.send_sizes[f] += 1;
                    }
                }
            }
        }
        item.helper.compute_send_offsets();
        Ok(())
    }

    fn prepare_data(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &world.pvs[item.helper.pv];
        let spec = item.spec.as_ref().expect("sizes prepared first");
        let l = world.state.domain.local_size;

        let mut heads = item.helper.send_offsets;
        for &(idx, f) in &item.plan {
            let f = f as usize;
            let shift = -fragments::dir(f).as_vec3() * l;
            let slot = heads[f];
            heads[f] += 1;
            spec.pack(&pv.local, idx as usize, shift, item.helper.send_entity_mut(slot))?;
        }
        Ok(())
    }

    fn combine_and_upload(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &mut world.pvs[item.helper.pv];
        let spec = item.spec.as_ref().expect("sizes prepared first");

        pv.halo.clear();
        let mut received = 0;
        for f in 0..fragments::NUM_FRAGMENTS {
            received += spec.unpack_append(item.helper.recv_fragment(f), &mut pv.halo)?;
        }
        tracing::trace!(pv = pv.name(), received, "halo rebuilt");
        Ok(())
    }
}

struct RedistItem {
    helper: ExchangeHelper,
    spec: Option<PackSpec>,
    plan: Vec<(u32, u8)>,
    keep: Vec<bool>,
}

/// Moves particles whose position left the subdomain to the owning
/// neighbour; survivors are compacted in place. Only persistent channels
/// travel. A particle can never land in the bulk fragment: leaving means at
/// least one axis is out of range.
#[derive(Default)]
pub struct ParticleRedistributor {
    items: Vec<RedistItem>,
}

impl ParticleRedistributor {
    /// Empty exchanger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a particle vector.
    pub fn attach(&mut self, pv: usize, tag_base: u64) {
        self.items.push(RedistItem {
            helper: ExchangeHelper::new(pv, tag_base),
            spec: None,
            plan: Vec::new(),
            keep: Vec::new(),
        });
    }
}

impl Exchanger for ParticleRedistributor {
    fn label(&self) -> &'static str {
        "particle redistribute"
    }

    fn count(&self) -> usize {
        self.items.len()
    }

    fn helper(&self, i: usize) -> &ExchangeHelper {
        &self.items[i].helper
    }

    fn helper_mut(&mut self, i: usize) -> &mut ExchangeHelper {
        &mut self.items[i].helper
    }

    fn prepare_sizes(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &world.pvs[item.helper.pv];
        if item.spec.is_none() {
            let names = pv.local.channels.names_with_persistence(Persistence::Persistent);
            let spec = PackSpec::with_channels(&pv.local, &names)?;
            item.helper.unit_size = spec.unit_size();
            item.spec = Some(spec);
        }
        let half = 0.5 * world.state.domain.local_size;

        item.plan.clear();
        item.helper.clear_send();
        item.keep.clear();
        item.keep.resize(pv.local.len(), true);
        for (idx, &x) in pv.local.positions.iter().enumerate() {
            let d = IVec3::new(
                leave_dir(x.x, half.x),
                leave_dir(x.y, half.y),
                leave_dir(x.z, half.z),
            );
            if d == IVec3::ZERO {
                continue;
            }
            let f = fragments::id(d);
            if f == BULK_ID {
                return Err(SimulationError::Invariant(format!(
                    "redistribution of '{}' mapped a leaving particle to the bulk fragment",
                    pv.name()
                )));
            }
            item.plan.push((idx as u32, f as u8));
            item.helper.send_sizes[f] += 1;
            item.keep[idx] = false;
        }
        item.helper.compute_send_offsets();
        Ok(())
    }

    fn prepare_data(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &mut world.pvs[item.helper.pv];
        let spec = item.spec.as_ref().expect("sizes prepared first");
        let l = world.state.domain.local_size;

        let mut heads = item.helper.send_offsets;
        for &(idx, f) in &item.plan {
            let f = f as usize;
            let shift = -fragments::dir(f).as_vec3() * l;
            spec.pack(&pv.local, idx as usize, shift, item.helper.send_entity_mut(heads[f]))?;
            heads[f] += 1;
        }
        if !item.plan.is_empty() {
            pv.local.retain_by_mask(&item.keep);
            pv.bump_motion_stamp();
            tracing::debug!(pv = pv.name(), left = item.plan.len(), "particles redistributed away");
        }
        Ok(())
    }

    fn combine_and_upload(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &mut world.pvs[item.helper.pv];
        let spec = item.spec.as_ref().expect("sizes prepared first");

        let mut received = 0;
        for f in 0..fragments::NUM_FRAGMENTS {
            received += spec.unpack_append(item.helper.recv_fragment(f), &mut pv.local)?;
        }
        if received > 0 {
            pv.bump_motion_stamp();
            tracing::debug!(pv = pv.name(), received, "particles redistributed in");
        }
        Ok(())
    }
}

#[inline]
fn leave_dir(x: f32, half: f32) -> i32 {
    if x < -half {
        -1
    } else if x >= half {
        1
    } else {
        0
    }
}
