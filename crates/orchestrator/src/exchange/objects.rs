//! Object-level exchangers.
//!
//! Objects cross subdomain boundaries atomically: halo exchange ships every
//! particle of an object (plus its per-object channels) whenever the object's
//! bounding box touches a boundary region, and redistribution moves whole
//! objects by center of mass. Two follow-on exchangers reuse the fragment
//! assignment of the preceding halo exchange: one forwards extra channels to
//! the halo copies, one reduces per-particle results on halo copies back onto
//! the owner.

use glam::IVec3;
use kernel::channels::{channel_names, entry_size, DataKind, Persistence};
use kernel::error::{Result, SimulationError};

use crate::fragments::{self, BULK_ID, NUM_FRAGMENTS};
use crate::world::World;

use super::helper::{ExchangeHelper, PackSpec};
use super::Exchanger;

fn object_axis_dirs(low: f32, high: f32, half: f32, margin: f32) -> [Option<i32>; 3] {
    [
        Some(0),
        (low < -half + margin).then_some(-1),
        (high >= half - margin).then_some(1),
    ]
}

fn leave_dir(x: f32, half: f32) -> i32 {
    if x < -half {
        -1
    } else if x >= half {
        1
    } else {
        0
    }
}

struct ObjHaloItem {
    helper: ExchangeHelper,
    rc: f32,
    extra_part: Vec<String>,
    part_spec: Option<PackSpec>,
    obj_channels: Vec<(String, DataKind)>,
    plan: Vec<(u32, u8)>,
}

/// Ships whole objects whose bounding box touches a boundary region and
/// records, per fragment, which objects went where.
#[derive(Default)]
pub struct ObjectHaloExchanger {
    items: Vec<ObjHaloItem>,
}

impl ObjectHaloExchanger {
    /// Empty exchanger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an object vector with its halo thickness and extra particle
    /// channels to ship.
    pub fn attach(&mut self, pv: usize, rc: f32, extra_part: Vec<String>, tag_base: u64) {
        self.items.push(ObjHaloItem {
            helper: ExchangeHelper::new(pv, tag_base),
            rc,
            extra_part,
            part_spec: None,
            obj_channels: Vec::new(),
            plan: Vec::new(),
        });
    }
}

impl Exchanger for ObjectHaloExchanger {
    fn label(&self) -> &'static str {
        "object halo"
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
        let pv_idx = item.helper.pv;
        let pv = &mut world.pvs[pv_idx];
        pv.update_com_extents_local()?;
        let info = pv.objects.as_ref().expect("object exchanger on object vector");

        if item.part_spec.is_none() {
            let spec = PackSpec::with_channels(&pv.local, &item.extra_part)?;
            item.obj_channels = info
                .local
                .names()
                .into_iter()
                .map(|n| {
                    let kind = info.local.kind_of(&n).unwrap();
                    (n, kind)
                })
                .collect();
            let obj_bytes: usize = item.obj_channels.iter().map(|(_, k)| entry_size(*k)).sum();
            item.helper.unit_size = info.object_size * spec.unit_size() + obj_bytes;
            item.part_spec = Some(spec);
        }

        let half = 0.5 * world.state.domain.local_size;
        let rc = item.rc;
        let ce = info.local.com_extents(channel_names::COM_EXTENTS)?;

        item.plan.clear();
        item.helper.clear_send();
        for (o, e) in ce.iter().enumerate() {
            let xs = object_axis_dirs(e.low.x, e.high.x, half.x, rc);
            let ys = object_axis_dirs(e.low.y, e.high.y, half.y, rc);
            let zs = object_axis_dirs(e.low.z, e.high.z, half.z, rc);
            for dx in xs.into_iter().flatten() {
                for dy in ys.into_iter().flatten() {
                    for dz in zs.into_iter().flatten() {
                        if dx == 0 && dy == 0 && dz == 0 {
                            continue;
                        }
                        let f = fragments::id(IVec3::new(dx, dy, dz));
                        item.plan.push((o as u32, f as u8));
                        item.helper.send_sizes[f] += 1;
                    }
                }
            }
        }
        item.helper.compute_send_offsets();

        let map = world.halo_maps.entry(pv_idx).or_default();
        for f in 0..NUM_FRAGMENTS {
            map.sent[f].clear();
        }
        for &(o, f) in &item.plan {
            map.sent[f as usize].push(o);
        }
        Ok(())
    }

    fn prepare_data(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &world.pvs[item.helper.pv];
        let info = pv.objects.as_ref().expect("object exchanger on object vector");
        let spec = item.part_spec.as_ref().expect("sizes prepared first");
        let pu = spec.unit_size();
        let size = info.object_size;
        let l = world.state.domain.local_size;

        let mut heads = item.helper.send_offsets;
        for &(o, f) in &item.plan {
            let f = f as usize;
            let o = o as usize;
            let shift = -fragments::dir(f).as_vec3() * l;
            let slot = heads[f];
            heads[f] += 1;
            let out = item.helper.send_entity_mut(slot);
            for k in 0..size {
                spec.pack(&pv.local, o * size + k, shift, &mut out[k * pu..(k + 1) * pu])?;
            }
            let mut cursor = size * pu;
            for (name, kind) in &item.obj_channels {
                let es = entry_size(*kind);
                if *kind == DataKind::ComExtent {
                    let shifted = info.local.com_extents(name)?[o].shifted(shift);
                    out[cursor..cursor + es].copy_from_slice(bytemuck::bytes_of(&shifted));
                } else {
                    let bytes = info.local.data(name)?.bytes();
                    out[cursor..cursor + es].copy_from_slice(&bytes[o * es..(o + 1) * es]);
                }
                cursor += es;
            }
        }
        Ok(())
    }

    fn combine_and_upload(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv_idx = item.helper.pv;
        let pv = &mut world.pvs[pv_idx];
        let spec = item.part_spec.as_ref().expect("sizes prepared first");
        let pu = spec.unit_size();

        pv.halo.clear();
        let info = pv.objects.as_mut().expect("object exchanger on object vector");
        let size = info.object_size;
        for (name, kind) in &item.obj_channels {
            info.halo.create_channel(name, *kind, Persistence::Transient, 0)?;
        }
        info.halo.truncate();

        let map = world.halo_maps.entry(pv_idx).or_default();
        for f in 0..NUM_FRAGMENTS {
            let frag = item.helper.recv_fragment(f);
            let n = frag.len() / item.helper.unit_size.max(1);
            map.received[f] = n as u32;
            for e in 0..n {
                let rec = &frag[e * item.helper.unit_size..(e + 1) * item.helper.unit_size];
                spec.unpack_append(&rec[..size * pu], &mut pv.halo)?;
                let mut cursor = size * pu;
                for (name, kind) in &item.obj_channels {
                    let es = entry_size(*kind);
                    info.halo
                        .data_mut(name)?
                        .push_from_bytes(&rec[cursor..cursor + es]);
                    cursor += es;
                }
            }
        }
        pv.halo.align_channels();
        Ok(())
    }
}

struct ObjRedistItem {
    helper: ExchangeHelper,
    part_spec: Option<PackSpec>,
    obj_channels: Vec<(String, DataKind)>,
    plan: Vec<(u32, u8)>,
    keep_particles: Vec<bool>,
    keep_objects: Vec<bool>,
}

/// Moves whole objects whose center of mass crossed into a neighbour.
#[derive(Default)]
pub struct ObjectRedistributor {
    items: Vec<ObjRedistItem>,
}

impl ObjectRedistributor {
    /// Empty exchanger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an object vector.
    pub fn attach(&mut self, pv: usize, tag_base: u64) {
        self.items.push(ObjRedistItem {
            helper: ExchangeHelper::new(pv, tag_base),
            part_spec: None,
            obj_channels: Vec::new(),
            plan: Vec::new(),
            keep_particles: Vec::new(),
            keep_objects: Vec::new(),
        });
    }
}

impl Exchanger for ObjectRedistributor {
    fn label(&self) -> &'static str {
        "object redistribute"
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
        let pv = &mut world.pvs[item.helper.pv];
        pv.update_com_extents_local()?;
        let info = pv.objects.as_ref().expect("object exchanger on object vector");
        let size = info.object_size;

        if item.part_spec.is_none() {
            let names = pv.local.channels.names_with_persistence(Persistence::Persistent);
            let spec = PackSpec::with_channels(&pv.local, &names)?;
            item.obj_channels = info
                .local
                .names_with_persistence(Persistence::Persistent)
                .into_iter()
                .map(|n| {
                    let kind = info.local.kind_of(&n).unwrap();
                    (n, kind)
                })
                .collect();
            let obj_bytes: usize = item.obj_channels.iter().map(|(_, k)| entry_size(*k)).sum();
            item.helper.unit_size = size * spec.unit_size() + obj_bytes;
            item.part_spec = Some(spec);
        }

        let half = 0.5 * world.state.domain.local_size;
        let ce = info.local.com_extents(channel_names::COM_EXTENTS)?;
        let n_obj = ce.len();

        item.plan.clear();
        item.helper.clear_send();
        item.keep_particles.clear();
        item.keep_particles.resize(pv.local.len(), true);
        item.keep_objects.clear();
        item.keep_objects.resize(n_obj, true);
        for (o, e) in ce.iter().enumerate() {
            let d = IVec3::new(
                leave_dir(e.com.x, half.x),
                leave_dir(e.com.y, half.y),
                leave_dir(e.com.z, half.z),
            );
            if d == IVec3::ZERO {
                continue;
            }
            let f = fragments::id(d);
            if f == BULK_ID {
                return Err(SimulationError::Invariant(format!(
                    "object redistribution of '{}' mapped a leaving object to the bulk fragment",
                    pv.name()
                )));
            }
            item.plan.push((o as u32, f as u8));
            item.helper.send_sizes[f] += 1;
            item.keep_objects[o] = false;
            for k in 0..size {
                item.keep_particles[o * size + k] = false;
            }
        }
        item.helper.compute_send_offsets();
        Ok(())
    }

    fn prepare_data(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &mut world.pvs[item.helper.pv];
        let spec = item.part_spec.as_ref().expect("sizes prepared first");
        let pu = spec.unit_size();
        let l = world.state.domain.local_size;

        {
            let info = pv.objects.as_ref().expect("object exchanger on object vector");
            let size = info.object_size;
            let mut heads = item.helper.send_offsets;
            for &(o, f) in &item.plan {
                let f = f as usize;
                let o = o as usize;
                let shift = -fragments::dir(f).as_vec3() * l;
                let slot = heads[f];
                heads[f] += 1;
                let out = item.helper.send_entity_mut(slot);
                for k in 0..size {
                    spec.pack(&pv.local, o * size + k, shift, &mut out[k * pu..(k + 1) * pu])?;
                }
                let mut cursor = size * pu;
                for (name, kind) in &item.obj_channels {
                    let es = entry_size(*kind);
                    let bytes = info.local.data(name)?.bytes();
                    out[cursor..cursor + es].copy_from_slice(&bytes[o * es..(o + 1) * es]);
                    cursor += es;
                }
            }
        }

        if !item.plan.is_empty() {
            pv.local.retain_by_mask(&item.keep_particles);
            let info = pv.objects.as_mut().expect("object exchanger on object vector");
            info.local.retain_by_mask(&item.keep_objects);
            pv.bump_motion_stamp();
            tracing::debug!(pv = pv.name(), left = item.plan.len(), "objects redistributed away");
        }
        Ok(())
    }

    fn combine_and_upload(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &mut world.pvs[item.helper.pv];
        let spec = item.part_spec.as_ref().expect("sizes prepared first");
        let pu = spec.unit_size();
        let unit = item.helper.unit_size.max(1);

        let mut received = 0usize;
        for f in 0..NUM_FRAGMENTS {
            let frag_len = item.helper.recv_fragment(f).len();
            let n = frag_len / unit;
            for e in 0..n {
                // split the borrow: copy one record, then unpack into pv
                let a = (item.helper.recv_offsets[f] + e) * unit;
                let rec = item.helper.recv_buf[a..a + unit].to_vec();
                let info_size = pv.objects.as_ref().unwrap().object_size;
                spec.unpack_append(&rec[..info_size * pu], &mut pv.local)?;
                let info = pv.objects.as_mut().unwrap();
                let mut cursor = info_size * pu;
                for (name, kind) in &item.obj_channels {
                    let es = entry_size(*kind);
                    info.local
                        .data_mut(name)?
                        .push_from_bytes(&rec[cursor..cursor + es]);
                    cursor += es;
                }
                received += 1;
            }
        }
        if received > 0 {
            let n_obj = pv.local_object_count()?;
            let info = pv.objects.as_mut().unwrap();
            info.local.resize_all(n_obj);
            pv.bump_motion_stamp();
            tracing::debug!(pv = pv.name(), received, "objects redistributed in");
        }
        Ok(())
    }
}

struct ChannelSetItem {
    helper: ExchangeHelper,
    names: Vec<String>,
    kinds: Vec<DataKind>,
}

impl ChannelSetItem {
    fn resolve(&mut self, pv: &kernel::ParticleVector, object_size: usize) -> Result<()> {
        if !self.kinds.is_empty() || self.names.is_empty() {
            return Ok(());
        }
        for name in &self.names {
            let kind = pv.local.channels.kind_of(name).ok_or_else(|| {
                SimulationError::Configuration(format!(
                    "exchange references unknown particle channel '{name}' on '{}'",
                    pv.name()
                ))
            })?;
            self.kinds.push(kind);
        }
        let per_particle: usize = self.kinds.iter().map(|k| entry_size(*k)).sum();
        self.helper.unit_size = object_size * per_particle;
        Ok(())
    }
}

/// Forwards a named set of per-particle channels for exactly the objects the
/// preceding [`ObjectHaloExchanger`] shipped, reusing its fragment
/// assignment.
#[derive(Default)]
pub struct ObjectExtraExchanger {
    items: Vec<ChannelSetItem>,
}

impl ObjectExtraExchanger {
    /// Empty exchanger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an object vector with the channels to forward.
    pub fn attach(&mut self, pv: usize, names: Vec<String>, tag_base: u64) {
        self.items.push(ChannelSetItem {
            helper: ExchangeHelper::new(pv, tag_base),
            names,
            kinds: Vec::new(),
        });
    }
}

impl Exchanger for ObjectExtraExchanger {
    fn label(&self) -> &'static str {
        "object extra"
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

    fn need_exchange(&self, i: usize, _world: &World) -> bool {
        !self.items[i].names.is_empty()
    }

    fn prepare_sizes(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &world.pvs[item.helper.pv];
        let size = pv.objects.as_ref().expect("object exchanger on object vector").object_size;
        item.resolve(pv, size)?;
        let map = world.halo_maps.entry(item.helper.pv).or_default();
        item.helper.clear_send();
        for f in 0..NUM_FRAGMENTS {
            item.helper.send_sizes[f] = map.sent[f].len();
        }
        item.helper.compute_send_offsets();
        Ok(())
    }

    fn prepare_data(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &world.pvs[item.helper.pv];
        let size = pv.objects.as_ref().unwrap().object_size;
        let map = &world.halo_maps[&item.helper.pv];

        let mut slot = 0usize;
        for f in 0..NUM_FRAGMENTS {
            for &o in &map.sent[f] {
                let out = item.helper.send_entity_mut(slot);
                slot += 1;
                let mut cursor = 0usize;
                for (name, kind) in item.names.iter().zip(&item.kinds) {
                    let es = entry_size(*kind);
                    let bytes = pv.local.channels.data(name)?.bytes();
                    for k in 0..size {
                        let p = o as usize * size + k;
                        out[cursor + k * es..cursor + (k + 1) * es]
                            .copy_from_slice(&bytes[p * es..(p + 1) * es]);
                    }
                    cursor += size * es;
                }
            }
        }
        Ok(())
    }

    fn combine_and_upload(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &mut world.pvs[item.helper.pv];
        let size = pv.objects.as_ref().unwrap().object_size;
        pv.halo.align_channels();

        let unit = item.helper.unit_size.max(1);
        let mut block = 0usize;
        for f in 0..NUM_FRAGMENTS {
            let frag = item.helper.recv_fragment(f);
            for e in 0..frag.len() / unit {
                let rec = &frag[e * unit..(e + 1) * unit];
                let mut cursor = 0usize;
                for (name, kind) in item.names.iter().zip(&item.kinds) {
                    let es = entry_size(*kind);
                    let data = pv.halo.channels.data_mut(name)?;
                    for k in 0..size {
                        data.write_from_bytes(block * size + k, &rec[cursor + k * es..cursor + (k + 1) * es]);
                    }
                    cursor += size * es;
                }
                block += 1;
            }
        }
        Ok(())
    }
}

/// Sends per-particle channels of halo objects back to the owning rank and
/// *adds* them into the owner's local objects (force reverse-reduction).
#[derive(Default)]
pub struct ObjectReverseExchanger {
    items: Vec<ChannelSetItem>,
}

impl ObjectReverseExchanger {
    /// Empty exchanger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an object vector with the channels to reduce back.
    pub fn attach(&mut self, pv: usize, names: Vec<String>, tag_base: u64) {
        self.items.push(ChannelSetItem {
            helper: ExchangeHelper::new(pv, tag_base),
            names,
            kinds: Vec::new(),
        });
    }
}

impl Exchanger for ObjectReverseExchanger {
    fn label(&self) -> &'static str {
        "object reverse"
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

    fn need_exchange(&self, i: usize, _world: &World) -> bool {
        !self.items[i].names.is_empty()
    }

    fn prepare_sizes(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &world.pvs[item.helper.pv];
        let size = pv.objects.as_ref().expect("object exchanger on object vector").object_size;
        item.resolve(pv, size)?;
        let map = world.halo_maps.entry(item.helper.pv).or_default();
        item.helper.clear_send();
        for f in 0..NUM_FRAGMENTS {
            item.helper.send_sizes[f] = map.received[f] as usize;
        }
        item.helper.compute_send_offsets();
        Ok(())
    }

    fn prepare_data(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &world.pvs[item.helper.pv];
        let size = pv.objects.as_ref().unwrap().object_size;

        // halo objects are stored fragment-major, so the running block index
        // lines up with the send slots
        let total = item.helper.total_send();
        for block in 0..total {
            let out = item.helper.send_entity_mut(block);
            let mut cursor = 0usize;
            for (name, kind) in item.names.iter().zip(&item.kinds) {
                let es = entry_size(*kind);
                let bytes = pv.halo.channels.data(name)?.bytes();
                for k in 0..size {
                    let p = block * size + k;
                    out[cursor + k * es..cursor + (k + 1) * es]
                        .copy_from_slice(&bytes[p * es..(p + 1) * es]);
                }
                cursor += size * es;
            }
        }
        Ok(())
    }

    fn combine_and_upload(&mut self, i: usize, world: &mut World) -> Result<()> {
        let item = &mut self.items[i];
        let pv = &mut world.pvs[item.helper.pv];
        let size = pv.objects.as_ref().unwrap().object_size;
        let map = &world.halo_maps[&item.helper.pv];

        let unit = item.helper.unit_size.max(1);
        for f in 0..NUM_FRAGMENTS {
            let n = item.helper.recv_fragment(f).len() / unit;
            if n != map.sent[f].len() {
                return Err(SimulationError::Exchange(format!(
                    "reverse reduction of '{}': fragment {f} returned {n} objects, {} were sent",
                    pv.name(),
                    map.sent[f].len()
                )));
            }
            for (e, &o) in map.sent[f].iter().enumerate() {
                let a = (item.helper.recv_offsets[f] + e) * unit;
                let rec = item.helper.recv_buf[a..a + unit].to_vec();
                let mut cursor = 0usize;
                for (name, kind) in item.names.iter().zip(&item.kinds) {
                    let es = entry_size(*kind);
                    let data = pv.local.channels.data_mut(name)?;
                    for k in 0..size {
                        data.add_from_bytes(o as usize * size + k, &rec[cursor + k * es..cursor + (k + 1) * es])?;
                    }
                    cursor += size * es;
                }
            }
        }
        Ok(())
    }
}
