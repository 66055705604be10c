//! Uniform-grid spatial indices.
//!
//! One cell list exists per (particle vector, cutoff) pair. The build is a
//! counting sort: cell ids, per-cell counts, a prefix sum, then a scatter that
//! yields the permutation `order` (original index -> cell-sorted position).
//! A *primary* cell list owns the particle vector's local storage order and
//! reorders it in place; a *secondary* list keeps its own reordered copies.

use glam::{IVec3, Vec3};

use crate::channels::{ChannelData, DataKind, ExtraDataManager, Persistence};
use crate::error::{Result, SimulationError};
use crate::particles::ParticleVector;

/// Geometry of a cell grid. Cell edge is always >= the cutoff.
#[derive(Debug, Clone, Copy)]
pub struct CellListInfo {
    /// Cutoff radius this grid serves.
    pub rc: f32,
    /// Cells per axis.
    pub ncells: IVec3,
    /// Total cell count.
    pub total_cells: usize,
    /// Local subdomain extent.
    pub local_size: Vec3,
    /// Cell edge lengths.
    pub h: Vec3,
    /// Reciprocal cell edge lengths.
    pub inv_h: Vec3,
}

impl CellListInfo {
    /// Grid for cutoff `rc` over a subdomain of extent `local_size`.
    pub fn new(rc: f32, local_size: Vec3) -> Result<Self> {
        if rc <= 0.0 {
            return Err(SimulationError::Configuration(format!(
                "cell list cutoff must be positive, got {rc}"
            )));
        }
        let ncells = IVec3::new(
            ((local_size.x / rc).floor() as i32).max(1),
            ((local_size.y / rc).floor() as i32).max(1),
            ((local_size.z / rc).floor() as i32).max(1),
        );
        let h = local_size / ncells.as_vec3();
        Ok(Self {
            rc,
            ncells,
            total_cells: (ncells.x * ncells.y * ncells.z) as usize,
            local_size,
            h,
            inv_h: 1.0 / h,
        })
    }

    /// Row-major flat index, x fastest.
    #[inline]
    pub fn encode(&self, c: IVec3) -> usize {
        ((c.z * self.ncells.y + c.y) * self.ncells.x + c.x) as usize
    }

    /// Inverse of [`Self::encode`].
    #[inline]
    pub fn decode(&self, cid: usize) -> IVec3 {
        let cid = cid as i32;
        IVec3::new(
            cid % self.ncells.x,
            (cid / self.ncells.x) % self.ncells.y,
            cid / (self.ncells.x * self.ncells.y),
        )
    }

    /// Cell coordinates of a position, not clamped to the grid.
    #[inline]
    pub fn cell_coords(&self, x: Vec3) -> IVec3 {
        let v = (self.inv_h * (x + 0.5 * self.local_size)).floor();
        IVec3::new(v.x as i32, v.y as i32, v.z as i32)
    }

    /// Flat cell id with coordinates clamped into the grid (owned particles
    /// are guaranteed in range; clamping absorbs boundary rounding).
    #[inline]
    pub fn cell_id_clamped(&self, x: Vec3) -> usize {
        let c = self.cell_coords(x).clamp(IVec3::ZERO, self.ncells - 1);
        self.encode(c)
    }

    /// Flat cell id, or `None` when the position lies outside the grid
    /// (halo probing).
    #[inline]
    pub fn cell_id(&self, x: Vec3) -> Option<usize> {
        let c = self.cell_coords(x);
        if c.cmplt(IVec3::ZERO).any() || c.cmpge(self.ncells).any() {
            None
        } else {
            Some(self.encode(c))
        }
    }
}

/// A built cell list over one particle vector.
#[derive(Debug)]
pub struct CellList {
    /// Grid geometry.
    pub info: CellListInfo,
    primary: bool,
    /// Particles per cell.
    pub cell_sizes: Vec<u32>,
    /// Prefix sum over `cell_sizes`, with an end sentinel (`total_cells + 1`
    /// entries).
    pub cell_starts: Vec<u32>,
    /// Original index -> cell-sorted position.
    pub order: Vec<u32>,
    /// Reordered position copy (secondary lists only).
    pub positions: Vec<Vec3>,
    /// Reordered velocity copy (secondary lists only).
    pub velocities: Vec<Vec3>,
    /// Reordered id copy (secondary lists only).
    pub ids: Vec<u64>,
    /// Private channel storage in cell order (secondary lists only).
    pub channels: ExtraDataManager,
    built_stamp: Option<u64>,
}

impl CellList {
    /// New cell list; `primary` lists reorder the particle vector itself.
    pub fn new(rc: f32, local_size: Vec3, primary: bool) -> Result<Self> {
        let info = CellListInfo::new(rc, local_size)?;
        Ok(Self {
            info,
            primary,
            cell_sizes: vec![0; info.total_cells],
            cell_starts: vec![0; info.total_cells + 1],
            order: Vec::new(),
            positions: Vec::new(),
            velocities: Vec::new(),
            ids: Vec::new(),
            channels: ExtraDataManager::new(),
            built_stamp: None,
        })
    }

    /// Whether this list rules the particle vector's storage order.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    /// Declare a channel this list must mirror privately. No-op for a primary
    /// list, whose channel storage is the particle vector itself.
    pub fn require_channel(&mut self, name: &str, kind: DataKind) -> Result<()> {
        if self.primary {
            return Ok(());
        }
        self.channels
            .create_channel(name, kind, Persistence::Transient, self.order.len())
    }

    /// A rebuild is needed iff the vector moved since the last build.
    pub fn needs_build(&self, pv: &ParticleVector) -> bool {
        self.built_stamp != Some(pv.motion_stamp())
    }

    /// Build the index from the vector's current local positions.
    pub fn build(&mut self, pv: &mut ParticleVector) -> Result<()> {
        if !self.needs_build(pv) {
            return Ok(());
        }
        if self.primary && pv.is_object() {
            return Err(SimulationError::Invariant(format!(
                "primary cell list bound to object vector '{}'",
                pv.name()
            )));
        }
        let n = pv.local.len();

        let mut cids = vec![0usize; n];
        for (i, &x) in pv.local.positions.iter().enumerate() {
            cids[i] = self.info.cell_id_clamped(x);
        }

        self.cell_sizes.clear();
        self.cell_sizes.resize(self.info.total_cells, 0);
        for &c in &cids {
            self.cell_sizes[c] += 1;
        }

        self.cell_starts.clear();
        self.cell_starts.resize(self.info.total_cells + 1, 0);
        let mut running = 0u32;
        for c in 0..self.info.total_cells {
            self.cell_starts[c] = running;
            running += self.cell_sizes[c];
        }
        self.cell_starts[self.info.total_cells] = running;

        self.order.clear();
        self.order.resize(n, 0);
        let mut heads: Vec<u32> = self.cell_starts[..self.info.total_cells].to_vec();
        for (i, &c) in cids.iter().enumerate() {
            self.order[i] = heads[c];
            heads[c] += 1;
        }

        if self.primary {
            pv.local.apply_order(&self.order);
        } else {
            self.positions.clear();
            self.positions.resize(n, Vec3::ZERO);
            self.velocities.clear();
            self.velocities.resize(n, Vec3::ZERO);
            self.ids.clear();
            self.ids.resize(n, 0);
            for i in 0..n {
                let dst = self.order[i] as usize;
                self.positions[dst] = pv.local.positions[i];
                self.velocities[dst] = pv.local.velocities[i];
                self.ids[dst] = pv.local.ids[i];
            }
            self.channels.resize_all(n);
        }
        self.built_stamp = Some(pv.motion_stamp());
        Ok(())
    }

    /// Positions in this list's order.
    pub fn positions_of<'a>(&'a self, pv: &'a ParticleVector) -> &'a [Vec3] {
        if self.primary {
            &pv.local.positions
        } else {
            &self.positions
        }
    }

    /// Velocities in this list's order.
    pub fn velocities_of<'a>(&'a self, pv: &'a ParticleVector) -> &'a [Vec3] {
        if self.primary {
            &pv.local.velocities
        } else {
            &self.velocities
        }
    }

    /// Ids in this list's order.
    pub fn ids_of<'a>(&'a self, pv: &'a ParticleVector) -> &'a [u64] {
        if self.primary {
            &pv.local.ids
        } else {
            &self.ids
        }
    }

    /// Channel storage in this list's order (the vector itself for a primary
    /// list).
    pub fn channels_of<'a>(&'a self, pv: &'a ParticleVector) -> &'a ExtraDataManager {
        if self.primary {
            &pv.local.channels
        } else {
            &self.channels
        }
    }

    /// Move a channel buffer out of this list's storage (particle vector for
    /// a primary list). Pair with [`Self::restore_channel`].
    pub fn take_channel(&mut self, pv: &mut ParticleVector, name: &str) -> Result<ChannelData> {
        if self.primary {
            pv.local.channels.take(name)
        } else {
            self.channels.take(name)
        }
    }

    /// Put back a buffer moved out with [`Self::take_channel`].
    pub fn restore_channel(
        &mut self,
        pv: &mut ParticleVector,
        name: &str,
        data: ChannelData,
    ) -> Result<()> {
        if self.primary {
            pv.local.channels.restore(name, data)
        } else {
            self.channels.restore(name, data)
        }
    }

    /// Add private channel values back into the vector, original indexing.
    pub fn accumulate_channels(&self, names: &[String], pv: &mut ParticleVector) -> Result<()> {
        if self.primary {
            return Ok(());
        }
        for name in names {
            let src = self.channels.data(name)?;
            pv.local
                .channels
                .data_mut(name)?
                .accumulate_ordered(src, &self.order)?;
        }
        Ok(())
    }

    /// Copy vector channels into this list's reordered layout.
    pub fn gather_channels(&mut self, names: &[String], pv: &ParticleVector) -> Result<()> {
        if self.primary {
            return Ok(());
        }
        for name in names {
            let src = pv.local.channels.data(name)?;
            let dst = self.channels.data_mut(name)?;
            dst.resize(src.len());
            dst.scatter_ordered(src, &self.order)?;
        }
        Ok(())
    }

    /// Zero channels on this list's storage.
    pub fn clear_channels(&mut self, names: &[String], pv: &mut ParticleVector) -> Result<()> {
        for name in names {
            if self.primary {
                pv.local.channels.clear(name)?;
            } else {
                self.channels.resize(name, self.order.len())?;
                self.channels.clear(name)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pv_with_grid(n_side: usize, l: f32) -> ParticleVector {
        let mut pv = ParticleVector::new("solvent", 1.0);
        let mut id = 0;
        for i in 0..n_side {
            for j in 0..n_side {
                for k in 0..n_side {
                    let f = |q: usize| (q as f32 + 0.5) / n_side as f32 * l - 0.5 * l;
                    pv.local.push(Vec3::new(f(i), f(j), f(k)), Vec3::ZERO, id);
                    id += 1;
                }
            }
        }
        pv.local.align_channels();
        pv.bump_motion_stamp();
        pv
    }

    #[test]
    fn cell_edge_at_least_cutoff() {
        let info = CellListInfo::new(1.1, Vec3::splat(8.0)).unwrap();
        assert_eq!(info.ncells, IVec3::splat(7));
        assert!(info.h.x >= 1.1);
    }

    #[test]
    fn encode_is_row_major_x_fastest() {
        let info = CellListInfo::new(1.0, Vec3::new(4.0, 3.0, 2.0)).unwrap();
        assert_eq!(info.encode(IVec3::new(1, 0, 0)), 1);
        assert_eq!(info.encode(IVec3::new(0, 1, 0)), 4);
        assert_eq!(info.encode(IVec3::new(0, 0, 1)), 12);
        for cid in 0..info.total_cells {
            assert_eq!(info.encode(info.decode(cid)), cid);
        }
    }

    #[test]
    fn out_of_grid_probe_reports_none() {
        let info = CellListInfo::new(1.0, Vec3::splat(4.0)).unwrap();
        assert!(info.cell_id(Vec3::new(2.5, 0.0, 0.0)).is_none());
        assert!(info.cell_id(Vec3::new(1.5, 0.0, 0.0)).is_some());
        // clamped projection stays in range
        assert!(info.cell_id_clamped(Vec3::new(100.0, 0.0, 0.0)) < info.total_cells);
    }

    #[test]
    fn build_orders_particles_into_cells() {
        let mut pv = pv_with_grid(4, 4.0);
        let mut cl = CellList::new(1.0, Vec3::splat(4.0), false).unwrap();
        cl.build(&mut pv).unwrap();

        // the law: starts[cell(i)] <= order[i] < starts[cell(i) + 1]
        for (i, &x) in pv.local.positions.iter().enumerate() {
            let c = cl.info.cell_id_clamped(x);
            let pos = cl.order[i];
            assert!(pos >= cl.cell_starts[c]);
            assert!(pos < cl.cell_starts[c + 1]);
            // the private copy holds the particle at its sorted slot
            assert_eq!(cl.positions[pos as usize], x);
        }
        assert_eq!(cl.cell_starts[cl.info.total_cells] as usize, pv.local.len());
    }

    #[test]
    fn primary_build_reorders_vector_in_place() {
        let mut pv = pv_with_grid(3, 3.0);
        let before_ids = pv.local.ids.clone();
        let mut cl = CellList::new(1.0, Vec3::splat(3.0), true).unwrap();
        cl.build(&mut pv).unwrap();

        // same multiset of ids, now in cell-major order
        let mut after = pv.local.ids.clone();
        after.sort_unstable();
        let mut before = before_ids;
        before.sort_unstable();
        assert_eq!(after, before);
        for (i, &x) in pv.local.positions.iter().enumerate() {
            let c = cl.info.cell_id_clamped(x);
            assert!((i as u32) >= cl.cell_starts[c] && (i as u32) < cl.cell_starts[c + 1]);
        }
    }

    #[test]
    fn rebuild_only_after_motion() {
        let mut pv = pv_with_grid(2, 2.0);
        let mut cl = CellList::new(1.0, Vec3::splat(2.0), false).unwrap();
        cl.build(&mut pv).unwrap();
        assert!(!cl.needs_build(&pv));
        pv.bump_motion_stamp();
        assert!(cl.needs_build(&pv));
    }

    #[test]
    fn primary_never_for_objects() {
        let mut ov = ParticleVector::new_object("vesicle", 1.0, 2, None).unwrap();
        ov.local.push(Vec3::ZERO, Vec3::ZERO, 0);
        ov.local.push(Vec3::ZERO, Vec3::ZERO, 1);
        ov.local.align_channels();
        ov.bump_motion_stamp();
        let mut cl = CellList::new(1.0, Vec3::splat(2.0), true).unwrap();
        assert!(cl.build(&mut ov).is_err());
    }
}
