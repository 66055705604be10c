//! Interaction manager.
//!
//! There are two kinds of interactions: *final* ones produce the quantities
//! integrators consume (forces, stresses), *intermediate* ones produce fields
//! other interactions consume on the same step (number densities). The
//! manager classifies registered interactions, routes channel activity to the
//! right cell lists, and owns the invariant that every consumer's input is
//! produced, accumulated and gathered before consumption.

use std::collections::BTreeMap;

use kernel::celllist::CellList;
use kernel::channels::channel_names::DENSITIES;
use kernel::error::{Result, SimulationError};
use kernel::interactions::{
    ChannelActivity, GridView, Interaction, InteractionStage, OutputSet, PairPass, PassKind,
    SideView,
};
use kernel::particles::ParticleVector;
use kernel::state::SimulationState;

use crate::world::CellListStore;

/// (particle vector index, cell list index).
pub type CellKey = (usize, usize);

/// Registry type the driver keeps its interactions in.
pub type InteractionMap = BTreeMap<String, Box<dyn Interaction>>;

type ActivityList = Vec<(String, ChannelActivity)>;

/// One registered interaction with its resolved cell lists.
#[derive(Debug, Clone)]
pub struct ManagedInteraction {
    /// Interaction name in the registry.
    pub name: String,
    /// First particle vector.
    pub pv1: usize,
    /// Second particle vector.
    pub pv2: usize,
    /// Best-fit cell list of `pv1`.
    pub cl1: CellKey,
    /// Best-fit cell list of `pv2`.
    pub cl2: CellKey,
    /// Interaction cutoff.
    pub rc: f32,
    /// Declared output channel names (filled at registration).
    pub outputs: Vec<String>,
}

/// Classifies interactions and routes channel traffic to cell lists.
#[derive(Default)]
pub struct InteractionManager {
    cell_intermediate_outputs: BTreeMap<CellKey, ActivityList>,
    cell_intermediate_inputs: BTreeMap<CellKey, ActivityList>,
    cell_final_channels: BTreeMap<CellKey, ActivityList>,
    cell_list_map: BTreeMap<usize, Vec<CellKey>>,
    intermediate: Vec<ManagedInteraction>,
    final_: Vec<ManagedInteraction>,
}

/// Pick the smallest cell list whose cutoff covers `rc` within `tolerance`.
pub fn select_best_cell_list(lists: &[CellList], rc: f32, tolerance: f32) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (k, cl) in lists.iter().enumerate() {
        let diff = cl.info.rc - rc;
        if diff > -tolerance && best.map_or(true, |(_, d)| diff < d) {
            best = Some((k, diff));
        }
    }
    best.map(|(k, _)| k)
}

impl InteractionManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one wired interaction. Creates its channels on both vectors
    /// (local and halo partitions) and on both cell lists, and rejects
    /// overlapping writers on the same pair and stage.
    pub fn add(
        &mut self,
        interaction: &dyn Interaction,
        mut proto: ManagedInteraction,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        let inputs = interaction.input_channels();
        let outputs = interaction.output_channels();
        proto.outputs = outputs.iter().map(|c| c.name.clone()).collect();

        for input in &inputs {
            if input.name != DENSITIES {
                return Err(SimulationError::Configuration(format!(
                    "interaction '{}' wants input channel '{}'; only '{DENSITIES}' can be fetched",
                    proto.name, input.name
                )));
            }
            if outputs.iter().any(|o| o.name == input.name) {
                return Err(SimulationError::Configuration(format!(
                    "interaction '{}' both reads and writes channel '{}'",
                    proto.name, input.name
                )));
            }
        }

        // overlapping writer channels on the same pair and stage are a wiring
        // error, not a silent last-writer-wins
        let stage = interaction.stage();
        let peers = match stage {
            InteractionStage::Intermediate => &self.intermediate,
            InteractionStage::Final => &self.final_,
        };
        for peer in peers {
            let same_pair = (peer.pv1 == proto.pv1 && peer.pv2 == proto.pv2)
                || (peer.pv1 == proto.pv2 && peer.pv2 == proto.pv1);
            if !same_pair {
                continue;
            }
            for out in &outputs {
                if peer.outputs.iter().any(|n| n == &out.name) {
                    return Err(SimulationError::Configuration(format!(
                        "interactions '{}' and '{}' both write channel '{}' on the same pair",
                        peer.name, proto.name, out.name
                    )));
                }
            }
        }

        // create channels everywhere they are needed
        for ch in inputs.iter().chain(outputs.iter()) {
            for pv_idx in [proto.pv1, proto.pv2] {
                let pv = &mut pvs[pv_idx];
                let n_local = pv.local.len();
                let n_halo = pv.halo.len();
                pv.local
                    .channels
                    .create_channel(&ch.name, ch.kind, kernel::Persistence::Transient, n_local)?;
                pv.halo
                    .channels
                    .create_channel(&ch.name, ch.kind, kernel::Persistence::Transient, n_halo)?;
            }
            cells.get_mut(proto.cl1).require_channel(&ch.name, ch.kind)?;
            cells.get_mut(proto.cl2).require_channel(&ch.name, ch.kind)?;
        }

        for (key, pv_idx) in [(proto.cl1, proto.pv1), (proto.cl2, proto.pv2)] {
            let pv_lists = self.cell_list_map.entry(pv_idx).or_default();
            if !pv_lists.contains(&key) {
                pv_lists.push(key);
            }
        }

        let (out_map, in_map) = match stage {
            InteractionStage::Intermediate => (&mut self.cell_intermediate_outputs, None),
            InteractionStage::Final => (
                &mut self.cell_final_channels,
                Some(&mut self.cell_intermediate_inputs),
            ),
        };
        for key in [proto.cl1, proto.cl2] {
            let list = out_map.entry(key).or_default();
            for ch in &outputs {
                if !list.iter().any(|(n, _)| n == &ch.name) {
                    list.push((ch.name.clone(), ch.activity));
                }
            }
        }
        if let Some(in_map) = in_map {
            for key in [proto.cl1, proto.cl2] {
                let list = in_map.entry(key).or_default();
                for ch in &inputs {
                    if !list.iter().any(|(n, _)| n == &ch.name) {
                        list.push((ch.name.clone(), ch.activity));
                    }
                }
            }
        }

        match stage {
            InteractionStage::Intermediate => self.intermediate.push(proto),
            InteractionStage::Final => self.final_.push(proto),
        }
        Ok(())
    }

    /// Verify every consumed intermediate channel has a producer on its
    /// vector.
    pub fn check(&self) -> Result<()> {
        for (pv, keys) in &self.cell_list_map {
            let mut produced: Vec<&str> = Vec::new();
            let mut consumed: Vec<&str> = Vec::new();
            for key in keys {
                if let Some(list) = self.cell_intermediate_outputs.get(key) {
                    produced.extend(list.iter().map(|(n, _)| n.as_str()));
                }
                if let Some(list) = self.cell_intermediate_inputs.get(key) {
                    consumed.extend(list.iter().map(|(n, _)| n.as_str()));
                }
            }
            for name in consumed {
                if !produced.contains(&name) {
                    return Err(SimulationError::Configuration(format!(
                        "channel '{name}' is consumed on particle vector {pv} but never produced"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Largest cutoff any registered interaction declares; bounds the halo
    /// thickness.
    pub fn max_effective_cutoff(&self) -> f32 {
        self.intermediate
            .iter()
            .chain(self.final_.iter())
            .map(|m| m.rc)
            .fold(0.0, f32::max)
    }

    /// Largest cell list the intermediate stage needs on `pv`, if any.
    pub fn largest_cell_list_for_intermediate(&self, pv: usize, cells: &CellListStore) -> Option<CellKey> {
        self.largest_with_entries(pv, cells, &self.cell_intermediate_outputs)
    }

    /// Largest cell list the final stage needs on `pv`, if any.
    pub fn largest_cell_list_for_final(&self, pv: usize, cells: &CellListStore) -> Option<CellKey> {
        self.largest_with_entries(pv, cells, &self.cell_final_channels)
    }

    fn largest_with_entries(
        &self,
        pv: usize,
        cells: &CellListStore,
        map: &BTreeMap<CellKey, ActivityList>,
    ) -> Option<CellKey> {
        let keys = self.cell_list_map.get(&pv)?;
        keys.iter()
            .filter(|k| map.get(*k).map_or(false, |l| !l.is_empty()))
            .copied()
            .max_by(|a, b| {
                cells
                    .get(*a)
                    .info
                    .rc
                    .partial_cmp(&cells.get(*b).info.rc)
                    .expect("cutoffs are finite")
            })
    }

    /// Intermediate channels the final stage consumes on `pv` (these ride
    /// along with the final-stage halo exchange).
    pub fn extra_intermediate_channels(&self, pv: usize) -> Vec<String> {
        self.union_names(pv, &self.cell_intermediate_inputs)
    }

    /// Final channels produced on `pv` (these are reverse-reduced for halo
    /// objects).
    pub fn extra_final_channels(&self, pv: usize) -> Vec<String> {
        self.union_names(pv, &self.cell_final_channels)
    }

    /// Intermediate channels produced on `pv`.
    pub fn intermediate_output_channels(&self, pv: usize) -> Vec<String> {
        self.union_names(pv, &self.cell_intermediate_outputs)
    }

    fn union_names(&self, pv: usize, map: &BTreeMap<CellKey, ActivityList>) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        if let Some(keys) = self.cell_list_map.get(&pv) {
            for key in keys {
                if let Some(list) = map.get(key) {
                    for (n, _) in list {
                        if !names.contains(n) {
                            names.push(n.clone());
                        }
                    }
                }
            }
        }
        names.sort();
        names
    }

    fn active_names(list: &ActivityList, step: u64) -> Vec<String> {
        list.iter()
            .filter(|(_, a)| a.is_active(step))
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Zero the intermediate channels of `pv` (its storage and every cell
    /// list that mirrors them).
    pub fn clear_intermediates(
        &self,
        pv: usize,
        step: u64,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        self.clear_stage(pv, step, pvs, cells, &self.cell_intermediate_outputs)
    }

    /// Zero the final channels of `pv`.
    pub fn clear_final(
        &self,
        pv: usize,
        step: u64,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        self.clear_stage(pv, step, pvs, cells, &self.cell_final_channels)
    }

    fn clear_stage(
        &self,
        pv: usize,
        step: u64,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
        map: &BTreeMap<CellKey, ActivityList>,
    ) -> Result<()> {
        let Some(keys) = self.cell_list_map.get(&pv) else {
            return Ok(());
        };
        for key in keys {
            let Some(list) = map.get(key) else { continue };
            let names = Self::active_names(list, step);
            cells.get_mut(*key).clear_channels(&names, &mut pvs[pv])?;
            // the vector's own storage accumulates from every list, clear it too
            for name in &names {
                if pvs[pv].local.channels.check_exists(name) {
                    pvs[pv].local.channels.clear(name)?;
                }
            }
        }
        Ok(())
    }

    /// Zero stage channels on one partition of `pv` only (object partitions
    /// have no cell list of their own).
    pub fn clear_intermediates_partition(
        &self,
        pv: usize,
        step: u64,
        halo: bool,
        pvs: &mut [ParticleVector],
    ) -> Result<()> {
        self.clear_partition(pv, step, halo, pvs, &self.cell_intermediate_outputs)
    }

    /// Zero final channels on one partition of `pv` only.
    pub fn clear_final_partition(
        &self,
        pv: usize,
        step: u64,
        halo: bool,
        pvs: &mut [ParticleVector],
    ) -> Result<()> {
        self.clear_partition(pv, step, halo, pvs, &self.cell_final_channels)
    }

    fn clear_partition(
        &self,
        pv: usize,
        step: u64,
        halo: bool,
        pvs: &mut [ParticleVector],
        map: &BTreeMap<CellKey, ActivityList>,
    ) -> Result<()> {
        let Some(keys) = self.cell_list_map.get(&pv) else {
            return Ok(());
        };
        let storage = if halo { &mut pvs[pv].halo } else { &mut pvs[pv].local };
        for key in keys {
            let Some(list) = map.get(key) else { continue };
            for name in Self::active_names(list, step) {
                if storage.channels.check_exists(&name) {
                    storage.channels.clear(&name)?;
                }
            }
        }
        Ok(())
    }

    /// Push cell-list-private intermediate results into the owning vectors.
    pub fn accumulate_intermediates(
        &self,
        step: u64,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        self.accumulate(step, pvs, cells, &self.cell_intermediate_outputs)
    }

    /// Push cell-list-private final results into the owning vectors.
    pub fn accumulate_final(
        &self,
        step: u64,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        self.accumulate(step, pvs, cells, &self.cell_final_channels)
    }

    fn accumulate(
        &self,
        step: u64,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
        map: &BTreeMap<CellKey, ActivityList>,
    ) -> Result<()> {
        for (key, list) in map {
            let names = Self::active_names(list, step);
            cells.get(*key).accumulate_channels(&names, &mut pvs[key.0])?;
        }
        Ok(())
    }

    /// After intermediates are accumulated on the vectors, copy them into the
    /// cell lists that feed the final stage.
    pub fn gather_intermediate(
        &self,
        step: u64,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        for (key, list) in &self.cell_intermediate_inputs {
            let names = Self::active_names(list, step);
            cells.get_mut(*key).gather_channels(&names, &pvs[key.0])?;
        }
        Ok(())
    }

    /// Run every intermediate interaction on (local, local).
    pub fn execute_local_intermediate(
        &self,
        state: &SimulationState,
        interactions: &InteractionMap,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        for m in &self.intermediate {
            self.execute_local(m, state, interactions, pvs, cells)?;
        }
        Ok(())
    }

    /// Run every final interaction on (local, local).
    pub fn execute_local_final(
        &self,
        state: &SimulationState,
        interactions: &InteractionMap,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        for m in &self.final_ {
            self.execute_local(m, state, interactions, pvs, cells)?;
        }
        Ok(())
    }

    /// Run every intermediate interaction on (halo, local).
    pub fn execute_halo_intermediate(
        &self,
        state: &SimulationState,
        interactions: &InteractionMap,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        for m in &self.intermediate {
            self.execute_halo(m, state, interactions, pvs, cells)?;
        }
        Ok(())
    }

    /// Run every final interaction on (halo, local).
    pub fn execute_halo_final(
        &self,
        state: &SimulationState,
        interactions: &InteractionMap,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        for m in &self.final_ {
            self.execute_halo(m, state, interactions, pvs, cells)?;
        }
        Ok(())
    }

    fn interaction<'a>(
        &self,
        interactions: &'a InteractionMap,
        name: &str,
    ) -> Result<&'a dyn Interaction> {
        interactions
            .get(name)
            .map(|b| b.as_ref())
            .ok_or_else(|| SimulationError::Configuration(format!("no such interaction: {name}")))
    }

    fn execute_local(
        &self,
        m: &ManagedInteraction,
        state: &SimulationState,
        interactions: &InteractionMap,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        let inter = self.interaction(interactions, &m.name)?;
        if m.pv1 == m.pv2 && m.cl1 == m.cl2 {
            self.run_pass(inter, state, pvs, cells, m.cl1, m.cl1, PassKind::LocalSelf, None)?;
        } else {
            self.run_pass(inter, state, pvs, cells, m.cl1, m.cl2, PassKind::LocalCross, None)?;
            self.run_pass(inter, state, pvs, cells, m.cl2, m.cl1, PassKind::LocalCross, None)?;
        }
        Ok(())
    }

    fn execute_halo(
        &self,
        m: &ManagedInteraction,
        state: &SimulationState,
        interactions: &InteractionMap,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
    ) -> Result<()> {
        let inter = self.interaction(interactions, &m.name)?;
        // halo of pv1 against local of pv2 ...
        self.run_pass(inter, state, pvs, cells, m.cl2, m.cl2, PassKind::Halo, Some(m.pv1))?;
        // ... and symmetrically for distinct vectors
        if m.pv1 != m.pv2 {
            self.run_pass(inter, state, pvs, cells, m.cl1, m.cl1, PassKind::Halo, Some(m.pv2))?;
        }
        Ok(())
    }

    /// One directed pass. `dst_key` owns the outputs; for local passes
    /// `src_key` names the cell list supplying neighbors, for halo passes
    /// `halo_src` names the vector whose halo is folded over `dst_key`'s grid.
    #[allow(clippy::too_many_arguments)]
    fn run_pass(
        &self,
        inter: &dyn Interaction,
        state: &SimulationState,
        pvs: &mut [ParticleVector],
        cells: &mut CellListStore,
        dst_key: CellKey,
        src_key: CellKey,
        kind: PassKind,
        halo_src: Option<usize>,
    ) -> Result<()> {
        let step = state.current_step;
        let needs_density = inter
            .input_channels()
            .iter()
            .any(|c| c.name == DENSITIES);
        let out_names: Vec<String> = inter
            .output_channels()
            .iter()
            .filter(|c| c.activity.is_active(step))
            .map(|c| c.name.clone())
            .collect();
        if out_names.is_empty() {
            return Ok(());
        }
        if pvs[dst_key.0].local.is_empty() {
            return Ok(());
        }
        if let Some(s) = halo_src {
            if pvs[s].halo.is_empty() {
                return Ok(());
            }
        }

        // move the output buffers out so the rest stays readable
        let mut out = OutputSet::new();
        for name in &out_names {
            let taken = cells.get_mut(dst_key).take_channel(&mut pvs[dst_key.0], name)?;
            out.insert(name.clone(), taken);
        }
        let mut halo_out = OutputSet::new();
        if let Some(s) = halo_src {
            if pvs[s].is_object() {
                for name in &out_names {
                    if pvs[s].halo.channels.check_exists(name) {
                        halo_out.insert(name.clone(), pvs[s].halo.channels.take(name)?);
                    }
                }
            }
        }

        let result = {
            let dst_pv = &pvs[dst_key.0];
            let dst_cl = cells.get(dst_key);
            let dst = SideView {
                positions: dst_cl.positions_of(dst_pv),
                velocities: dst_cl.velocities_of(dst_pv),
                ids: dst_cl.ids_of(dst_pv),
                mass: dst_pv.mass,
                densities: if needs_density {
                    Some(dst_cl.channels_of(dst_pv).floats(DENSITIES)?)
                } else {
                    None
                },
            };

            let (src, grid) = match halo_src {
                None => {
                    let src_pv = &pvs[src_key.0];
                    let src_cl = cells.get(src_key);
                    let src = SideView {
                        positions: src_cl.positions_of(src_pv),
                        velocities: src_cl.velocities_of(src_pv),
                        ids: src_cl.ids_of(src_pv),
                        mass: src_pv.mass,
                        densities: if needs_density {
                            Some(src_cl.channels_of(src_pv).floats(DENSITIES)?)
                        } else {
                            None
                        },
                    };
                    let grid = GridView {
                        info: src_cl.info,
                        starts: &src_cl.cell_starts,
                        sizes: &src_cl.cell_sizes,
                    };
                    (src, grid)
                }
                Some(s) => {
                    let src_pv = &pvs[s];
                    let src = SideView {
                        positions: &src_pv.halo.positions,
                        velocities: &src_pv.halo.velocities,
                        ids: &src_pv.halo.ids,
                        mass: src_pv.mass,
                        densities: if needs_density {
                            Some(src_pv.halo.channels.floats(DENSITIES)?)
                        } else {
                            None
                        },
                    };
                    let dst_cl = cells.get(dst_key);
                    let grid = GridView {
                        info: dst_cl.info,
                        starts: &dst_cl.cell_starts,
                        sizes: &dst_cl.cell_sizes,
                    };
                    (src, grid)
                }
            };

            inter.execute(PairPass {
                state,
                kind,
                dst,
                src,
                grid,
                out: &mut out,
                halo_out: if halo_out.is_empty() { None } else { Some(&mut halo_out) },
            })
        };

        // always hand the buffers back, even on error
        for (name, data) in out.into_entries() {
            cells
                .get_mut(dst_key)
                .restore_channel(&mut pvs[dst_key.0], &name, data)?;
        }
        if let Some(s) = halo_src {
            for (name, data) in halo_out.into_entries() {
                pvs[s].halo.channels.restore(&name, data)?;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn best_fit_prefers_smallest_covering_cutoff() {
        let local = Vec3::splat(12.0);
        let lists = vec![
            CellList::new(2.0, local, true).unwrap(),
            CellList::new(1.2, local, false).unwrap(),
            CellList::new(1.0, local, false).unwrap(),
        ];
        assert_eq!(select_best_cell_list(&lists, 1.0, 1e-5), Some(2));
        assert_eq!(select_best_cell_list(&lists, 1.1, 1e-5), Some(1));
        assert_eq!(select_best_cell_list(&lists, 2.0, 1e-5), Some(0));
        assert_eq!(select_best_cell_list(&lists, 2.5, 1e-5), None);
    }
}
