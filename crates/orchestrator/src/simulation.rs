//! The simulation driver.
//!
//! Wires every component together: registration with name validation, cell
//! list construction per declared cutoff, interaction classification, engine
//! selection by world size, the per-step task graph with its dependencies and
//! priorities, the stepping loop, and checkpoint/restart.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use glam::{IVec3, Vec3};

use kernel::belonging::ObjectBelongingChecker;
use kernel::bouncers::Bouncer;
use kernel::celllist::CellList;
use kernel::error::{Result, SimulationError};
use kernel::ic::InitialConditions;
use kernel::integrators::Integrator;
use kernel::interactions::Interaction;
use kernel::particles::ParticleVector;
use kernel::state::{DomainInfo, SimulationState};
use kernel::walls::Wall;

use crate::checkpoint::{self, STATE_RECORD};
use crate::comm::{CartComm, InterComm};
use crate::config::SimulationConfig;
use crate::exchange::{
    ClusterEngine, ExchangeEngine, ObjectExtraExchanger, ObjectHaloExchanger, ObjectRedistributor,
    ObjectReverseExchanger, ParticleHaloExchanger, ParticleRedistributor, SingleNodeEngine,
};
use crate::interaction_manager::{
    select_best_cell_list, InteractionManager, InteractionMap, ManagedInteraction,
};
use crate::plugins::{PluginContext, PluginHook, SimulationPlugin};
use crate::scheduler::{TaskId, TaskScheduler};
use crate::world::{CellListStore, HaloOriginMap, World};

/// Cutoff given to vectors that declare no interactions, so redistribution
/// still has a cell list to lean on.
const DEFAULT_RC: f32 = 1.0;

/// One unit of work inside a task.
#[derive(Debug, Clone)]
enum Work {
    Checkpoint,
    CheckpointPv(usize),
    BuildCellLists(usize),
    ClearIntermediate(usize),
    ClearFinal(usize),
    Plugin(usize, PluginHook),
    Engine(EngineKind, EnginePhase),
    LocalIntermediate,
    HaloIntermediate,
    LocalFinal,
    HaloFinal,
    AccumulateIntermediate,
    GatherIntermediate,
    AccumulateFinal,
    Integrate(usize),
    ObjClearLocalIntermediate(usize),
    ObjClearHaloIntermediate(usize),
    ObjClearLocalForces(usize),
    ObjClearHaloForces(usize),
    BounceLocal(usize),
    BounceHalo(usize),
    CorrectBelonging(usize),
    WallBounce(usize),
    WallCheck(usize),
}

#[derive(Debug, Clone, Copy)]
enum EngineKind {
    PartRedistribute,
    PartHaloIntermediate,
    PartHaloFinal,
    ObjRedistribute,
    ObjHaloFinal,
    ObjHaloIntermediate,
    ObjReverseIntermediate,
    ObjReverseFinal,
}

#[derive(Debug, Clone, Copy)]
enum EnginePhase {
    Init,
    Finalize,
}

struct Engines {
    part_redistribute: Box<dyn ExchangeEngine>,
    part_halo_intermediate: Box<dyn ExchangeEngine>,
    part_halo_final: Box<dyn ExchangeEngine>,
    obj_redistribute: Box<dyn ExchangeEngine>,
    obj_halo_final: Box<dyn ExchangeEngine>,
    obj_halo_intermediate: Box<dyn ExchangeEngine>,
    obj_reverse_intermediate: Box<dyn ExchangeEngine>,
    obj_reverse_final: Box<dyn ExchangeEngine>,
}

/// Handles of every task in the canonical per-step graph.
struct SimulationTasks {
    checkpoint: TaskId,
    cell_lists: TaskId,
    integration: TaskId,
    part_clear_intermediate: TaskId,
    part_halo_intermediate_init: TaskId,
    part_halo_intermediate_finalize: TaskId,
    local_intermediate: TaskId,
    halo_intermediate: TaskId,
    accumulate_intermediate: TaskId,
    gather_intermediate: TaskId,
    part_clear_final: TaskId,
    part_halo_final_init: TaskId,
    part_halo_final_finalize: TaskId,
    local_forces: TaskId,
    halo_forces: TaskId,
    accumulate_final: TaskId,
    obj_halo_final_init: TaskId,
    obj_halo_final_finalize: TaskId,
    obj_halo_intermediate_init: TaskId,
    obj_halo_intermediate_finalize: TaskId,
    obj_reverse_intermediate_init: TaskId,
    obj_reverse_intermediate_finalize: TaskId,
    obj_reverse_final_init: TaskId,
    obj_reverse_final_finalize: TaskId,
    obj_clear_local_intermediate: TaskId,
    obj_clear_halo_intermediate: TaskId,
    obj_clear_halo_forces: TaskId,
    obj_clear_local_forces: TaskId,
    obj_local_bounce: TaskId,
    obj_halo_bounce: TaskId,
    correct_obj_belonging: TaskId,
    wall_bounce: TaskId,
    wall_check: TaskId,
    part_redistribute_init: TaskId,
    part_redistribute_finalize: TaskId,
    obj_redistribute_init: TaskId,
    obj_redistribute_finalize: TaskId,
    plugins_before_cell_lists: TaskId,
    plugins_before_forces: TaskId,
    plugins_serialize_send: TaskId,
    plugins_before_integration: TaskId,
    plugins_after_integration: TaskId,
    plugins_before_particle_distribution: TaskId,
}

fn create_task_ids(s: &mut TaskScheduler<Work>) -> SimulationTasks {
    SimulationTasks {
        checkpoint: s.create_task("Checkpoint"),
        cell_lists: s.create_task("Build cell-lists"),
        integration: s.create_task("Integration"),
        part_clear_intermediate: s.create_task("Particle clear intermediate"),
        part_halo_intermediate_init: s.create_task("Particle halo intermediate init"),
        part_halo_intermediate_finalize: s.create_task("Particle halo intermediate finalize"),
        local_intermediate: s.create_task("Local intermediate"),
        halo_intermediate: s.create_task("Halo intermediate"),
        accumulate_intermediate: s.create_task("Accumulate intermediate"),
        gather_intermediate: s.create_task("Gather intermediate"),
        part_clear_final: s.create_task("Clear forces"),
        part_halo_final_init: s.create_task("Particle halo final init"),
        part_halo_final_finalize: s.create_task("Particle halo final finalize"),
        local_forces: s.create_task("Local forces"),
        halo_forces: s.create_task("Halo forces"),
        accumulate_final: s.create_task("Accumulate forces"),
        obj_halo_final_init: s.create_task("Object halo final init"),
        obj_halo_final_finalize: s.create_task("Object halo final finalize"),
        obj_halo_intermediate_init: s.create_task("Object halo intermediate init"),
        obj_halo_intermediate_finalize: s.create_task("Object halo intermediate finalize"),
        obj_reverse_intermediate_init: s.create_task("Object reverse intermediate: init"),
        obj_reverse_intermediate_finalize: s.create_task("Object reverse intermediate: finalize"),
        obj_reverse_final_init: s.create_task("Object reverse final: init"),
        obj_reverse_final_finalize: s.create_task("Object reverse final: finalize"),
        obj_clear_local_intermediate: s.create_task("Clear local object intermediate"),
        obj_clear_halo_intermediate: s.create_task("Clear halo object intermediate"),
        obj_clear_halo_forces: s.create_task("Clear object halo forces"),
        obj_clear_local_forces: s.create_task("Clear object local forces"),
        obj_local_bounce: s.create_task("Local object bounce"),
        obj_halo_bounce: s.create_task("Halo object bounce"),
        correct_obj_belonging: s.create_task("Correct object belonging"),
        wall_bounce: s.create_task("Wall bounce"),
        wall_check: s.create_task("Wall check"),
        part_redistribute_init: s.create_task("Particle redistribute init"),
        part_redistribute_finalize: s.create_task("Particle redistribute finalize"),
        obj_redistribute_init: s.create_task("Object redistribute init"),
        obj_redistribute_finalize: s.create_task("Object redistribute finalize"),
        plugins_before_cell_lists: s.create_task("Plugins: before cell lists"),
        plugins_before_forces: s.create_task("Plugins: before forces"),
        plugins_serialize_send: s.create_task("Plugins: serialize and send"),
        plugins_before_integration: s.create_task("Plugins: before integration"),
        plugins_after_integration: s.create_task("Plugins: after integration"),
        plugins_before_particle_distribution: s.create_task("Plugins: before particles distribution"),
    }
}

fn build_dependencies(s: &mut TaskScheduler<Work>, t: &SimulationTasks) -> Result<()> {
    s.add_dependency(t.plugins_before_cell_lists, &[t.cell_lists], &[]);

    s.add_dependency(t.checkpoint, &[t.part_clear_final], &[t.cell_lists]);
    s.add_dependency(t.correct_obj_belonging, &[t.cell_lists], &[]);
    s.add_dependency(
        t.cell_lists,
        &[t.part_clear_final, t.part_clear_intermediate, t.obj_clear_local_intermediate],
        &[],
    );

    s.add_dependency(
        t.plugins_before_forces,
        &[t.local_forces, t.halo_forces],
        &[t.part_clear_final],
    );
    s.add_dependency(
        t.plugins_serialize_send,
        &[t.plugins_before_integration, t.plugins_after_integration],
        &[t.plugins_before_forces],
    );

    s.add_dependency(t.obj_clear_halo_forces, &[t.obj_halo_bounce], &[t.obj_halo_final_finalize]);

    s.add_dependency(t.obj_reverse_final_init, &[], &[t.halo_forces]);
    s.add_dependency(
        t.obj_reverse_final_finalize,
        &[t.accumulate_final],
        &[t.obj_reverse_final_init],
    );

    s.add_dependency(
        t.local_intermediate,
        &[],
        &[t.part_clear_intermediate, t.obj_clear_local_intermediate],
    );
    s.add_dependency(
        t.part_halo_intermediate_init,
        &[],
        &[t.part_clear_intermediate, t.cell_lists],
    );
    s.add_dependency(t.part_halo_intermediate_finalize, &[], &[t.part_halo_intermediate_init]);

    s.add_dependency(t.obj_clear_halo_intermediate, &[], &[t.cell_lists]);
    s.add_dependency(
        t.halo_intermediate,
        &[],
        &[t.part_halo_intermediate_finalize, t.obj_clear_halo_intermediate],
    );
    s.add_dependency(t.obj_reverse_intermediate_init, &[], &[t.halo_intermediate]);
    s.add_dependency(t.obj_reverse_intermediate_finalize, &[], &[t.obj_reverse_intermediate_init]);

    s.add_dependency(
        t.accumulate_intermediate,
        &[],
        &[t.local_intermediate, t.halo_intermediate],
    );
    s.add_dependency(
        t.gather_intermediate,
        &[],
        &[t.accumulate_intermediate, t.obj_reverse_intermediate_finalize],
    );

    s.add_dependency(t.local_forces, &[], &[t.gather_intermediate]);

    s.add_dependency(t.obj_halo_intermediate_init, &[], &[t.gather_intermediate]);
    s.add_dependency(t.obj_halo_intermediate_finalize, &[], &[t.obj_halo_intermediate_init]);

    s.add_dependency(
        t.part_halo_final_init,
        &[],
        &[t.plugins_before_forces, t.gather_intermediate],
    );
    s.add_dependency(t.part_halo_final_finalize, &[], &[t.part_halo_final_init]);

    s.add_dependency(
        t.halo_forces,
        &[],
        &[t.part_halo_final_finalize, t.obj_halo_intermediate_finalize],
    );
    s.add_dependency(t.accumulate_final, &[t.integration], &[t.halo_forces, t.local_forces]);

    s.add_dependency(t.plugins_before_integration, &[t.integration], &[t.accumulate_final]);
    s.add_dependency(t.wall_bounce, &[], &[t.integration]);
    s.add_dependency(t.wall_check, &[t.part_redistribute_init], &[t.wall_bounce]);

    s.add_dependency(t.obj_halo_final_init, &[], &[t.integration, t.obj_redistribute_finalize]);
    s.add_dependency(t.obj_halo_final_finalize, &[], &[t.obj_halo_final_init]);

    s.add_dependency(
        t.obj_local_bounce,
        &[t.obj_halo_final_finalize],
        &[t.integration, t.obj_clear_local_forces],
    );
    s.add_dependency(
        t.obj_halo_bounce,
        &[],
        &[t.integration, t.obj_halo_final_finalize, t.obj_clear_halo_forces],
    );

    s.add_dependency(
        t.plugins_after_integration,
        &[t.obj_local_bounce, t.obj_halo_bounce],
        &[t.integration, t.wall_bounce],
    );

    s.add_dependency(
        t.plugins_before_particle_distribution,
        &[],
        &[t.integration, t.wall_bounce, t.obj_local_bounce, t.obj_halo_bounce, t.plugins_after_integration],
    );
    s.add_dependency(t.part_redistribute_init, &[], &[t.plugins_before_particle_distribution]);
    s.add_dependency(t.part_redistribute_finalize, &[], &[t.part_redistribute_init]);

    s.add_dependency(
        t.obj_redistribute_init,
        &[],
        &[t.integration, t.wall_bounce, t.obj_reverse_final_finalize, t.plugins_after_integration],
    );
    s.add_dependency(t.obj_redistribute_finalize, &[], &[t.obj_redistribute_init]);
    s.add_dependency(
        t.obj_clear_local_forces,
        &[t.obj_local_bounce],
        &[t.integration, t.obj_redistribute_finalize],
    );

    s.set_high_priority(t.obj_reverse_final_init);
    s.set_high_priority(t.part_halo_intermediate_init);
    s.set_high_priority(t.part_halo_intermediate_finalize);
    s.set_high_priority(t.obj_halo_intermediate_init);
    s.set_high_priority(t.obj_halo_intermediate_finalize);
    s.set_high_priority(t.obj_clear_halo_intermediate);
    s.set_high_priority(t.obj_reverse_final_finalize);
    s.set_high_priority(t.halo_intermediate);
    s.set_high_priority(t.part_halo_final_init);
    s.set_high_priority(t.part_halo_final_finalize);
    s.set_high_priority(t.halo_forces);
    s.set_high_priority(t.plugins_serialize_send);
    s.set_high_priority(t.obj_clear_local_forces);
    s.set_high_priority(t.obj_local_bounce);

    s.compile()
}

struct InteractionProto {
    name: String,
    pv1: usize,
    pv2: usize,
    rc: f32,
}

struct BouncerProto {
    bouncer: String,
    ov: usize,
    pv: usize,
}

struct WallProto {
    wall: String,
    pv: usize,
}

struct WallCheckProto {
    wall: String,
    every: u64,
}

struct SplitterProto {
    checker: String,
    src: usize,
    inside: Option<usize>,
    outside: Option<usize>,
}

struct CorrectionProto {
    checker: String,
    inside: Option<usize>,
    outside: Option<usize>,
    every: u64,
}

/// The per-rank simulation driver.
pub struct Simulation {
    comm: CartComm,
    inter: Option<InterComm>,
    state: SimulationState,
    checkpoint_every: u64,
    checkpoint_folder: PathBuf,
    rc_tolerance: f32,

    pvs: Vec<ParticleVector>,
    pv_index: HashMap<String, usize>,
    cell_lists: CellListStore,
    halo_maps: HashMap<usize, HaloOriginMap>,

    interactions: InteractionMap,
    integrators: BTreeMap<String, Box<dyn Integrator>>,
    bouncers: BTreeMap<String, Box<dyn Bouncer>>,
    walls: BTreeMap<String, Box<dyn Wall>>,
    checkers: BTreeMap<String, Box<dyn ObjectBelongingChecker>>,
    plugins: Vec<Box<dyn SimulationPlugin>>,

    pv_integrator: HashMap<String, String>,
    checker_ov: HashMap<String, usize>,
    interaction_protos: Vec<InteractionProto>,
    bouncer_protos: Vec<BouncerProto>,
    wall_protos: Vec<WallProto>,
    wall_check_protos: Vec<WallCheckProto>,
    splitter_protos: Vec<SplitterProto>,
    correction_protos: Vec<CorrectionProto>,
    pv_checkpoint_protos: Vec<(usize, u64)>,

    manager: InteractionManager,
    scheduler: TaskScheduler<Work>,
    tasks: Option<SimulationTasks>,
    engines: Option<Engines>,
    initialized: bool,
    restart_folder: Option<PathBuf>,
    next_tag_base: u64,
}

impl Simulation {
    /// Driver for one rank of the Cartesian world.
    pub fn new(comm: CartComm, inter: Option<InterComm>, config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let ranks = IVec3::from_array(config.ranks);
        if ranks != comm.dims() {
            return Err(SimulationError::Configuration(format!(
                "config rank grid {:?} does not match the communicator {:?}",
                config.ranks,
                comm.dims()
            )));
        }
        let domain = DomainInfo::new(Vec3::from_array(config.domain), comm.coords(), comm.dims());
        let state = SimulationState::new(config.dt, domain);
        tracing::info!(
            rank = comm.rank(),
            local = ?domain.local_size,
            start = ?domain.global_start,
            "simulation initialized"
        );
        Ok(Self {
            comm,
            inter,
            state,
            checkpoint_every: config.checkpoint_every,
            checkpoint_folder: PathBuf::from(&config.checkpoint_folder),
            rc_tolerance: config.rc_tolerance,
            pvs: Vec::new(),
            pv_index: HashMap::new(),
            cell_lists: CellListStore::default(),
            halo_maps: HashMap::new(),
            interactions: BTreeMap::new(),
            integrators: BTreeMap::new(),
            bouncers: BTreeMap::new(),
            walls: BTreeMap::new(),
            checkers: BTreeMap::new(),
            plugins: Vec::new(),
            pv_integrator: HashMap::new(),
            checker_ov: HashMap::new(),
            interaction_protos: Vec::new(),
            bouncer_protos: Vec::new(),
            wall_protos: Vec::new(),
            wall_check_protos: Vec::new(),
            splitter_protos: Vec::new(),
            correction_protos: Vec::new(),
            pv_checkpoint_protos: Vec::new(),
            manager: InteractionManager::new(),
            scheduler: TaskScheduler::new(),
            tasks: None,
            engines: None,
            initialized: false,
            restart_folder: None,
            next_tag_base: 0,
        })
    }

    /// Global clock and domain of this rank.
    pub fn state(&self) -> &SimulationState {
        &self.state
    }

    /// This rank's communicator index.
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Cutoffs of the cell lists built for a vector, largest first.
    /// Available once the driver initialised.
    pub fn cell_list_cutoffs(&self, name: &str) -> Result<Vec<f32>> {
        let idx = self.pv_idx(name)?;
        if self.cell_lists.lists.len() <= idx {
            return Err(SimulationError::Configuration(
                "cell lists are not prepared yet".into(),
            ));
        }
        Ok(self
            .cell_lists
            .of_pv(idx)
            .iter()
            .map(|cl| cl.info.rc)
            .collect())
    }

    /// Number of tasks due at `step` (constant across steps unless strides
    /// are involved).
    pub fn due_task_count(&self, step: u64) -> Result<usize> {
        Ok(self.scheduler.collect_due(step)?.len())
    }

    /// Largest cutoff across all registered interactions; this bounds the
    /// halo thickness.
    pub fn max_effective_cutoff(&self) -> f32 {
        self.manager.max_effective_cutoff()
    }

    /// Look up a registered particle vector.
    pub fn particle_vector(&self, name: &str) -> Result<&ParticleVector> {
        self.pv_index
            .get(name)
            .map(|&i| &self.pvs[i])
            .ok_or_else(|| SimulationError::Configuration(format!("no such particle vector: {name}")))
    }

    fn pv_idx(&self, name: &str) -> Result<usize> {
        self.pv_index
            .get(name)
            .copied()
            .ok_or_else(|| SimulationError::Configuration(format!("no such particle vector: {name}")))
    }

    fn ov_idx(&self, name: &str) -> Result<usize> {
        let idx = self.pv_idx(name)?;
        if !self.pvs[idx].is_object() {
            return Err(SimulationError::Configuration(format!(
                "no such object vector: {name}"
            )));
        }
        Ok(idx)
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name == "none" || name == "all" {
            return Err(SimulationError::Configuration(format!(
                "invalid name (reserved word or empty): '{name}'"
            )));
        }
        if name.starts_with('_') {
            return Err(SimulationError::Configuration(format!(
                "identifiers cannot start with an underscore: '{name}'"
            )));
        }
        Ok(())
    }

    fn next_tag(&mut self) -> u64 {
        self.next_tag_base += 1;
        self.next_tag_base
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a particle vector, populating it from `ic` (or its restart
    /// record on a restarted run).
    pub fn register_particle_vector(
        &mut self,
        mut pv: ParticleVector,
        ic: Option<Box<dyn InitialConditions>>,
        checkpoint_every: u64,
    ) -> Result<()> {
        Self::validate_name(pv.name())?;
        if self.pv_index.contains_key(pv.name()) {
            return Err(SimulationError::Configuration(format!(
                "more than one particle vector is called {}",
                pv.name()
            )));
        }

        if let Some(folder) = self.restart_folder.clone() {
            checkpoint::restart_pv(&mut pv, self.comm.rank(), &folder)?;
        } else if let Some(ic) = ic {
            ic.exec(self.comm.rank() as u32, &self.state, &mut pv)?;
        }

        if pv.is_object() {
            tracing::info!(
                ov = pv.name(),
                objects = pv.local_object_count()?,
                particles = pv.local.len(),
                "registered object vector"
            );
        } else {
            tracing::info!(pv = pv.name(), particles = pv.local.len(), "registered particle vector");
        }

        let idx = self.pvs.len();
        self.pv_index.insert(pv.name().to_string(), idx);
        self.pv_checkpoint_protos.push((idx, checkpoint_every));
        self.pvs.push(pv);
        Ok(())
    }

    /// Register an interaction under its own name.
    pub fn register_interaction(&mut self, mut interaction: Box<dyn Interaction>) -> Result<()> {
        let name = interaction.name().to_string();
        Self::validate_name(&name)?;
        if self.interactions.contains_key(&name) {
            return Err(SimulationError::Configuration(format!(
                "more than one interaction is called {name}"
            )));
        }
        if let Some(folder) = &self.restart_folder {
            interaction.restart(self.comm.rank(), folder)?;
        }
        self.interactions.insert(name, interaction);
        Ok(())
    }

    /// Register an integrator under its own name.
    pub fn register_integrator(&mut self, mut integrator: Box<dyn Integrator>) -> Result<()> {
        let name = integrator.name().to_string();
        Self::validate_name(&name)?;
        if self.integrators.contains_key(&name) {
            return Err(SimulationError::Configuration(format!(
                "more than one integrator is called {name}"
            )));
        }
        if let Some(folder) = &self.restart_folder {
            integrator.restart(self.comm.rank(), folder)?;
        }
        self.integrators.insert(name, integrator);
        Ok(())
    }

    /// Register a bouncer under its own name.
    pub fn register_bouncer(&mut self, mut bouncer: Box<dyn Bouncer>) -> Result<()> {
        let name = bouncer.name().to_string();
        Self::validate_name(&name)?;
        if self.bouncers.contains_key(&name) {
            return Err(SimulationError::Configuration(format!(
                "more than one bouncer is called {name}"
            )));
        }
        if let Some(folder) = &self.restart_folder {
            bouncer.restart(self.comm.rank(), folder)?;
        }
        self.bouncers.insert(name, bouncer);
        Ok(())
    }

    /// Register a wall; its integrity is checked every `check_every` steps
    /// (0 disables the check).
    pub fn register_wall(&mut self, mut wall: Box<dyn Wall>, check_every: u64) -> Result<()> {
        let name = wall.name().to_string();
        Self::validate_name(&name)?;
        if self.walls.contains_key(&name) {
            return Err(SimulationError::Configuration(format!(
                "more than one wall is called {name}"
            )));
        }
        wall.setup(&self.state.domain)?;
        if let Some(folder) = &self.restart_folder {
            wall.restart(self.comm.rank(), folder)?;
        }
        self.wall_check_protos.push(WallCheckProto {
            wall: name.clone(),
            every: check_every,
        });
        tracing::info!(wall = name.as_str(), "registered wall");
        self.walls.insert(name, wall);
        Ok(())
    }

    /// Register an object-belonging checker under its own name.
    pub fn register_object_belonging_checker(
        &mut self,
        mut checker: Box<dyn ObjectBelongingChecker>,
    ) -> Result<()> {
        let name = checker.name().to_string();
        Self::validate_name(&name)?;
        if self.checkers.contains_key(&name) {
            return Err(SimulationError::Configuration(format!(
                "more than one belonging checker is called {name}"
            )));
        }
        if let Some(folder) = &self.restart_folder {
            checker.restart(self.comm.rank(), folder)?;
        }
        self.checkers.insert(name, checker);
        Ok(())
    }

    /// Register a plugin.
    pub fn register_plugin(&mut self, mut plugin: Box<dyn SimulationPlugin>) -> Result<()> {
        let name = plugin.name().to_string();
        Self::validate_name(&name)?;
        if self.plugins.iter().any(|p| p.name() == name) {
            return Err(SimulationError::Configuration(format!(
                "more than one plugin is called {name}"
            )));
        }
        if let Some(folder) = &self.restart_folder {
            plugin.restart(self.comm.rank(), folder)?;
        }
        self.plugins.push(plugin);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    /// Bind an integrator to a particle vector.
    pub fn set_integrator(&mut self, integrator_name: &str, pv_name: &str) -> Result<()> {
        if !self.integrators.contains_key(integrator_name) {
            return Err(SimulationError::Configuration(format!(
                "no such integrator: {integrator_name}"
            )));
        }
        let idx = self.pv_idx(pv_name)?;
        if let Some(prev) = self.pv_integrator.get(pv_name) {
            return Err(SimulationError::Configuration(format!(
                "particle vector '{pv_name}' already set to integrator '{prev}'"
            )));
        }
        self.integrators[integrator_name].set_prerequisites(&mut self.pvs[idx])?;
        self.pv_integrator
            .insert(pv_name.to_string(), integrator_name.to_string());
        Ok(())
    }

    /// Wire an interaction between two particle vectors.
    pub fn set_interaction(&mut self, interaction_name: &str, pv1: &str, pv2: &str) -> Result<()> {
        let i1 = self.pv_idx(pv1)?;
        let i2 = self.pv_idx(pv2)?;
        let interaction = self.interactions.get(interaction_name).ok_or_else(|| {
            SimulationError::Configuration(format!("no such interaction: {interaction_name}"))
        })?;
        self.interaction_protos.push(InteractionProto {
            name: interaction_name.to_string(),
            pv1: i1,
            pv2: i2,
            rc: interaction.rc(),
        });
        Ok(())
    }

    /// Bounce `pv_name` particles off the objects of `ov_name`.
    pub fn set_bouncer(&mut self, bouncer_name: &str, ov_name: &str, pv_name: &str) -> Result<()> {
        let ov = self.ov_idx(ov_name)?;
        let pv = self.pv_idx(pv_name)?;
        let bouncer = self.bouncers.get_mut(bouncer_name).ok_or_else(|| {
            SimulationError::Configuration(format!("no such bouncer: {bouncer_name}"))
        })?;
        bouncer.setup(&self.pvs[ov])?;
        self.bouncer_protos.push(BouncerProto {
            bouncer: bouncer_name.to_string(),
            ov,
            pv,
        });
        Ok(())
    }

    /// Bounce `pv_name` particles off a wall.
    pub fn set_wall_bounce(&mut self, wall_name: &str, pv_name: &str) -> Result<()> {
        if !self.walls.contains_key(wall_name) {
            return Err(SimulationError::Configuration(format!(
                "no such wall: {wall_name}"
            )));
        }
        let pv = self.pv_idx(pv_name)?;
        self.wall_protos.push(WallProto {
            wall: wall_name.to_string(),
            pv,
        });
        Ok(())
    }

    /// Bind a belonging checker to the object vector whose geometry it tests.
    pub fn set_object_belonging_checker(&mut self, checker_name: &str, ov_name: &str) -> Result<()> {
        let ov = self.ov_idx(ov_name)?;
        let checker = self.checkers.get_mut(checker_name).ok_or_else(|| {
            SimulationError::Configuration(format!("no such belonging checker: {checker_name}"))
        })?;
        checker.setup(&self.pvs[ov])?;
        self.checker_ov.insert(checker_name.to_string(), ov);
        Ok(())
    }

    /// Split `source` into inside/outside vectors once at startup and then
    /// every `check_every` steps. Destination names may be `"none"` to drop
    /// that side; at least one destination must be the source itself.
    pub fn apply_object_belonging_checker(
        &mut self,
        checker_name: &str,
        source: &str,
        inside: &str,
        outside: &str,
        check_every: u64,
        checkpoint_every: u64,
    ) -> Result<()> {
        let src = self.pv_idx(source)?;
        if inside == outside {
            return Err(SimulationError::Configuration(format!(
                "splitting {source} into same vectors: {inside} and {outside}"
            )));
        }
        if source != inside && source != outside {
            return Err(SimulationError::Configuration(format!(
                "at least one split destination of {source} must be the source itself"
            )));
        }
        if !self.checker_ov.contains_key(checker_name) {
            return Err(SimulationError::Configuration(format!(
                "belonging checker '{checker_name}' is not bound to an object vector"
            )));
        }
        for dst in [inside, outside] {
            if dst != "none" && dst != source && self.pv_index.contains_key(dst) {
                return Err(SimulationError::Configuration(format!(
                    "cannot split into existing particle vector: {dst}"
                )));
            }
        }

        let mut resolve = |this: &mut Self, dst: &str| -> Result<Option<usize>> {
            if dst == "none" {
                return Ok(None);
            }
            if let Some(&i) = this.pv_index.get(dst) {
                return Ok(Some(i));
            }
            let pv = ParticleVector::new(dst, this.pvs[src].mass);
            this.register_particle_vector(pv, None, checkpoint_every)?;
            Ok(Some(this.pv_idx(dst)?))
        };
        let inside_idx = resolve(self, inside)?;
        let outside_idx = resolve(self, outside)?;

        self.splitter_protos.push(SplitterProto {
            checker: checker_name.to_string(),
            src,
            inside: inside_idx,
            outside: outside_idx,
        });
        if check_every > 0 {
            self.correction_protos.push(CorrectionProto {
                checker: checker_name.to_string(),
                inside: inside_idx,
                outside: outside_idx,
                every: check_every,
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Preparation phases
    // ------------------------------------------------------------------

    fn prepare_cell_lists(&mut self) -> Result<()> {
        tracing::info!("preparing cell-lists");
        let local_size = self.state.domain.local_size;

        let mut cutoffs: BTreeMap<usize, Vec<f32>> = BTreeMap::new();
        for proto in &self.interaction_protos {
            cutoffs.entry(proto.pv1).or_default().push(proto.rc);
            cutoffs.entry(proto.pv2).or_default().push(proto.rc);
        }

        self.cell_lists.lists = Vec::with_capacity(self.pvs.len());
        for idx in 0..self.pvs.len() {
            let mut rcs = cutoffs.get(&idx).cloned().unwrap_or_default();
            if rcs.is_empty() {
                rcs.push(DEFAULT_RC);
            }
            rcs.sort_by(|a, b| b.partial_cmp(a).expect("cutoffs are finite"));
            rcs.dedup_by(|a, b| (*a - *b).abs() < self.rc_tolerance);

            let mut lists = Vec::with_capacity(rcs.len());
            let mut primary = !self.pvs[idx].is_object();
            for rc in rcs {
                lists.push(CellList::new(rc, local_size, primary)?);
                primary = false;
            }
            self.cell_lists.lists.push(lists);
        }
        Ok(())
    }

    fn prepare_interactions(&mut self) -> Result<()> {
        tracing::info!("preparing interactions");
        for proto in &self.interaction_protos {
            let cl1 = select_best_cell_list(self.cell_lists.of_pv(proto.pv1), proto.rc, self.rc_tolerance)
                .ok_or_else(|| {
                    SimulationError::Configuration(format!(
                        "no cell list covers cutoff {} on particle vector {}",
                        proto.rc,
                        self.pvs[proto.pv1].name()
                    ))
                })?;
            let cl2 = select_best_cell_list(self.cell_lists.of_pv(proto.pv2), proto.rc, self.rc_tolerance)
                .ok_or_else(|| {
                    SimulationError::Configuration(format!(
                        "no cell list covers cutoff {} on particle vector {}",
                        proto.rc,
                        self.pvs[proto.pv2].name()
                    ))
                })?;
            let interaction = self.interactions.get(&proto.name).ok_or_else(|| {
                SimulationError::Configuration(format!("no such interaction: {}", proto.name))
            })?;
            self.manager.add(
                interaction.as_ref(),
                ManagedInteraction {
                    name: proto.name.clone(),
                    pv1: proto.pv1,
                    pv2: proto.pv2,
                    cl1: (proto.pv1, cl1),
                    cl2: (proto.pv2, cl2),
                    rc: proto.rc,
                    outputs: Vec::new(),
                },
                &mut self.pvs,
                &mut self.cell_lists,
            )?;
        }
        Ok(())
    }

    fn prepare_bouncers(&self) -> Result<()> {
        tracing::info!("preparing object bouncers");
        for proto in &self.bouncer_protos {
            let pv_name = self.pvs[proto.pv].name();
            if !self.pv_integrator.contains_key(pv_name) {
                return Err(SimulationError::Configuration(format!(
                    "setting bouncer '{}': particle vector '{pv_name}' has no integrator, required for bounce back",
                    proto.bouncer
                )));
            }
        }
        Ok(())
    }

    fn prepare_walls(&mut self) -> Result<()> {
        tracing::info!("preparing walls");
        for proto in &self.wall_protos {
            let pv_name = self.pvs[proto.pv].name();
            if !self.pv_integrator.contains_key(pv_name) {
                return Err(SimulationError::Configuration(format!(
                    "wall '{}' bounces particle vector '{pv_name}' which has no integrator",
                    proto.wall
                )));
            }
        }
        // everything that starts inside a wall goes, wall-interacting or not;
        // whole objects are left alone (they redistribute by center of mass)
        for wall in self.walls.values() {
            for pv in self.pvs.iter_mut().filter(|pv| !pv.is_object()) {
                wall.remove_inner(&self.state.domain, pv)?;
            }
        }
        Ok(())
    }

    fn prepare_engines(&mut self) -> Result<()> {
        tracing::info!("preparing exchange engines");
        let mut part_redistribute = ParticleRedistributor::new();
        let mut part_halo_intermediate = ParticleHaloExchanger::new();
        let mut part_halo_final = ParticleHaloExchanger::new();
        let mut obj_redistribute = ObjectRedistributor::new();
        let mut obj_halo_final = ObjectHaloExchanger::new();
        let mut obj_halo_intermediate = ObjectExtraExchanger::new();
        let mut obj_reverse_intermediate = ObjectReverseExchanger::new();
        let mut obj_reverse_final = ObjectReverseExchanger::new();

        for idx in 0..self.pvs.len() {
            if self.cell_lists.of_pv(idx).is_empty() {
                continue;
            }
            let cl_int = self.manager.largest_cell_list_for_intermediate(idx, &self.cell_lists);
            let cl_fin = self.manager.largest_cell_list_for_final(idx, &self.cell_lists);
            let extra_int = self.manager.extra_intermediate_channels(idx);
            let extra_fin = self.manager.extra_final_channels(idx);
            let produced_int = self.manager.intermediate_output_channels(idx);
            let rc0 = self.cell_lists.of_pv(idx)[0].info.rc;

            if !self.pvs[idx].is_object() {
                let tag = self.next_tag();
                part_redistribute.attach(idx, tag);
                if let Some(k) = cl_int {
                    let rc = self.cell_lists.get(k).info.rc;
                    let tag = self.next_tag();
                    part_halo_intermediate.attach(idx, rc, Vec::new(), tag);
                }
                if let Some(k) = cl_fin {
                    let rc = self.cell_lists.get(k).info.rc;
                    let tag = self.next_tag();
                    part_halo_final.attach(idx, rc, extra_int.clone(), tag);
                }
            } else {
                let tag = self.next_tag();
                obj_redistribute.attach(idx, tag);

                let extra_obj = self.extra_object_channels(idx);
                let tag = self.next_tag();
                obj_halo_final.attach(idx, rc0, extra_obj, tag);
                let tag = self.next_tag();
                obj_reverse_final.attach(idx, extra_fin, tag);
                let tag = self.next_tag();
                obj_halo_intermediate.attach(idx, produced_int.clone(), tag);
                let tag = self.next_tag();
                obj_reverse_intermediate.attach(idx, produced_int, tag);
            }
        }

        let single = self.comm.size() == 1;
        let wrap = |ex: Box<dyn crate::exchange::Exchanger>| -> Box<dyn ExchangeEngine> {
            if single {
                Box::new(SingleNodeEngine::new(ex))
            } else {
                Box::new(ClusterEngine::new(ex))
            }
        };
        self.engines = Some(Engines {
            part_redistribute: wrap(Box::new(part_redistribute)),
            part_halo_intermediate: wrap(Box::new(part_halo_intermediate)),
            part_halo_final: wrap(Box::new(part_halo_final)),
            obj_redistribute: wrap(Box::new(obj_redistribute)),
            obj_halo_final: wrap(Box::new(obj_halo_final)),
            obj_halo_intermediate: wrap(Box::new(obj_halo_intermediate)),
            obj_reverse_intermediate: wrap(Box::new(obj_reverse_intermediate)),
            obj_reverse_final: wrap(Box::new(obj_reverse_final)),
        });
        Ok(())
    }

    /// Extra particle channels of halo objects requested by bouncers and
    /// belonging checkers bound to this object vector.
    fn extra_object_channels(&self, ov: usize) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for proto in &self.bouncer_protos {
            if proto.ov == ov {
                for name in self.bouncers[&proto.bouncer].channels_to_exchange() {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        for (checker, &bound) in &self.checker_ov {
            if bound == ov {
                for name in self.checkers[checker].channels_to_exchange() {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names.sort();
        names
    }

    fn create_tasks(&mut self) {
        let mut s = TaskScheduler::new();
        let t = create_task_ids(&mut s);

        if self.checkpoint_every > 0 {
            s.add_task(t.checkpoint, Work::Checkpoint);
            s.set_every(t.checkpoint, self.checkpoint_every);
        } else {
            let protos: Vec<usize> = self
                .pv_checkpoint_protos
                .iter()
                .filter(|(_, every)| *every > 0)
                .map(|(idx, _)| *idx)
                .collect();
            if protos.is_empty() {
                s.set_every(t.checkpoint, 0);
            } else {
                for idx in protos {
                    s.add_task(t.checkpoint, Work::CheckpointPv(idx));
                }
            }
        }

        for idx in 0..self.pvs.len() {
            s.add_task(t.cell_lists, Work::BuildCellLists(idx));
            s.add_task(t.part_clear_intermediate, Work::ClearIntermediate(idx));
            s.add_task(t.part_clear_final, Work::ClearFinal(idx));
        }

        for (i, _) in self.plugins.iter().enumerate() {
            s.add_task(t.plugins_before_cell_lists, Work::Plugin(i, PluginHook::BeforeCellLists));
            s.add_task(t.plugins_before_forces, Work::Plugin(i, PluginHook::BeforeForces));
            s.add_task(t.plugins_serialize_send, Work::Plugin(i, PluginHook::SerializeAndSend));
            s.add_task(t.plugins_before_integration, Work::Plugin(i, PluginHook::BeforeIntegration));
            s.add_task(t.plugins_after_integration, Work::Plugin(i, PluginHook::AfterIntegration));
            s.add_task(
                t.plugins_before_particle_distribution,
                Work::Plugin(i, PluginHook::BeforeParticleDistribution),
            );
        }

        let has_plain = self.pvs.iter().any(|pv| !pv.is_object());
        if has_plain {
            s.add_task(t.part_halo_intermediate_init, Work::Engine(EngineKind::PartHaloIntermediate, EnginePhase::Init));
            s.add_task(t.part_halo_intermediate_finalize, Work::Engine(EngineKind::PartHaloIntermediate, EnginePhase::Finalize));
            s.add_task(t.part_halo_final_init, Work::Engine(EngineKind::PartHaloFinal, EnginePhase::Init));
            s.add_task(t.part_halo_final_finalize, Work::Engine(EngineKind::PartHaloFinal, EnginePhase::Finalize));
            s.add_task(t.part_redistribute_init, Work::Engine(EngineKind::PartRedistribute, EnginePhase::Init));
            s.add_task(t.part_redistribute_finalize, Work::Engine(EngineKind::PartRedistribute, EnginePhase::Finalize));
        }

        s.add_task(t.local_intermediate, Work::LocalIntermediate);
        s.add_task(t.halo_intermediate, Work::HaloIntermediate);
        s.add_task(t.local_forces, Work::LocalFinal);
        s.add_task(t.halo_forces, Work::HaloFinal);
        s.add_task(t.accumulate_intermediate, Work::AccumulateIntermediate);
        s.add_task(t.gather_intermediate, Work::GatherIntermediate);
        s.add_task(t.accumulate_final, Work::AccumulateFinal);

        let mut bound: Vec<usize> = self
            .pv_integrator
            .keys()
            .map(|name| self.pv_index[name])
            .collect();
        bound.sort_unstable();
        for idx in bound {
            s.add_task(t.integration, Work::Integrate(idx));
        }

        let object_idxs: Vec<usize> = (0..self.pvs.len()).filter(|&i| self.pvs[i].is_object()).collect();
        for &ov in &object_idxs {
            s.add_task(t.obj_clear_local_intermediate, Work::ObjClearLocalIntermediate(ov));
            s.add_task(t.obj_clear_halo_intermediate, Work::ObjClearHaloIntermediate(ov));
            s.add_task(t.obj_clear_local_forces, Work::ObjClearLocalForces(ov));
            s.add_task(t.obj_clear_halo_forces, Work::ObjClearHaloForces(ov));
        }

        for (i, _) in self.bouncer_protos.iter().enumerate() {
            s.add_task(t.obj_local_bounce, Work::BounceLocal(i));
            s.add_task(t.obj_halo_bounce, Work::BounceHalo(i));
        }

        for (i, _) in self.correction_protos.iter().enumerate() {
            s.add_task(t.correct_obj_belonging, Work::CorrectBelonging(i));
        }

        if !object_idxs.is_empty() {
            s.add_task(t.obj_halo_intermediate_init, Work::Engine(EngineKind::ObjHaloIntermediate, EnginePhase::Init));
            s.add_task(t.obj_halo_intermediate_finalize, Work::Engine(EngineKind::ObjHaloIntermediate, EnginePhase::Finalize));
            s.add_task(t.obj_halo_final_init, Work::Engine(EngineKind::ObjHaloFinal, EnginePhase::Init));
            s.add_task(t.obj_halo_final_finalize, Work::Engine(EngineKind::ObjHaloFinal, EnginePhase::Finalize));
            s.add_task(t.obj_reverse_intermediate_init, Work::Engine(EngineKind::ObjReverseIntermediate, EnginePhase::Init));
            s.add_task(t.obj_reverse_intermediate_finalize, Work::Engine(EngineKind::ObjReverseIntermediate, EnginePhase::Finalize));
            s.add_task(t.obj_reverse_final_init, Work::Engine(EngineKind::ObjReverseFinal, EnginePhase::Init));
            s.add_task(t.obj_reverse_final_finalize, Work::Engine(EngineKind::ObjReverseFinal, EnginePhase::Finalize));
            s.add_task(t.obj_redistribute_init, Work::Engine(EngineKind::ObjRedistribute, EnginePhase::Init));
            s.add_task(t.obj_redistribute_finalize, Work::Engine(EngineKind::ObjRedistribute, EnginePhase::Finalize));
        }

        for (i, _) in self.wall_protos.iter().enumerate() {
            s.add_task(t.wall_bounce, Work::WallBounce(i));
        }
        for (i, _) in self.wall_check_protos.iter().enumerate() {
            s.add_task(t.wall_check, Work::WallCheck(i));
        }

        self.scheduler = s;
        self.tasks = Some(t);
    }

    fn init(&mut self) -> Result<()> {
        tracing::info!("simulation initiated");
        self.prepare_cell_lists()?;
        self.prepare_interactions()?;
        self.prepare_bouncers()?;
        self.prepare_walls()?;
        self.manager.check()?;

        for plugin in &mut self.plugins {
            plugin.setup(&self.comm)?;
            plugin.handshake(self.inter.as_ref())?;
        }

        self.prepare_engines()?;
        tracing::info!(dt = self.state.dt, "time-step is set");

        self.create_tasks();
        {
            let tasks = self.tasks.as_ref().expect("just created");
            build_dependencies(&mut self.scheduler, tasks)?;
        }

        // initial preparation: objects need a halo and cleared forces before
        // the first bounce
        let boot = {
            let t = self.tasks.as_ref().expect("just created");
            [
                t.obj_halo_final_init,
                t.obj_halo_final_finalize,
                t.obj_clear_halo_forces,
                t.obj_clear_local_forces,
            ]
        };
        for id in boot {
            for work in self.scheduler.payloads(id) {
                self.dispatch(&work)?;
            }
        }

        self.exec_splitters()?;
        self.initialized = true;
        Ok(())
    }

    fn exec_splitters(&mut self) -> Result<()> {
        tracing::info!("splitting particle vectors with respect to object belonging");
        let protos: Vec<(String, usize, Option<usize>, Option<usize>)> = self
            .splitter_protos
            .iter()
            .map(|p| (p.checker.clone(), p.src, p.inside, p.outside))
            .collect();
        for (checker, src, inside, outside) in protos {
            self.split_by_belonging(&checker, src, inside, outside)?;
        }
        Ok(())
    }

    fn split_by_belonging(
        &mut self,
        checker_name: &str,
        src: usize,
        inside: Option<usize>,
        outside: Option<usize>,
    ) -> Result<()> {
        let ov = *self.checker_ov.get(checker_name).ok_or_else(|| {
            SimulationError::Configuration(format!(
                "belonging checker '{checker_name}' is not bound to an object vector"
            ))
        })?;
        let checker = self.checkers.get(checker_name).ok_or_else(|| {
            SimulationError::Configuration(format!("no such belonging checker: {checker_name}"))
        })?;
        let flags = checker.classify(&self.pvs[ov], &self.pvs[src].local.positions)?;

        let move_mask = |flags: &[bool], keep_inside: bool| -> Vec<bool> {
            flags.iter().map(|&f| f != keep_inside).collect()
        };

        match (inside, outside) {
            (Some(i), outside) if i == src => {
                // inside stays; outside moves out or is dropped
                let take = move_mask(&flags, true);
                if take.iter().any(|t| *t) {
                    let moved = self.pvs[src].local.split_off_by_mask(&take);
                    self.pvs[src].bump_motion_stamp();
                    if let Some(o) = outside {
                        self.pvs[o].local.append(&moved);
                        self.pvs[o].bump_motion_stamp();
                    }
                }
            }
            (inside, Some(o)) if o == src => {
                let take = move_mask(&flags, false);
                if take.iter().any(|t| *t) {
                    let moved = self.pvs[src].local.split_off_by_mask(&take);
                    self.pvs[src].bump_motion_stamp();
                    if let Some(i) = inside {
                        self.pvs[i].local.append(&moved);
                        self.pvs[i].bump_motion_stamp();
                    }
                }
            }
            _ => {
                return Err(SimulationError::Configuration(format!(
                    "belonging split of '{}' keeps neither side in place",
                    self.pvs[src].name()
                )))
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------

    /// Advance the simulation by `nsteps` timesteps.
    pub fn run(&mut self, nsteps: u64) -> Result<()> {
        if !self.initialized {
            self.init()?;
        }
        let begin = self.state.current_step;
        let end = begin + nsteps;
        tracing::info!(nsteps, begin, "will run iterations now");

        for step in begin..end {
            self.state.current_step = step;
            tracing::debug!(step, time = self.state.current_time, "timestep");

            let batches = self.scheduler.collect_due(step)?;
            for (id, works) in batches {
                for work in &works {
                    if let Err(e) = self.dispatch(work) {
                        tracing::error!(
                            task = self.scheduler.label(id),
                            error = %e,
                            "task failed, aborting the step"
                        );
                        return Err(e);
                    }
                }
            }
            self.state.current_time += self.state.dt as f64;
        }
        self.state.current_step = end;

        // finish the redistribution by rebuilding the cell-lists
        let cell_lists_task = self.tasks.as_ref().map(|t| t.cell_lists);
        if let Some(id) = cell_lists_task {
            for work in self.scheduler.payloads(id) {
                self.dispatch(&work)?;
            }
        }

        tracing::info!(nsteps, "finished iterations");
        self.comm.barrier();
        for plugin in &mut self.plugins {
            plugin.finalize()?;
        }
        if let Some(inter) = &self.inter {
            inter.send_shutdown_sentinel()?;
            tracing::debug!("sent stopping message to the postprocess");
        }
        Ok(())
    }

    /// Write the whole simulation state into the checkpoint folder.
    pub fn checkpoint(&mut self) -> Result<()> {
        let folder = self.checkpoint_folder.clone();
        checkpoint::ensure_folder(&folder)?;
        if self.comm.rank() == 0 {
            self.state.write_record(&folder.join(STATE_RECORD))?;
        }
        tracing::info!(folder = %folder.display(), "writing simulation state");
        let rank = self.comm.rank();
        for pv in &self.pvs {
            checkpoint::checkpoint_pv(pv, rank, &folder)?;
        }
        for b in self.bouncers.values() {
            b.checkpoint(rank, &folder)?;
        }
        for i in self.integrators.values() {
            i.checkpoint(rank, &folder)?;
        }
        for i in self.interactions.values() {
            i.checkpoint(rank, &folder)?;
        }
        for w in self.walls.values() {
            w.checkpoint(rank, &folder)?;
        }
        for c in self.checkers.values() {
            c.checkpoint(rank, &folder)?;
        }
        for p in &self.plugins {
            p.checkpoint(rank, &folder)?;
        }
        Ok(())
    }

    /// Read the whole simulation state back from `folder`. Components
    /// registered after this call read their records at registration time.
    pub fn restart(&mut self, folder: &Path) -> Result<()> {
        self.restart_folder = Some(folder.to_path_buf());
        self.state.read_record(&folder.join(STATE_RECORD))?;
        tracing::info!(folder = %folder.display(), "reading simulation state");

        let rank = self.comm.rank();
        for pv in &mut self.pvs {
            checkpoint::restart_pv(pv, rank, folder)?;
        }
        for b in self.bouncers.values_mut() {
            b.restart(rank, folder)?;
        }
        for i in self.integrators.values_mut() {
            i.restart(rank, folder)?;
        }
        for i in self.interactions.values_mut() {
            i.restart(rank, folder)?;
        }
        for w in self.walls.values_mut() {
            w.restart(rank, folder)?;
        }
        for c in self.checkers.values_mut() {
            c.restart(rank, folder)?;
        }
        for p in self.plugins.iter_mut() {
            p.restart(rank, folder)?;
        }
        Ok(())
    }

    /// Export the task dependency graph. With `current`, the graph of this
    /// driver's setup is written (initialising it if needed); otherwise the
    /// canonical graph with every task.
    pub fn save_dependency_graph(&mut self, path: &Path, current: bool) -> Result<()> {
        if self.comm.rank() != 0 {
            return Ok(());
        }
        if current {
            if !self.initialized {
                self.init()?;
            }
            self.scheduler.save_dependency_graph_graphml(path)
        } else {
            let mut s: TaskScheduler<Work> = TaskScheduler::new();
            let t = create_task_ids(&mut s);
            build_dependencies(&mut s, &t)?;
            s.save_dependency_graph_graphml(path)
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    fn dispatch(&mut self, work: &Work) -> Result<()> {
        let step = self.state.current_step;
        match work {
            Work::Checkpoint => self.checkpoint(),
            Work::CheckpointPv(idx) => {
                let every = self
                    .pv_checkpoint_protos
                    .iter()
                    .find(|(i, _)| i == idx)
                    .map(|(_, e)| *e)
                    .unwrap_or(0);
                if every > 0 && step % every == 0 {
                    let folder = self.checkpoint_folder.clone();
                    checkpoint::ensure_folder(&folder)?;
                    if self.comm.rank() == 0 {
                        self.state.write_record(&folder.join(STATE_RECORD))?;
                    }
                    checkpoint::checkpoint_pv(&self.pvs[*idx], self.comm.rank(), &folder)?;
                }
                Ok(())
            }
            Work::BuildCellLists(idx) => {
                let lists = &mut self.cell_lists.lists[*idx];
                for cl in lists.iter_mut() {
                    cl.build(&mut self.pvs[*idx])?;
                }
                Ok(())
            }
            Work::ClearIntermediate(idx) => {
                self.manager
                    .clear_intermediates(*idx, step, &mut self.pvs, &mut self.cell_lists)
            }
            Work::ClearFinal(idx) => {
                self.manager
                    .clear_final(*idx, step, &mut self.pvs, &mut self.cell_lists)
            }
            Work::Plugin(i, hook) => {
                let plugin = &mut self.plugins[*i];
                let mut ctx = PluginContext {
                    state: &self.state,
                    pvs: &mut self.pvs,
                };
                match hook {
                    PluginHook::BeforeCellLists => plugin.before_cell_lists(&mut ctx),
                    PluginHook::BeforeForces => plugin.before_forces(&mut ctx),
                    PluginHook::SerializeAndSend => {
                        plugin.serialize_and_send(&mut ctx, self.inter.as_ref())
                    }
                    PluginHook::BeforeIntegration => plugin.before_integration(&mut ctx),
                    PluginHook::AfterIntegration => plugin.after_integration(&mut ctx),
                    PluginHook::BeforeParticleDistribution => {
                        plugin.before_particle_distribution(&mut ctx)
                    }
                }
            }
            Work::Engine(kind, phase) => {
                let engines = self
                    .engines
                    .as_mut()
                    .ok_or_else(|| SimulationError::Invariant("engines not prepared".into()))?;
                let engine = match kind {
                    EngineKind::PartRedistribute => &mut engines.part_redistribute,
                    EngineKind::PartHaloIntermediate => &mut engines.part_halo_intermediate,
                    EngineKind::PartHaloFinal => &mut engines.part_halo_final,
                    EngineKind::ObjRedistribute => &mut engines.obj_redistribute,
                    EngineKind::ObjHaloFinal => &mut engines.obj_halo_final,
                    EngineKind::ObjHaloIntermediate => &mut engines.obj_halo_intermediate,
                    EngineKind::ObjReverseIntermediate => &mut engines.obj_reverse_intermediate,
                    EngineKind::ObjReverseFinal => &mut engines.obj_reverse_final,
                };
                let mut world = World {
                    state: &self.state,
                    pvs: &mut self.pvs,
                    cell_lists: &mut self.cell_lists,
                    halo_maps: &mut self.halo_maps,
                };
                match phase {
                    EnginePhase::Init => engine.init(&mut self.comm, &mut world),
                    EnginePhase::Finalize => engine.finalize(&mut self.comm, &mut world),
                }
            }
            Work::LocalIntermediate => self.manager.execute_local_intermediate(
                &self.state,
                &self.interactions,
                &mut self.pvs,
                &mut self.cell_lists,
            ),
            Work::HaloIntermediate => self.manager.execute_halo_intermediate(
                &self.state,
                &self.interactions,
                &mut self.pvs,
                &mut self.cell_lists,
            ),
            Work::LocalFinal => self.manager.execute_local_final(
                &self.state,
                &self.interactions,
                &mut self.pvs,
                &mut self.cell_lists,
            ),
            Work::HaloFinal => self.manager.execute_halo_final(
                &self.state,
                &self.interactions,
                &mut self.pvs,
                &mut self.cell_lists,
            ),
            Work::AccumulateIntermediate => {
                self.manager
                    .accumulate_intermediates(step, &mut self.pvs, &mut self.cell_lists)
            }
            Work::GatherIntermediate => {
                self.manager
                    .gather_intermediate(step, &mut self.pvs, &mut self.cell_lists)
            }
            Work::AccumulateFinal => {
                self.manager
                    .accumulate_final(step, &mut self.pvs, &mut self.cell_lists)
            }
            Work::Integrate(idx) => {
                let pv_name = self.pvs[*idx].name().to_string();
                let integrator_name = self.pv_integrator.get(&pv_name).ok_or_else(|| {
                    SimulationError::Configuration(format!(
                        "particle vector '{pv_name}' has no integrator"
                    ))
                })?;
                self.integrators[integrator_name].execute(&self.state, &mut self.pvs[*idx])
            }
            Work::ObjClearLocalIntermediate(ov) => {
                self.manager
                    .clear_intermediates(*ov, step, &mut self.pvs, &mut self.cell_lists)?;
                self.manager
                    .clear_intermediates_partition(*ov, step, false, &mut self.pvs)
            }
            Work::ObjClearHaloIntermediate(ov) => {
                self.manager
                    .clear_intermediates_partition(*ov, step, true, &mut self.pvs)
            }
            Work::ObjClearLocalForces(ov) => {
                self.manager
                    .clear_final(*ov, step, &mut self.pvs, &mut self.cell_lists)?;
                self.manager
                    .clear_final_partition(*ov, step, false, &mut self.pvs)
            }
            Work::ObjClearHaloForces(ov) => {
                self.manager
                    .clear_final_partition(*ov, step, true, &mut self.pvs)
            }
            Work::BounceLocal(i) => {
                let proto = &self.bouncer_protos[*i];
                let bouncer = &self.bouncers[&proto.bouncer];
                let (ov, pv) = crate::world::two_mut(&mut self.pvs, proto.ov, proto.pv)?;
                bouncer.bounce_local(&self.state, ov, pv)
            }
            Work::BounceHalo(i) => {
                let proto = &self.bouncer_protos[*i];
                let bouncer = &self.bouncers[&proto.bouncer];
                let (ov, pv) = crate::world::two_mut(&mut self.pvs, proto.ov, proto.pv)?;
                bouncer.bounce_halo(&self.state, ov, pv)
            }
            Work::CorrectBelonging(i) => {
                let proto = &self.correction_protos[*i];
                if proto.every == 0 || step % proto.every != 0 {
                    return Ok(());
                }
                let checker = proto.checker.clone();
                let (inside, outside) = (proto.inside, proto.outside);
                if let Some(pv_in) = inside {
                    self.split_by_belonging(&checker, pv_in, inside, outside)?;
                }
                if let Some(pv_out) = outside {
                    self.split_by_belonging(&checker, pv_out, inside, outside)?;
                }
                Ok(())
            }
            Work::WallBounce(i) => {
                let proto = &self.wall_protos[*i];
                let wall = &self.walls[&proto.wall];
                wall.bounce(&self.state, &mut self.pvs[proto.pv])
            }
            Work::WallCheck(i) => {
                let proto = &self.wall_check_protos[*i];
                if proto.every == 0 || step % proto.every != 0 {
                    return Ok(());
                }
                let wall = &self.walls[&proto.wall];
                for bounce_proto in &self.wall_protos {
                    if bounce_proto.wall == proto.wall {
                        wall.check(&self.state, &self.pvs[bounce_proto.pv])?;
                    }
                }
                Ok(())
            }
        }
    }
}
