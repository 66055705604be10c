//! Plugin hooks.
//!
//! Plugins observe the simulation at six fixed points of the step. Within a
//! single hook the order of plugins is unspecified; authors must not assume
//! mutual ordering. A plugin may declare a postprocess counterpart that
//! receives its serialized payloads over the inter-communicator.

use std::path::Path;

use kernel::error::Result;
use kernel::particles::ParticleVector;
use kernel::state::SimulationState;

use crate::comm::{CartComm, InterComm};

/// What a hook may see and touch.
pub struct PluginContext<'a> {
    /// Global clock.
    pub state: &'a SimulationState,
    /// Every registered particle vector.
    pub pvs: &'a mut [ParticleVector],
}

/// The six timestep phases at which plugins run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginHook {
    /// Before cell lists are rebuilt.
    BeforeCellLists,
    /// After force clears, before any force kernel.
    BeforeForces,
    /// Once per step, for shipping data to the postprocess side.
    SerializeAndSend,
    /// After forces are final, before integration.
    BeforeIntegration,
    /// After integration and bounces.
    AfterIntegration,
    /// Right before particles are redistributed.
    BeforeParticleDistribution,
}

/// An external observer wired into the task graph.
#[allow(unused_variables)]
pub trait SimulationPlugin: Send {
    /// Unique name used in registration and logs.
    fn name(&self) -> &str;

    /// One-time setup with the Cartesian communicator.
    fn setup(&mut self, comm: &CartComm) -> Result<()> {
        Ok(())
    }

    /// Handshake with the postprocess counterpart, when one exists.
    fn handshake(&mut self, inter: Option<&InterComm>) -> Result<()> {
        Ok(())
    }

    /// Whether this plugin has a postprocess counterpart.
    fn need_postprocess(&self) -> bool {
        false
    }

    /// Hook: before cell lists.
    fn before_cell_lists(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Hook: before forces.
    fn before_forces(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Hook: serialize and send to the postprocess side.
    fn serialize_and_send(
        &mut self,
        ctx: &mut PluginContext<'_>,
        inter: Option<&InterComm>,
    ) -> Result<()> {
        Ok(())
    }

    /// Hook: before integration.
    fn before_integration(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Hook: after integration.
    fn after_integration(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Hook: before particle redistribution.
    fn before_particle_distribution(&mut self, ctx: &mut PluginContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Called once after the run loop.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write private state to a restart folder.
    fn checkpoint(&self, rank: usize, folder: &Path) -> Result<()> {
        Ok(())
    }

    /// Read private state back.
    fn restart(&mut self, rank: usize, folder: &Path) -> Result<()> {
        Ok(())
    }
}

/// Momentum / kinetic-energy reporter. Logs every `every` steps and ships the
/// same record to the postprocess side when connected.
pub struct StatsPlugin {
    name: String,
    every: u64,
}

impl StatsPlugin {
    /// Stats reporter with the given cadence.
    pub fn new(name: &str, every: u64) -> Self {
        Self {
            name: name.to_string(),
            every,
        }
    }
}

impl SimulationPlugin for StatsPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn need_postprocess(&self) -> bool {
        true
    }

    fn serialize_and_send(
        &mut self,
        ctx: &mut PluginContext<'_>,
        inter: Option<&InterComm>,
    ) -> Result<()> {
        if self.every == 0 || ctx.state.current_step % self.every != 0 {
            return Ok(());
        }
        let mut momentum = glam::Vec3::ZERO;
        let mut kinetic = 0.0f64;
        let mut count = 0usize;
        for pv in ctx.pvs.iter() {
            for &v in &pv.local.velocities {
                momentum += pv.mass * v;
                kinetic += 0.5 * (pv.mass * v.length_squared()) as f64;
            }
            count += pv.local.len();
        }
        tracing::info!(
            step = ctx.state.current_step,
            particles = count,
            px = momentum.x,
            py = momentum.y,
            pz = momentum.z,
            kinetic,
            "stats"
        );
        if let Some(inter) = inter {
            let mut payload = Vec::with_capacity(8 + 12 + 8);
            payload.extend_from_slice(&ctx.state.current_step.to_le_bytes());
            payload.extend_from_slice(bytemuck::bytes_of(&momentum));
            payload.extend_from_slice(&kinetic.to_le_bytes());
            inter.send(1, payload)?;
        }
        Ok(())
    }
}
