//! Particle Data Model and Pairwise Kernels
//!
//! This crate provides the data side of the mesoscale particle-flow engine.
//! It is deliberately orchestration-free: everything per-step (exchange,
//! scheduling, the driver) lives in the `orchestrator` crate.
//!
//! # Modules
//! - [`state`] -- global clock and subdomain geometry.
//! - [`channels`] -- named typed buffers with persistence flags.
//! - [`particles`] -- particle/object vectors with local and halo partitions.
//! - [`celllist`] -- uniform-grid spatial indices (primary and secondary).
//! - [`interactions`] -- the interaction trait seam plus DPD / density / MDPD
//!   reference kernels.
//! - [`integrators`], [`bouncers`], [`walls`], [`belonging`], [`ic`] -- the
//!   remaining component seams with one analytic implementation each.

#![warn(missing_docs)]

pub mod belonging;
pub mod bouncers;
pub mod celllist;
pub mod channels;
pub mod error;
pub mod ic;
pub mod integrators;
pub mod interactions;
pub mod particles;
pub mod state;
pub mod walls;

pub use celllist::{CellList, CellListInfo};
pub use channels::{channel_names, ChannelData, ComExtent, DataKind, ExtraDataManager, Persistence, Stress};
pub use error::{Result, SimulationError};
pub use interactions::{Interaction, InteractionStage};
pub use particles::{particle_id, Mesh, ObjectInfo, ParticleStorage, ParticleVector};
pub use state::{DomainInfo, SimulationState};
