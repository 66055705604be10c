//! The exchange layer: pack / send / recv / unpack for halos and
//! redistribution.
//!
//! An [`Exchanger`] knows *what* to ship for each attached particle vector;
//! an [`engine::ExchangeEngine`] knows *how* bytes move (buffer swap on one
//! rank, tagged messages across ranks). Every exchange is a two-phase
//! operation: `init` packs and sends, `finalize` receives and unpacks, and
//! the scheduler is free to run unrelated work in between.

pub mod engine;
pub mod helper;
pub mod objects;
pub mod particles;

pub use engine::{ClusterEngine, ExchangeEngine, SingleNodeEngine};
pub use helper::{ExchangeHelper, PackSpec};
pub use objects::{ObjectExtraExchanger, ObjectHaloExchanger, ObjectRedistributor, ObjectReverseExchanger};
pub use particles::{ParticleHaloExchanger, ParticleRedistributor};

use kernel::error::Result;

use crate::world::World;

/// Packing/unpacking policy of one exchange kind over its attached vectors.
pub trait Exchanger: Send {
    /// Short label for logs.
    fn label(&self) -> &'static str;

    /// Number of attached particle vectors.
    fn count(&self) -> usize;

    /// Buffer bookkeeping of attachment `i`.
    fn helper(&self, i: usize) -> &ExchangeHelper;

    /// Mutable buffer bookkeeping of attachment `i`.
    fn helper_mut(&mut self, i: usize) -> &mut ExchangeHelper;

    /// Whether attachment `i` has anything to do this round.
    fn need_exchange(&self, _i: usize, _world: &World) -> bool {
        true
    }

    /// Count entities per fragment and size the send side.
    fn prepare_sizes(&mut self, i: usize, world: &mut World) -> Result<()>;

    /// Fill the send buffer (and apply any local side effects, e.g.
    /// compacting away leavers).
    fn prepare_data(&mut self, i: usize, world: &mut World) -> Result<()>;

    /// Unpack the receive side into the target partition.
    fn combine_and_upload(&mut self, i: usize, world: &mut World) -> Result<()>;
}
