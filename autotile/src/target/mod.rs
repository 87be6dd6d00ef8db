mod cloud;
mod edge;
mod npu;

pub use cloud::CloudTarget;
pub use edge::EdgeTarget;
pub use npu::{BufferScope, SCOPE_COUNT};

use crate::common::Dtype;

use std::fmt::Debug;

/// Hardware parameters of an accelerator, consumed by the generator and the
/// schedulers.
pub trait Target:
    Clone + Copy + std::hash::Hash + Eq + Default + Debug + Send + Sync + 'static
{
    /// Get corresponding [TargetId] enum
    fn target_id() -> TargetId;

    fn core_count() -> u32;

    /// The alignment unit of on-chip buffers and DMA transfers.
    fn block_bytes() -> u32;

    /// Bytes available in `scope`. Off-chip scopes are unbounded.
    fn capacity(scope: BufferScope) -> u64;

    fn supports_atomic_add(dtype: Dtype) -> bool;

    fn has_cube_unit() -> bool;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TargetId {
    #[default]
    Cloud,
    Edge,
}
