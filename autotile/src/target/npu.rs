use crate::common::Dtype;
use crate::target::{Target, TargetId};

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

pub const SCOPE_COUNT: usize = 5;

pub(super) trait NpuTarget:
    Clone + Copy + std::hash::Hash + Eq + Default + Debug + Send + Sync + 'static
{
    const CORES: u32;
    const UB_BYTES: u64;
    const L1_BYTES: u64;
    /// Zero when the target has no cube unit.
    const L0C_BYTES: u64;
    const ATOMIC_DTYPES: &'static [Dtype];

    fn target_id() -> TargetId;
}

#[derive(
    Eq, PartialEq, PartialOrd, Ord, Debug, Copy, Clone, Hash, Deserialize, Serialize, strum::EnumIter,
)]
pub enum BufferScope {
    Global,
    /// Global memory reserved per launch for partial results.
    Workspace,
    Ub,
    L1,
    L0c,
}

impl<T: NpuTarget> Target for T {
    fn target_id() -> TargetId {
        <Self as NpuTarget>::target_id()
    }

    fn core_count() -> u32 {
        T::CORES
    }

    fn block_bytes() -> u32 {
        32
    }

    fn capacity(scope: BufferScope) -> u64 {
        match scope {
            BufferScope::Global | BufferScope::Workspace => u64::MAX,
            BufferScope::Ub => T::UB_BYTES,
            BufferScope::L1 => T::L1_BYTES,
            BufferScope::L0c => T::L0C_BYTES,
        }
    }

    fn supports_atomic_add(dtype: Dtype) -> bool {
        T::ATOMIC_DTYPES.contains(&dtype)
    }

    fn has_cube_unit() -> bool {
        T::L0C_BYTES > 0
    }
}

impl BufferScope {
    pub fn index(&self) -> usize {
        match self {
            BufferScope::Global => 0,
            BufferScope::Workspace => 1,
            BufferScope::Ub => 2,
            BufferScope::L1 => 3,
            BufferScope::L0c => 4,
        }
    }

    pub fn is_on_chip(&self) -> bool {
        matches!(self, BufferScope::Ub | BufferScope::L1 | BufferScope::L0c)
    }
}

impl Display for BufferScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match &self {
                BufferScope::Global => "GM",
                BufferScope::Workspace => "WS",
                BufferScope::Ub => "UB",
                BufferScope::L1 => "L1",
                BufferScope::L0c => "L0C",
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{CloudTarget, EdgeTarget};
    use strum::IntoEnumIterator;

    #[test]
    fn test_scope_indices_are_dense() {
        let mut seen = [false; SCOPE_COUNT];
        for scope in BufferScope::iter() {
            assert!(!std::mem::replace(&mut seen[scope.index()], true));
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_off_chip_scopes_are_unbounded() {
        assert_eq!(CloudTarget::capacity(BufferScope::Global), u64::MAX);
        assert_eq!(EdgeTarget::capacity(BufferScope::Workspace), u64::MAX);
    }

    #[test]
    fn test_cube_unit_and_atomics_per_target() {
        assert!(CloudTarget::has_cube_unit());
        assert!(!EdgeTarget::has_cube_unit());
        assert!(CloudTarget::supports_atomic_add(Dtype::Float32));
        assert!(!CloudTarget::supports_atomic_add(Dtype::Int8));
        assert!(!EdgeTarget::supports_atomic_add(Dtype::Float32));
    }
}
