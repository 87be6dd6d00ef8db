use crate::common::Dtype;
use crate::target::{npu::NpuTarget, TargetId};

use serde::Serialize;

/// A datacenter part: many cores, atomic accumulate in global memory and a
/// cube unit.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Debug, Serialize)]
pub struct CloudTarget;

impl NpuTarget for CloudTarget {
    const CORES: u32 = 32;
    const UB_BYTES: u64 = 262_144;
    const L1_BYTES: u64 = 1_048_576;
    const L0C_BYTES: u64 = 262_144;
    const ATOMIC_DTYPES: &'static [Dtype] = &[Dtype::Float32, Dtype::Float16];

    fn target_id() -> TargetId {
        TargetId::Cloud
    }
}
