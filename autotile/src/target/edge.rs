use crate::common::Dtype;
use crate::target::{npu::NpuTarget, TargetId};

use serde::Serialize;

/// A vector-only inference part with a smaller unified buffer.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Default, Debug, Serialize)]
pub struct EdgeTarget;

impl NpuTarget for EdgeTarget {
    const CORES: u32 = 8;
    const UB_BYTES: u64 = 196_608;
    const L1_BYTES: u64 = 0;
    const L0C_BYTES: u64 = 0;
    const ATOMIC_DTYPES: &'static [Dtype] = &[];

    fn target_id() -> TargetId {
        TargetId::Edge
    }
}
