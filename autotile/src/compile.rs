use log::{info, warn};
use rayon::prelude::*;
use std::fmt;
use std::num::NonZeroUsize;

use crate::axis::iteration_axes;
use crate::classify::{classify, ClassificationError, Pattern};
use crate::common::shape_range_string;
use crate::dag::ComputeDag;
use crate::dispatch::TableEntry;
use crate::encode::encode;
use crate::generate::{generate_cases_with, GenerationError, InnermostContiguous, SplitHeuristic};
use crate::schedule::{build_schedule, Schedule, ScheduleError};
use crate::target::Target;

pub struct CompileOptions {
    /// Worker threads for building cases. All cores when `None`.
    pub jobs: Option<NonZeroUsize>,
    pub heuristic: Box<dyn SplitHeuristic>,
}

/// The schedules and dispatch entries of one operator, in generation order.
#[derive(Debug, Clone)]
pub struct CompiledOperator {
    pub name: String,
    pub pattern: Pattern,
    pub schedules: Vec<Schedule>,
    pub entries: Vec<TableEntry>,
}

#[derive(thiserror::Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("Every {pattern} case failed to schedule over {shape_range}")]
    AllCasesFailed {
        pattern: Pattern,
        shape_range: String,
    },
    #[error("Failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            jobs: None,
            heuristic: Box::new(InnermostContiguous),
        }
    }
}

impl fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOptions")
            .field("jobs", &self.jobs)
            .field("heuristic", &self.heuristic.name())
            .finish()
    }
}

impl CompileOptions {
    fn in_pool<R: Send>(&self, f: impl FnOnce() -> R + Send) -> Result<R, CompileError> {
        match self.jobs {
            Some(jobs) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(jobs.get())
                    .build()?;
                Ok(pool.install(f))
            }
            None => Ok(f()),
        }
    }
}

/// Classifies `dag`, enumerates its tiling cases and builds a schedule for
/// each on the worker pool.
///
/// Cases that fail to schedule are logged and dropped; the operator fails
/// only if none survive.
pub fn compile_operator<Tgt: Target>(
    name: &str,
    dag: &ComputeDag,
    opts: &CompileOptions,
) -> Result<CompiledOperator, CompileError> {
    opts.in_pool(|| compile_in_pool::<Tgt>(name, dag, opts))?
}

/// Compiles independent operators in parallel. One result per operator, in
/// input order; a failing operator does not affect the others.
pub fn compile_many<Tgt: Target>(
    operators: &[(String, ComputeDag)],
    opts: &CompileOptions,
) -> Vec<Result<CompiledOperator, CompileError>> {
    let compile_all = || {
        operators
            .par_iter()
            .map(|(name, dag)| compile_in_pool::<Tgt>(name, dag, opts))
            .collect::<Vec<_>>()
    };
    match opts.in_pool(compile_all) {
        Ok(results) => results,
        Err(err) => {
            warn!("falling back to the global pool: {}", err);
            compile_all()
        }
    }
}

fn compile_in_pool<Tgt: Target>(
    name: &str,
    dag: &ComputeDag,
    opts: &CompileOptions,
) -> Result<CompiledOperator, CompileError> {
    let pattern = classify(dag)?;
    let cases = generate_cases_with::<Tgt>(dag, pattern, opts.heuristic.as_ref())?;
    let built = cases
        .par_iter()
        .map(|case| build_schedule::<Tgt>(dag, case))
        .collect::<Vec<_>>();

    let mut schedules = Vec::with_capacity(built.len());
    for (case, result) in cases.iter().zip(built) {
        match result {
            Ok(schedule) => schedules.push(schedule),
            Err(err @ ScheduleError::StorageOverflow { .. }) => {
                warn!("{}: dropping case {}: {}", name, case.tiling_key(), err)
            }
            Err(err) => warn!("{}: case {} failed: {}", name, case.tiling_key(), err),
        }
    }
    if schedules.is_empty() {
        let dims = iteration_axes(dag, pattern, None)
            .iter()
            .map(|a| a.extent)
            .collect::<Vec<_>>();
        return Err(CompileError::AllCasesFailed {
            pattern,
            shape_range: shape_range_string(&dims),
        });
    }

    let entries = schedules
        .iter()
        .filter_map(|s| {
            let artifact = format!("{}_{}", name, s.case.tiling_key());
            match encode(&s.case) {
                Ok(bytes) => Some(TableEntry { artifact, bytes }),
                Err(err) => {
                    warn!("Excluding artifact {}: {}", artifact, err);
                    None
                }
            }
        })
        .collect::<Vec<_>>();
    info!(
        "compiled {} ({}): {} of {} cases",
        name,
        pattern,
        schedules.len(),
        cases.len()
    );
    Ok(CompiledOperator {
        name: name.to_owned(),
        pattern,
        schedules,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::case::SpecialPattern;
    use crate::common::{DimRange, Dtype};
    use crate::dag::{ElemOp, ReduceOp, Window};
    use crate::dispatch::DispatchTable;
    use crate::target::{CloudTarget, EdgeTarget};

    fn add(extent: DimRange) -> ComputeDag {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![extent], Dtype::Float32);
        let y = b.placeholder(vec![extent], Dtype::Float32);
        let z = b.elementwise(ElemOp::Add, &[x, y]);
        b.output(z);
        b.build().unwrap()
    }

    fn conv(cin: DimRange) -> ComputeDag {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(
            vec![
                DimRange::new(1, 4),
                cin,
                DimRange::new(8, 512),
                DimRange::new(8, 512),
            ],
            Dtype::Float16,
        );
        let w = b.placeholder(
            vec![DimRange::known(64), cin, DimRange::known(3), DimRange::known(3)],
            Dtype::Float16,
        );
        let window = Window {
            kernel: [3, 3],
            stride: [1, 1],
            pad: [1, 1, 1, 1],
        };
        let c = b.conv2d(x, w, window);
        b.output(c);
        b.build().unwrap()
    }

    #[test]
    fn test_elementwise_add_compiles_three_cases() {
        let compiled =
            compile_operator::<CloudTarget>("add", &add(DimRange::new(1, 65536)), &CompileOptions::default())
                .unwrap();
        assert_eq!(compiled.pattern, Pattern::ElementwiseOnly);
        assert_eq!(compiled.schedules.len(), 3);
        assert_eq!(compiled.entries.len(), 3);
        assert_eq!(compiled.schedules[0].case.special, SpecialPattern::SingleCore);
        for (s, e) in compiled.schedules.iter().zip(&compiled.entries) {
            assert_eq!(e.artifact, format!("add_{}", s.case.tiling_key()));
        }
        let table = DispatchTable::from_encoded(&compiled.entries);
        assert!(table.select(&[1], None).is_some());
        assert!(table.select(&[65536], None).is_some());
    }

    #[test]
    fn test_job_count_does_not_change_output() {
        let mut b = ComputeDag::builder();
        let x = b.placeholder(vec![DimRange::new(1, 2048), DimRange::unbounded(1)], Dtype::Float32);
        let r = b.reduce(ReduceOp::Sum, x, &[1], false);
        b.output(r);
        let dag = b.build().unwrap();
        let serial = CompileOptions {
            jobs: NonZeroUsize::new(1),
            ..CompileOptions::default()
        };
        let a = compile_operator::<CloudTarget>("sum", &dag, &serial).unwrap();
        let b = compile_operator::<CloudTarget>("sum", &dag, &CompileOptions::default()).unwrap();
        assert_eq!(a.entries, b.entries);
        assert_eq!(a.schedules, b.schedules);
    }

    #[test]
    fn test_unschedulable_operator_fails_all_cases() {
        let err = compile_operator::<CloudTarget>(
            "conv",
            &conv(DimRange::unbounded(1)),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CompileError::AllCasesFailed {
                pattern: Pattern::Cube,
                ..
            }
        ));
    }

    #[test]
    fn test_compile_many_isolates_failures() {
        let operators = vec![
            ("add".to_owned(), add(DimRange::new(1, 4096))),
            ("conv".to_owned(), conv(DimRange::known(16))),
            ("add_big".to_owned(), add(DimRange::new(1, 1 << 20))),
        ];
        let results = compile_many::<EdgeTarget>(&operators, &CompileOptions::default());
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(CompileError::Generation(GenerationError::NoSubGenerator(Pattern::Cube)))
        ));
        assert_eq!(results[2].as_ref().map(|c| c.name.as_str()).ok(), Some("add_big"));
    }
}
