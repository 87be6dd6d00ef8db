#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use log::{info, warn};

use std::num::NonZeroUsize;
use std::path;

use autotile::common::{AxisId, DimRange, Dtype, DIM_MAX};
use autotile::compile::{compile_operator, CompileOptions};
use autotile::dag::{ComputeDag, ElemOp, PoolMode, ReduceOp, Window};
use autotile::dispatch::{read_table, write_table, DispatchTable};
use autotile::pprint::{pprint_cases, pprint_schedule, PrintFormat};
use autotile::target::{CloudTarget, EdgeTarget, Target, TargetId};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target accelerator
    #[arg(long, value_enum, hide_default_value = true, default_value_t = TargetId::default())]
    target: TargetId,

    /// Number of parallel jobs for building cases
    #[arg(long, short)]
    jobs: Option<NonZeroUsize>,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = PrintFormat::Cases)]
    format: PrintFormat,

    /// Write the compiled dispatch table to this path
    #[arg(long)]
    table: Option<path::PathBuf>,

    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(clap::Subcommand)]
enum Subcommand {
    #[command(about = "Compile an elementwise add of two 1-D tensors")]
    Add {
        #[arg(long, default_value = "65536")]
        max: u64,
        #[arg(long, default_value = "f32")]
        dtype: Dtype,
    },
    #[command(about = "Compile a row-vector add broadcast over a matrix")]
    BroadcastAdd {
        #[arg(long, default_value = "4096")]
        rows: u64,
        #[arg(long, default_value = "4096")]
        cols: u64,
    },
    #[command(about = "Compile a sum over the last axis")]
    ReduceSum {
        #[arg(long, default_value = "4096")]
        rows: u64,
        /// Largest column count; 0 leaves it unbounded
        #[arg(long, default_value = "0")]
        cols: u64,
        /// Take the reduce axes at runtime
        #[arg(long, default_value_t = false)]
        dynamic_axis: bool,
    },
    #[command(about = "Compile a row-wise softmax")]
    Softmax {
        #[arg(long, default_value = "1024")]
        rows: u64,
        #[arg(long, default_value = "0")]
        cols: u64,
    },
    #[command(about = "Compile a 2-D max pool")]
    MaxPool {
        #[arg(long, default_value = "3")]
        kernel: u32,
        #[arg(long, default_value = "2")]
        stride: u32,
        #[arg(long, default_value = "256")]
        max_size: u64,
    },
    #[command(about = "Compile a 2-D convolution")]
    Conv2d {
        #[arg(long, default_value = "16")]
        channels: u64,
        #[arg(long, default_value = "32")]
        filters: u64,
        #[arg(long, default_value = "3")]
        kernel: u32,
        #[arg(long, default_value = "256")]
        max_size: u64,
    },
    #[command(about = "Print the case a dispatch table selects for a shape")]
    Select {
        #[arg(long)]
        table: path::PathBuf,
        /// Runtime reduce axes of a dynamic-axis reduce
        #[arg(long, value_delimiter = ',')]
        reduce_axes: Option<Vec<AxisId>>,
        #[arg(required = true)]
        dims: Vec<u64>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    match &args.target {
        TargetId::Cloud => main_per_target::<CloudTarget>(&args),
        TargetId::Edge => main_per_target::<EdgeTarget>(&args),
    }
}

fn main_per_target<Tgt: Target>(args: &Args) -> Result<()> {
    if let Subcommand::Select {
        table,
        reduce_axes,
        dims,
    } = &args.subcmd
    {
        let entries = read_table(table)?;
        let table = DispatchTable::from_encoded(&entries);
        info!("loaded {} of {} dispatch entries", table.len(), entries.len());
        match table.select(dims, reduce_axes.as_deref()) {
            Some(key) => pprint_cases(std::slice::from_ref(&key.case)),
            None => bail!("no case matches {:?}", dims),
        }
        return Ok(());
    }

    let (name, dag) = sample_operator(&args.subcmd)?;
    let opts = CompileOptions {
        jobs: args.jobs,
        ..CompileOptions::default()
    };
    let compiled = compile_operator::<Tgt>(&name, &dag, &opts)?;
    match args.format {
        PrintFormat::Cases => {
            let cases = compiled
                .schedules
                .iter()
                .map(|s| s.case.clone())
                .collect::<Vec<_>>();
            pprint_cases(&cases);
        }
        PrintFormat::Schedules => {
            for schedule in &compiled.schedules {
                pprint_schedule(schedule);
                println!();
            }
        }
    }
    if let Some(path) = &args.table {
        match write_table(path, &compiled.entries) {
            Ok(()) => info!("wrote {} entries to {}", compiled.entries.len(), path.display()),
            Err(err) => warn!("failed to write {}: {}", path.display(), err),
        }
    }
    Ok(())
}

/// `[1, max]`, or unbounded when `max` is 0.
fn up_to(max: u64) -> Result<DimRange> {
    if max == 0 {
        return Ok(DimRange::unbounded(1));
    }
    DimRange::try_new(1, max).ok_or_else(|| anyhow!("bound {max} exceeds the largest dimension {DIM_MAX}"))
}

fn known(size: u64, flag: &str) -> Result<DimRange> {
    DimRange::try_new(size, size).ok_or_else(|| anyhow!("--{flag} must be in [1, {DIM_MAX}], got {size}"))
}

/// Spatial extents a `kernel`-wide window fits in, up to `max_size`.
fn spatial_range(kernel: u32, max_size: u64) -> Result<DimRange> {
    if kernel == 0 {
        bail!("--kernel must be at least 1");
    }
    let kernel = u64::from(kernel);
    DimRange::try_new(kernel, max_size.max(kernel))
        .ok_or_else(|| anyhow!("--max-size {max_size} exceeds the largest dimension {DIM_MAX}"))
}

fn sample_operator(subcmd: &Subcommand) -> Result<(String, ComputeDag)> {
    let mut b = ComputeDag::builder();
    let name = match *subcmd {
        Subcommand::Add { max, dtype } => {
            let x = b.placeholder(vec![up_to(max)?], dtype);
            let y = b.placeholder(vec![up_to(max)?], dtype);
            let z = b.elementwise(ElemOp::Add, &[x, y]);
            b.output(z);
            "add"
        }
        Subcommand::BroadcastAdd { rows, cols } => {
            let x = b.placeholder(vec![up_to(rows)?, up_to(cols)?], Dtype::Float32);
            let y = b.placeholder(vec![DimRange::known(1), up_to(cols)?], Dtype::Float32);
            let z = b.elementwise(ElemOp::Add, &[x, y]);
            b.output(z);
            "broadcast_add"
        }
        Subcommand::ReduceSum {
            rows,
            cols,
            dynamic_axis,
        } => {
            let x = b.placeholder(vec![up_to(rows)?, up_to(cols)?], Dtype::Float32);
            let r = if dynamic_axis {
                b.reduce_dynamic(ReduceOp::Sum, x)
            } else {
                b.reduce(ReduceOp::Sum, x, &[1], false)
            };
            b.output(r);
            "reduce_sum"
        }
        Subcommand::Softmax { rows, cols } => {
            let x = b.placeholder(vec![up_to(rows)?, up_to(cols)?], Dtype::Float32);
            let m = b.reduce(ReduceOp::Max, x, &[1], true);
            let s = b.elementwise(ElemOp::Sub, &[x, m]);
            let e = b.elementwise(ElemOp::Exp, &[s]);
            let sum = b.reduce(ReduceOp::Sum, e, &[1], true);
            let d = b.elementwise(ElemOp::Div, &[e, sum]);
            b.output(d);
            "softmax"
        }
        Subcommand::MaxPool {
            kernel,
            stride,
            max_size,
        } => {
            if stride == 0 {
                bail!("--stride must be at least 1");
            }
            let spatial = spatial_range(kernel, max_size)?;
            let x = b.placeholder(
                vec![DimRange::new(1, 8), DimRange::known(16), spatial, spatial],
                Dtype::Float16,
            );
            let window = Window {
                kernel: [kernel; 2],
                stride: [stride; 2],
                pad: [0; 4],
            };
            let p = b.pool(PoolMode::Max, x, window);
            b.output(p);
            "max_pool"
        }
        Subcommand::Conv2d {
            channels,
            filters,
            kernel,
            max_size,
        } => {
            let spatial = spatial_range(kernel, max_size)?;
            let channels = known(channels, "channels")?;
            let x = b.placeholder(
                vec![DimRange::new(1, 8), channels, spatial, spatial],
                Dtype::Float16,
            );
            let k = DimRange::known(u64::from(kernel));
            let w = b.placeholder(
                vec![known(filters, "filters")?, channels, k, k],
                Dtype::Float16,
            );
            let window = Window {
                kernel: [kernel; 2],
                stride: [1; 2],
                pad: [kernel / 2; 4],
            };
            let c = b.conv2d(x, w, window);
            let r = b.elementwise(ElemOp::Relu, &[c]);
            b.output(r);
            "conv2d"
        }
        Subcommand::Select { .. } => bail!("select does not build an operator"),
    };
    Ok((name.to_owned(), b.build()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_window_flags_are_errors() {
        let pool = |kernel, stride| Subcommand::MaxPool {
            kernel,
            stride,
            max_size: 256,
        };
        assert!(sample_operator(&pool(3, 2)).is_ok());
        assert!(sample_operator(&pool(0, 2)).is_err());
        assert!(sample_operator(&pool(3, 0)).is_err());
        let conv = |kernel, channels| Subcommand::Conv2d {
            channels,
            filters: 32,
            kernel,
            max_size: 256,
        };
        assert!(sample_operator(&conv(3, 16)).is_ok());
        assert!(sample_operator(&conv(0, 16)).is_err());
        assert!(sample_operator(&conv(3, 0)).is_err());
    }

    #[test]
    fn test_oversized_bounds_are_errors() {
        assert_eq!(up_to(0).unwrap(), DimRange::unbounded(1));
        assert_eq!(up_to(DIM_MAX).unwrap(), DimRange::new(1, DIM_MAX));
        assert!(up_to(DIM_MAX + 1).is_err());
        assert!(sample_operator(&Subcommand::Softmax {
            rows: DIM_MAX + 1,
            cols: 0,
        })
        .is_err());
        assert!(sample_operator(&Subcommand::MaxPool {
            kernel: 3,
            stride: 2,
            max_size: DIM_MAX + 1,
        })
        .is_err());
    }
}
