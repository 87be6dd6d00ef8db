use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::hint::black_box;

use autotile::classify::Pattern;
use autotile::common::{DimRange, Dtype};
use autotile::dag::{ComputeDag, ReduceOp};
use autotile::generate::generate_cases;
use autotile::target::CloudTarget;

fn dynamic_reduce(rank: usize) -> ComputeDag {
    let mut b = ComputeDag::builder();
    let x = b.placeholder(vec![DimRange::new(1, 2048); rank], Dtype::Float16);
    let r = b.reduce_dynamic(ReduceOp::Sum, x);
    b.output(r);
    b.build().unwrap()
}

#[library_benchmark]
#[benches::multiple(2, 4)]
fn generate_dynamic_reduce(rank: usize) {
    let dag = dynamic_reduce(rank);
    black_box(generate_cases::<CloudTarget>(&dag, black_box(Pattern::UnknownReduce)).unwrap());
}

library_benchmark_group!(
    name = generate_cases_group;
    benchmarks = generate_dynamic_reduce
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = generate_cases_group
);
