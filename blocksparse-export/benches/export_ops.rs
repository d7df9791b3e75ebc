//! Benchmarks for sparsification, quantization and export.

use blocksparse_export::{
    encode_blocks, export_linear, quantize, sparsify_matrix, BlobWriter, GateConfig,
    LinearOptions, QuantizeConfig, WeightMatrix, WriterConfig,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn matrix(rows: usize, cols: usize) -> WeightMatrix {
    let data = (0..rows * cols)
        .map(|i| ((i as f32) * 0.731).sin() * 0.4)
        .collect();
    WeightMatrix::from_vec(data, rows, cols).unwrap()
}

fn bench_sparsify(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparsify_matrix");
    let gate = GateConfig::new(0.2, (8, 4), true);

    for size in [64, 256, 512].iter() {
        let weight = matrix(*size, *size);
        group.bench_with_input(BenchmarkId::new("density_0.5", size), size, |bench, _| {
            bench.iter(|| {
                let mut w = weight.clone();
                black_box(sparsify_matrix(&mut w, 0.5, &gate).unwrap())
            })
        });
    }

    group.finish();
}

fn bench_quantize(c: &mut Criterion) {
    let mut group = c.benchmark_group("quantize");
    let config = QuantizeConfig::default();

    for (n_in, n_out) in [(64, 192), (256, 768), (512, 1536)].iter() {
        let weight = matrix(*n_in, *n_out);
        let label = format!("{n_in}x{n_out}");
        group.bench_with_input(BenchmarkId::new("calibrated", &label), &(), |bench, _| {
            bench.iter(|| black_box(quantize(&weight, None, None, &config).unwrap()))
        });
    }

    group.finish();
}

fn bench_encode_blocks(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_blocks");

    for size in [64, 256, 512].iter() {
        let mut weight = matrix(*size, *size * 3);
        // Half the blocks pruned, as after a typical schedule.
        for r in 0..*size {
            for col in 0..*size * 3 {
                if (r / 4 + col / 8) % 2 == 0 {
                    weight.set(r, col, 0.0);
                }
            }
        }
        group.bench_with_input(BenchmarkId::new("half_dense", size), size, |bench, _| {
            bench.iter(|| black_box(encode_blocks(&weight, None).unwrap()))
        });
    }

    group.finish();
}

fn bench_export_linear(c: &mut Criterion) {
    let mut group = c.benchmark_group("export_linear");
    let weight = matrix(256, 768);
    let options = LinearOptions::new()
        .with_sparse(true, true)
        .with_quantize(true, None);

    group.bench_function("sparse_int8_256x768", |bench| {
        bench.iter(|| {
            let mut writer =
                BlobWriter::new(Vec::new(), Some(Vec::new()), "bench", WriterConfig::default())
                    .unwrap();
            export_linear(&mut writer, "gru", &weight, None, &options).unwrap();
            black_box(writer.finalize().unwrap())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sparsify,
    bench_quantize,
    bench_encode_blocks,
    bench_export_linear,
);
criterion_main!(benches);
