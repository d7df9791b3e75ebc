//! Export a small recurrent model to C units and a weights file.
//!
//! Run with: `cargo run --example export_gru -- <output-dir>`

use std::path::PathBuf;

use blocksparse_export::{ExportConfig, GruWeights, Layer, ModelExporter, WriterConfig};
use candle_core::{DType, Device, Tensor};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== blocksparse-export Export Example ===\n");

    let out_dir = std::env::args()
        .nth(1)
        .map_or_else(std::env::temp_dir, PathBuf::from);
    std::fs::create_dir_all(&out_dir)?;

    let device = Device::Cpu;
    let (features, hidden, outputs) = (32, 64, 16);

    println!("1. Configuration");
    let config = ExportConfig::default()
        .with_quantize(true)
        .with_unquantized("dense_out")
        .with_writer(
            WriterConfig::default()
                .with_model_struct_name("Denoiser")
                .with_typedef(true)
                .with_message("auto-generated weights"),
        );
    config.to_file(out_dir.join("export.yaml"))?;
    println!("   Quantize: {}", config.quantize);
    println!("   Unquantized: {:?}", config.unquantized);

    println!("\n2. Building layers");
    let conv = Layer::Conv1d {
        weight: Tensor::randn(0.0f32, 0.3, (features, features, 3), &device)?,
        bias: Some(Tensor::zeros(features, DType::F32, &device)?),
    };
    let gru = Layer::Gru(GruWeights::from_tensors(
        "gru1",
        &Tensor::randn(0.0f32, 0.2, (3 * hidden, features), &device)?,
        &Tensor::randn(0.0f32, 0.2, (3 * hidden, hidden), &device)?,
        Some(&Tensor::zeros(3 * hidden, DType::F32, &device)?),
        Some(&Tensor::zeros(3 * hidden, DType::F32, &device)?),
    )?);
    let dense = Layer::Dense {
        weight: Tensor::randn(0.0f32, 0.3, (outputs, hidden), &device)?,
        bias: Some(Tensor::zeros(outputs, DType::F32, &device)?),
    };

    println!("\n3. Exporting");
    let stem = out_dir.join("denoiser_data");
    let mut exporter = ModelExporter::create(&stem, config)?;
    let reports = exporter.export_all([
        ("conv1", &conv),
        ("gru1", &gru),
        ("dense_out", &dense),
    ])?;
    for report in &reports {
        for linear in &report.linear {
            println!(
                "   {:<16} {:>4} -> {:<4} clipped={} density={}",
                linear.name,
                linear.inputs,
                linear.outputs,
                linear.clipped,
                linear
                    .block_density
                    .map_or_else(|| "dense".to_string(), |d| format!("{:.2}", d)),
            );
        }
    }

    let blob = exporter.finish()?;
    blob.save_weights_file(out_dir.join("denoiser_data.bin"))?;

    println!("\n4. Output");
    println!("   Arrays: {}", blob.arrays().len());
    println!("   Layers: {}", blob.layers().len());
    println!("   Written to {}", out_dir.display());

    println!("\n=== Example Complete ===");
    Ok(())
}
