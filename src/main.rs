use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::Parser;
use onnx_trt_surgeon::{
    calibration::{CalibrationReader, Calibrator},
    engine::{self, BatchProfile, Device, EngineSpec, Precision},
    graph::{Graph, Tensor},
    surgeon::{self, read_model, tuned_path},
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(subcommand)]
    action: Action,
    /// ONNX file to process
    #[clap(value_parser)]
    onnx: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Action {
    /// Print the graph's nodes, inputs and outputs
    Info,
    /// Simplify the graph and apply edit requests
    Surgery {
        /// Edit request JSON files, applied in order
        #[clap(short, long = "request", value_parser)]
        requests: Vec<PathBuf>,
        /// Output path [default: <input>_tuned.onnx]
        #[clap(short, long, value_parser)]
        output: Option<PathBuf>,
    },
    /// Print the trtexec command that builds the engine
    Plan {
        /// FP32 | FP16 | INT8
        #[clap(short, long, value_parser)]
        precision: Precision,
        /// CUDA | DLA0 | DLA1
        #[clap(short = 'g', long = "gpu-core", value_parser, default_value = "CUDA")]
        device: Device,
        /// MIN OPT MAX
        #[clap(short, long, value_parser, multiple_values = true, required = true)]
        batch: Vec<usize>,
        /// Name of the network input tensor
        #[clap(long, value_parser)]
        input_name: Option<String>,
        /// Mark the engine as built from a surgeried graph
        #[clap(long)]
        gs: bool,
        #[clap(long, value_parser, default_value = "outputs/trt_engine")]
        engine_dir: PathBuf,
        #[clap(long, value_parser, default_value = "outputs/calib")]
        calib_dir: PathBuf,
        /// Builder workspace in MiB
        #[clap(long, value_parser, default_value_t = engine::DEFAULT_WORKSPACE_MIB)]
        workspace: u64,
    },
    /// Walk the INT8 calibration batches without building an engine
    Calibrate {
        /// Directory of calibration images
        #[clap(short, long, value_parser)]
        images: PathBuf,
        /// Calibration cache file
        #[clap(short, long, value_parser)]
        cache: PathBuf,
        #[clap(short, long, value_parser, default_value_t = 1)]
        batch: usize,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    pretty_env_logger::init();

    match args.action {
        Action::Info => print_info(&open_graph(&args.onnx)?),
        Action::Surgery { requests, output } => {
            let output = output.unwrap_or_else(|| tuned_path(&args.onnx));
            surgeon::run(&args.onnx, &requests, &output)
                .with_context(|| format!("Graph surgery on {:?} failed", args.onnx))?;
            println!("saved {output:?}");
        }
        Action::Plan {
            precision,
            device,
            batch,
            input_name,
            gs,
            engine_dir,
            calib_dir,
            workspace,
        } => {
            let graph = open_graph(&args.onnx)?;
            let model = model_name(&args.onnx);
            let spec = EngineSpec {
                input_hw: network_hw(&graph, &model)?,
                input_name: input_name
                    .or_else(|| graph.inputs.first().cloned())
                    .ok_or_else(|| anyhow!("{:?} has no inputs", args.onnx))?,
                model,
                device,
                precision,
                batch: BatchProfile::from_slice(&batch)?,
                surgery: gs,
                workspace_mib: workspace,
            };
            spec.validate()?;
            if let Some(cache) = spec.missing_calibration(&calib_dir) {
                log::warn!(
                    "no calibration cache at {cache:?}, run `calibrate` first or the INT8 engine is built with placeholder scales"
                );
            }
            let cmd = spec.trtexec_args(&args.onnx, &engine_dir, &calib_dir);
            println!("trtexec {}", cmd.join(" "));
        }
        Action::Calibrate {
            images,
            cache,
            batch,
        } => {
            let graph = open_graph(&args.onnx)?;
            let hw = network_hw(&graph, &model_name(&args.onnx))?;
            let mut reader = CalibrationReader::new(&images, hw, batch, cache)
                .with_context(|| format!("Failed to set up calibration from {images:?}"))?;
            if let Some(table) = reader.read_cache()? {
                println!(
                    "cache {:?} present ({} bytes), calibration would be skipped",
                    reader.cache_path(),
                    table.len()
                );
                return Ok(());
            }
            let mut batches = 0;
            while reader.next_batch()?.is_some() {
                batches += 1;
            }
            println!(
                "{} images, {batches} batches of {} at {}x{}",
                reader.num_samples(),
                reader.batch_size(),
                hw.0,
                hw.1
            );
        }
    }
    Ok(())
}

fn open_graph(path: &Path) -> anyhow::Result<Graph> {
    let model = read_model(path).with_context(|| format!("Failed to open {path:?}"))?;
    Ok(Graph::from_model(model)?)
}

fn model_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn network_hw(graph: &Graph, model: &str) -> anyhow::Result<(u32, u32)> {
    graph
        .input_shape(0)
        .and_then(|s| engine::input_hw_from_shape(&s))
        .or_else(|| engine::input_hw_from_name(model))
        .ok_or_else(|| anyhow!("cannot tell the input size of {model:?}"))
}

fn print_info(graph: &Graph) {
    println!("graph.name {:?}:", graph.name);
    println!("graph.doc_string {:?}:", graph.doc_string);
    for (i, node) in graph.nodes.iter().enumerate() {
        println!("node {i}: {:?} ({}):", node.name, node.op_type);
    }
    for (i, input) in graph.inputs.iter().enumerate() {
        println!("input {i}: {:?} {:?}:", input, graph.tensors.get(input).and_then(Tensor::shape));
    }
    for (i, output) in graph.outputs.iter().enumerate() {
        println!("output {i}: {:?} {:?}:", output, graph.tensors.get(output).and_then(Tensor::shape));
    }
}
