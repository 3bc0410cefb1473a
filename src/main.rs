use std::{fs, path::PathBuf, process::ExitCode};

use clap::Parser;
use devirt::{
    explorer::{Config, Explorer},
    il::{opt, printer},
    image::PeImage,
    lifter::Lifter,
    solver,
    tracer::Tracer,
};
use log::{debug, info};

/// Statically devirtualize a VMProtect-style virtual machine.
#[derive(Parser, Debug)]
#[command(about, version)]
struct Args {
    /// Path to the protected binary.
    #[arg(short = 'b', long = "binary")]
    binary: PathBuf,

    /// Virtual address of the vmenter, decimal or hex.
    #[arg(short = 'e', long = "entrypoint", value_parser = parse_address)]
    entrypoint: u64,

    /// Path to the intrinsics IR module.
    #[arg(short = 'i', long = "intrinsics")]
    intrinsics: PathBuf,

    /// Path of the output IR file.
    #[arg(short = 'o', long = "output", default_value = "output.ll")]
    output: PathBuf,

    /// Save the branch expression into a dot file on every branch.
    #[arg(long = "solver-save-ast")]
    solver_save_ast: bool,

    /// Print the branch expression on every branch.
    #[arg(long = "solver-print-ast")]
    solver_print_ast: bool,
}

fn parse_address(text: &str) -> Result<u64, String> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_| format!("{text:?} is not a virtual address"))
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> devirt::error::Result<()> {
    let image = PeImage::open(&args.binary)?;
    let mut lifter = Lifter::from_file(&args.intrinsics)?;
    let tracer = Tracer::new(image.into_shared());

    let config = Config {
        solver: solver::Options {
            save_ast:  args.solver_save_ast,
            print_ast: args.solver_print_ast,
        },
        ..Config::default()
    };

    let routine = Explorer::with_config(tracer, config).explore(args.entrypoint, &mut lifter)?;
    info!("discovered {} blocks", routine.len());

    if log::log_enabled!(log::Level::Debug) {
        let dot_path = args.output.with_extension("dot");
        if let Err(error) = fs::write(&dot_path, routine.dot()) {
            debug!("failed to write {}: {error}", dot_path.display());
        }
    }

    let function = lifter.build_final(&routine)?;
    opt::optimize_virtual_function(lifter.module_mut(), function)?;

    // The output carries the devirtualized routine plus the declarations of
    // any synthesized external calls.
    let module = lifter.module();
    let mut output = String::new();
    for (_, declaration) in module.functions() {
        if declaration.name.starts_with("External.0x") {
            output.push_str(&printer::print_function(module, declaration));
        }
    }
    output.push_str(&printer::print_function(module, module.function(function)));

    fs::write(&args.output, output).map_err(|e| {
        devirt::error::Error::from(anyhow::anyhow!(
            "failed to write {}: {e}",
            args.output.display()
        ))
    })?;
    info!("wrote {}", args.output.display());
    Ok(())
}
