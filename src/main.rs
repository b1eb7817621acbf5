use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use ovni_emu::backend::analyze;
use ovni_emu::emu::{Config, Emulator};
use ovni_emu::error::{Error, Result};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(required = true, help = "input trace directory")]
    tracedir: PathBuf,

    #[arg(short = 'c', long = "clock-offset", help = "clock offset table of the looms")]
    clock_offset: Option<PathBuf>,

    #[arg(short, long, help = "fail on suspicious conditions instead of warning")]
    linter: bool,

    #[arg(long = "lenient-clock", help = "only warn when a stream clock goes backwards")]
    lenient_clock: bool,

    #[arg(
        short,
        long,
        help = "output directory pathname (defaults to the trace directory)"
    )]
    output: Option<PathBuf>,

    #[arg(short, long, help = "print statistics")]
    statistics: bool,

    #[arg(short, long, help = "print verbose emulation information")]
    verbose: bool,
}

fn emulate(cli: Cli) -> Result<()> {
    let output = cli.output.unwrap_or_else(|| cli.tracedir.clone());
    fs::create_dir_all(&output).map_err(|e| Error::io(&output, e))?;
    let config = Config {
        tracedir: cli.tracedir,
        clock_offset_file: cli.clock_offset,
        linter: cli.linter,
        lenient_clock: cli.lenient_clock,
        output: Some(output),
    };

    println!("Loading trace {:?}...", config.tracedir);
    let mut emulator = Emulator::from_dir(config)?;
    emulator.register_default_models()?;
    emulator.connect()?;

    println!("Emulating...");
    let replay = emulator.run();
    // Close the output even if the replay failed
    let finished = emulator.finish();
    if let (Err(_), Err(e)) = (&replay, &finished) {
        error!("{}", e);
    }
    replay?;
    finished?;

    if cli.statistics {
        analyze::analyze_statistics(&emulator);
    }
    println!("Emulation finished");
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match emulate(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
