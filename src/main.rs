use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use confique::Config;
use log::{info, warn, LevelFilter};
use rhd_stream::{Conf, ImpedanceMeasurer, SignalType, Status};
use simplelog::{ColorChoice, TermLogger, TerminalMode, WriteLogger};
use std::{fs, path::PathBuf, sync::atomic::AtomicBool};

#[derive(Parser, Debug)]
#[command(version, about = "Stream, record and impedance-test RHD2000 amplifier data")]
struct Args {
    /// TOML configuration file
    config: PathBuf,
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Acquire with the terminal status view
    Run,
    /// Measure electrode impedances and print the table
    Impedance {
        /// Also write the results as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    anyhow::ensure!(
        args.config.is_file(),
        "configuration file {} not found",
        args.config.display()
    );
    let config = Conf::builder()
        .file(&args.config)
        .load()
        .with_context(|| format!("loading {}", args.config.display()))?;
    config.validate()?;

    match args.mode {
        Mode::Run => run(config),
        Mode::Impedance { csv } => impedance(config, csv),
    }
}

fn run(config: Conf) -> Result<()> {
    let output_dir = &config.recording.output_dir;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;
    let log_file = fs::File::create(output_dir.join("rhd_stream.log"))?;
    WriteLogger::init(LevelFilter::Info, simplelog::Config::default(), log_file)?;

    let mut status = Status::new(config);
    let mut terminal = ratatui::init();
    let result = status.run(&mut terminal);
    ratatui::restore();
    result
}

fn impedance(config: Conf, csv: Option<PathBuf>) -> Result<()> {
    TermLogger::init(
        LevelFilter::Info,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )?;

    let mut board = config.synthetic_board()?;
    let mut catalog = config.catalog()?;
    let measurer = ImpedanceMeasurer::new(config.impedance_settings());
    let cancel = AtomicBool::new(false);
    let table = measurer.measure(&mut board, &cancel, |done, total| {
        if done % 8 == 0 || done == total {
            info!("{done}/{total} channels measured");
        }
    })?;
    let Some(table) = table else {
        warn!("Impedance measurement cancelled");
        return Ok(());
    };

    table.apply_to(&mut catalog);
    for c in catalog
        .channels()
        .filter(|c| c.signal_type == SignalType::Amplifier)
    {
        info!(
            "{}: {:.3e} ohms, {:.0} degrees",
            c.native_name, c.impedance_magnitude, c.impedance_phase
        );
    }
    if let Some(path) = csv {
        table.save_csv(&catalog, &path)?;
    }
    Ok(())
}
