use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use aero_vhdx::{
    CheckMode, StdFileBackend, VhdxCreateOptions, VhdxDisk, VhdxOpenOptions, VhdxSubformat,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aero-vhdx", about = "Create and inspect VHDX disk images.")]
struct Args {
    /// Log debug output (overridden by RUST_LOG)
    #[arg(long, short, global = true, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new image
    Create(CreateArgs),
    /// Validate the block allocation table of an image
    Check(CheckArgs),
    /// Print image geometry and allocation summary as JSON
    Info(InfoArgs),
}

#[derive(clap::Args, Debug)]
struct CreateArgs {
    /// Output image path
    path: PathBuf,

    /// Virtual disk size in bytes (rounded up to the logical sector size)
    #[arg(long, value_name = "BYTES")]
    size: u64,

    /// Payload block size in bytes; 0 picks one from the disk size
    #[arg(long, value_name = "BYTES", default_value_t = 0)]
    block_size: u32,

    /// Log region size in bytes (rounded up to 1 MiB)
    #[arg(long, value_name = "BYTES", default_value_t = aero_vhdx::vhdx::create::DEFAULT_LOG_SIZE)]
    log_size: u64,

    #[arg(long, value_name = "BYTES", default_value_t = 512)]
    logical_sector_size: u32,

    #[arg(long, value_enum, default_value_t = Subformat::Dynamic)]
    subformat: Subformat,

    /// Mark untouched blocks ZERO instead of NOT_PRESENT
    #[arg(long, action = clap::ArgAction::SetTrue)]
    prefer_zero: bool,

    /// Overwrite an existing file
    #[arg(long, action = clap::ArgAction::SetTrue)]
    force: bool,
}

#[derive(clap::Args, Debug)]
struct CheckArgs {
    path: PathBuf,

    /// Stop at the first corruption instead of counting all of them
    #[arg(long, action = clap::ArgAction::SetTrue)]
    stop_at_first: bool,
}

#[derive(clap::Args, Debug)]
struct InfoArgs {
    path: PathBuf,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Subformat {
    Dynamic,
    Fixed,
}

impl From<Subformat> for VhdxSubformat {
    fn from(value: Subformat) -> Self {
        match value {
            Subformat::Dynamic => VhdxSubformat::Dynamic,
            Subformat::Fixed => VhdxSubformat::Fixed,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    run(args)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: Args) -> anyhow::Result<()> {
    match args.command {
        Command::Create(create) => run_create(create),
        Command::Check(check) => run_check(check),
        Command::Info(info) => run_info(info),
    }
}

fn run_create(args: CreateArgs) -> anyhow::Result<()> {
    let options = VhdxCreateOptions {
        disk_size_bytes: args.size,
        block_size_bytes: args.block_size,
        log_size_bytes: args.log_size,
        logical_sector_size: args.logical_sector_size,
        subformat: args.subformat.into(),
        prefer_zero_block_state: args.prefer_zero,
    };
    debug!(path = %args.path.display(), ?options, "creating image");
    let backend = open_output_file(&args.path, args.force)
        .with_context(|| format!("create {}", args.path.display()))?;
    let disk = VhdxDisk::create(backend, options).context("create vhdx image")?;
    let info = disk.info();
    disk.close().context("flush image")?;

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn run_check(args: CheckArgs) -> anyhow::Result<()> {
    let backend = StdFileBackend::open_read_only(&args.path)
        .with_context(|| format!("open {}", args.path.display()))?;
    let mut disk = VhdxDisk::open_with_options(
        backend,
        VhdxOpenOptions {
            read_only: true,
            skip_bat_validation: true,
            ..VhdxOpenOptions::default()
        },
    )
    .context("open vhdx image")?;

    let mode = if args.stop_at_first {
        CheckMode::StopAtFirst
    } else {
        CheckMode::All
    };
    let report = disk.check(mode).context("check vhdx image")?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.corruptions_found > 0 {
        bail!(
            "{} corruption(s) found in {}",
            report.corruptions_found,
            args.path.display()
        );
    }
    Ok(())
}

fn run_info(args: InfoArgs) -> anyhow::Result<()> {
    let backend = StdFileBackend::open_read_only(&args.path)
        .with_context(|| format!("open {}", args.path.display()))?;
    let disk = VhdxDisk::open_with_options(
        backend,
        VhdxOpenOptions {
            read_only: true,
            ..VhdxOpenOptions::default()
        },
    )
    .context("open vhdx image")?;
    println!("{}", serde_json::to_string_pretty(&disk.info())?);
    Ok(())
}

fn open_output_file(path: &Path, force: bool) -> anyhow::Result<StdFileBackend> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(true);
    if force {
        opts.create(true).truncate(true);
    } else {
        opts.create_new(true);
    }
    let file = opts.open(path)?;
    Ok(StdFileBackend::from_file(file))
}
