//! Command-line interface for nvshim

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use nvshim::registry::{find_command, Command};
use nvshim::{AbiConfig, CommandRegistry, DriverVersion, LayoutDescriptor};
use std::fs;

#[derive(Parser)]
#[command(name = "nvshim")]
#[command(version = nvshim::VERSION)]
#[command(about = "Inspect and check NVIDIA UVM ioctl ABI layouts", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, env = "NVSHIM_CONFIG", global = true)]
    config: Option<String>,

    /// Output verbosity
    #[arg(short, long, value_enum, default_value_t = Verbosity::Normal, global = true)]
    verbosity: Verbosity,
}

#[derive(Subcommand)]
enum Commands {
    /// List every known command and its layout at a driver version
    Commands {
        /// Driver version, e.g. 535.104.05
        #[arg(short, long, default_value = "535.104.05")]
        driver: String,
    },

    /// Show the field layout of one command
    Layout {
        /// Command name (e.g. register_gpu) or number
        command: String,

        /// Driver version, e.g. 550.54.14
        #[arg(short, long, default_value = "535.104.05")]
        driver: String,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Decode a raw parameter buffer read from a file
    Decode {
        /// Command name or number
        command: String,

        /// File holding the raw structure bytes
        #[arg(short, long)]
        input: String,

        /// Driver version the buffer was produced for
        #[arg(short, long, default_value = "535.104.05")]
        driver: String,
    },

    /// Build the registry and report any table defects
    Check,

    /// Export every command and layout variant to JSON
    Export {
        /// Output file
        #[arg(short, long, default_value = "nvshim_layouts.json")]
        output: String,
    },

    /// Show version information
    Version,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Verbosity {
    Minimal,
    Normal,
    Detailed,
    Debug,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbosity {
        Verbosity::Minimal => log::LevelFilter::Error,
        Verbosity::Normal => log::LevelFilter::Warn,
        Verbosity::Detailed => log::LevelFilter::Info,
        Verbosity::Debug => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();

    let config = match &cli.config {
        Some(path) => AbiConfig::from_file(path)?,
        None => AbiConfig::default(),
    };

    match &cli.command {
        Commands::Commands { driver } => {
            let registry = CommandRegistry::uvm(config)?;
            let version = parse_version(driver)?;

            println!("📋 UVM commands at driver {}:", version);
            for cmd in registry.commands() {
                match registry.resolve(cmd.code, version) {
                    Ok(layout) => println!(
                        "  {:<36} {:>#12x}  {:<44} {:>6} bytes",
                        cmd.name,
                        cmd.code,
                        layout.name(),
                        layout.total_width()
                    ),
                    Err(e) => println!("  {:<36} {:>#12x}  ❌ {}", cmd.name, cmd.code, e),
                }
            }
        }

        Commands::Layout { command, driver, format } => {
            let registry = CommandRegistry::uvm(config)?;
            let cmd = parse_command(command)?;
            let layout = registry.resolve(cmd.code, parse_version(driver)?)?;

            match format {
                OutputFormat::Text => print_layout_text(cmd, layout),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&layout.to_json())?),
            }
        }

        Commands::Decode { command, input, driver } => {
            let registry = CommandRegistry::uvm(config)?;
            let cmd = parse_command(command)?;
            let layout = registry.resolve(cmd.code, parse_version(driver)?)?;

            let raw = fs::read(input).with_context(|| format!("reading {}", input))?;
            let value = nvshim::decode(&raw, layout)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }

        Commands::Check => {
            println!("🔍 Checking layout tables...");
            let registry = CommandRegistry::uvm(config)?;
            let mut variants = 0;
            for cmd in registry.commands() {
                variants += registry.variants(cmd.code)?.len();
            }
            println!("✅ {} commands, {} layout variants, no defects", registry.len(), variants);
        }

        Commands::Export { output } => {
            let registry = CommandRegistry::uvm(config)?;
            registry.export_json(output)?;
            println!("✅ Layouts exported to: {}", output);
        }

        Commands::Version => {
            println!("nvshim v{}", nvshim::version());
            println!("Library for UVM ioctl ABI translation");
        }
    }

    Ok(())
}

fn parse_version(s: &str) -> anyhow::Result<DriverVersion> {
    s.parse().with_context(|| format!("bad driver version {:?}", s))
}

fn parse_command(query: &str) -> anyhow::Result<Command> {
    match find_command(query) {
        Some(cmd) => Ok(*cmd),
        None => bail!("unknown command {:?}\n\n💡 Try running: nvshim commands", query),
    }
}

fn print_layout_text(cmd: Command, layout: &LayoutDescriptor) {
    println!("📊 {} -> {}", cmd, layout.name());
    println!("===================");
    if let Some(earlier) = layout.renamed_from() {
        println!("Renamed from: {}", earlier);
    }
    println!("Size: {} bytes, align {}", layout.total_width(), layout.align());

    if layout.is_parameterless() {
        println!("(no parameters)");
        return;
    }

    for field in layout.fields() {
        println!(
            "  {:>6}  {:<24} {:<28} {}",
            field.offset,
            field.name,
            field.ty.to_string(),
            field.compat
        );
    }

    for slot in layout.handle_slots() {
        println!("Handle: {} at {} ({})", slot.field, slot.offset, slot.kind);
    }
    for fixup in layout.fixups() {
        println!("Fixup: {} |= {:#x}", fixup.field, fixup.set_bits);
    }
}
