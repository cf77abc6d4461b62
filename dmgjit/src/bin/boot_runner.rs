use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use dmgjit::{DmgBus, JitRuntime};

/// Run an SM83 boot image under the JIT translator.
#[derive(Parser)]
#[command(version)]
struct Args {
    /// Path to the 256-byte boot image.
    boot_image: PathBuf,

    /// Stop after this many block dispatches instead of running until a
    /// fault.
    #[arg(long)]
    max_blocks: Option<u64>,

    /// Dump each compiled block's raw host bytes into this directory for
    /// offline disassembly.
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let image = std::fs::read(&args.boot_image)
        .with_context(|| format!("reading boot image {}", args.boot_image.display()))?;
    let mut bus = DmgBus::new();
    bus.attach_boot_rom(&image)?;

    let mut runtime = JitRuntime::new(bus)?;
    if let Some(dir) = args.dump_dir {
        runtime.compiler_mut().set_dump_dir(dir);
    }

    let result = runtime.run(args.max_blocks);

    let stats = runtime.stats();
    println!("Blocks compiled:  {}", stats.blocks_compiled);
    println!("Blocks executed:  {}", stats.blocks_executed);
    println!("Cache reuse:      {:.1}%", stats.reuse_ratio() * 100.0);
    println!("Host code bytes:  {}", runtime.compiler().code_used());
    println!(
        "Final state:      pc={:#06x} sp={:#06x} a={:#04x} hl={:#06x} f={:#04x}",
        runtime.state().pc,
        runtime.state().sp,
        runtime.state().a,
        runtime.state().hl(),
        runtime.state().f,
    );

    result
}
