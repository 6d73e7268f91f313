//! Command-line surface.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "winsub",
    version,
    about = "Load the Windows font-subsetting DLL on Linux and drive it with font samples"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args)]
pub struct GlobalOpts {
    /// Enable debug logging (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load a DLL and process one font sample through its entry points
    Run {
        /// Path to the 32-bit fontsub.dll image
        dll: PathBuf,
        /// Path to the font file used as source data
        font: PathBuf,
        /// Hexadecimal load-address override, 64 KiB aligned (e.g. 0x20000000)
        #[arg(long)]
        base: Option<String>,
    },

    /// Print an image's layout, imports and exports without loading it
    Info {
        /// Path to the image to inspect
        dll: PathBuf,
    },

    /// Mutate a TTF/OTF font file, rewriting its container structure
    Mutate {
        /// Input font file
        input: PathBuf,
        /// Output font file
        output: PathBuf,
        /// Mutation seed; derived from the input bytes when absent
        #[arg(long)]
        seed: Option<u64>,
    },
}
