use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// droidstrap - bootstrap an Android runtime inside a native executable
#[derive(Debug, Parser)]
#[command(name = "droidstrap", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared across all subcommands.
#[derive(Debug, Parser)]
pub struct GlobalOptions {
    /// Enable verbose (debug-level) logging output.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Bootstrap the runtime, create a surface and forward touch input to it.
    Run(RunOptions),

    /// Resolve symbols in a library file without loading it, printing their offsets.
    Symbols {
        /// Library path or bare name.
        #[arg(value_name = "LIBRARY")]
        library: String,

        /// Exact (mangled) symbol names.
        #[arg(value_name = "SYMBOL", required = true)]
        names: Vec<String>,

        /// Directory searched for bare library names (repeatable).
        #[arg(short, long, value_name = "DIR")]
        search: Vec<PathBuf>,
    },

    /// Print an offset table, or the row selected for a platform.
    Offsets {
        /// Offset table to read instead of the built-in one.
        #[arg(short, long, value_name = "FILE")]
        file: Option<PathBuf>,

        /// Show only the row selected for this API level.
        #[arg(short, long, value_name = "LEVEL")]
        api_level: Option<String>,
    },
}

/// Options of the `run` subcommand.
#[derive(Debug, Args)]
pub struct RunOptions {
    /// Offset table to patch with instead of the built-in one.
    #[arg(long, value_name = "FILE")]
    pub offsets: Option<PathBuf>,

    /// Helper dex to load into the VM.
    #[arg(long, value_name = "FILE")]
    pub dex: Option<PathBuf>,

    /// Assume this API level instead of reading system properties.
    #[arg(long, value_name = "LEVEL")]
    pub api_level: Option<String>,

    /// Fail unless running as root.
    #[arg(long)]
    pub require_root: bool,

    /// Option passed to the VM (repeatable), e.g. -Xcheck:jni.
    #[arg(long = "vm-option", value_name = "OPTION", allow_hyphen_values = true)]
    pub vm_options: Vec<String>,

    /// Library to resolve JNI_CreateJavaVM from instead of the runtime library.
    #[arg(long, value_name = "LIBRARY")]
    pub vm_library: Option<String>,

    /// VM library handed to the JNI invocation.
    #[arg(long, value_name = "LIBRARY")]
    pub jni_provider: Option<String>,

    /// Frame rate of the present loop.
    #[arg(long, default_value_t = 60)]
    pub fps: u32,

    /// Stop after this many frames.
    #[arg(long, value_name = "COUNT")]
    pub frames: Option<u64>,
}
