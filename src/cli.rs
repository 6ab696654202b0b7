use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "blocks2ts",
    about = "Compiles a block workspace (JSON) to TypeScript source."
)]
pub struct Args {
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    #[arg(value_name = "OUTPUT")]
    pub output: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "API surface description (JSON).")]
    pub api: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "Write the source map (byte offsets and line ranges per block) to this path."
    )]
    pub source_map: Option<PathBuf>,

    #[arg(long, help = "Print per-block diagnostics to stderr.")]
    pub diagnostics: bool,

    #[arg(long, help = "Print block usage statistics to stderr.")]
    pub stats: bool,

    #[arg(
        long,
        help = "Run the built-in whitespace formatter on the generated source."
    )]
    pub trim_formatter: bool,
}
