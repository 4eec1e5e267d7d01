use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::model::ExtractOptions;

#[derive(Parser, Debug)]
#[command(name = "fastheader")]
#[command(version)]
#[command(about = "Read image header metadata from local files and HTTP URLs with as few bytes as possible", long_about = None)]
#[command(after_help = "Examples:\n  \
  fastheader scan.tif                          print one JSON document\n  \
  fastheader a.mrc https://example.com/b.png   JSON lines, fetched concurrently\n  \
  find . -name '*.tif' | fastheader - --fields width,height\n  \
  fastheader --count-ifds stack.tif            also report the TIFF page count")]
pub struct Cli {
    /// Image paths or HTTP(S) URLs; `-` reads sources from stdin, one per line
    #[arg(value_name = "FILES", required = true)]
    pub sources: Vec<String>,

    /// Emit JSON lines even for a single source
    #[arg(long)]
    pub jsonl: bool,

    /// Use the blocking extractor, one source after another
    #[arg(long)]
    pub sync: bool,

    /// Walk the whole TIFF directory chain and report its length
    #[arg(long = "count-ifds")]
    pub count_ifds: bool,

    /// Data fields to keep, comma separated (e.g. width,height,dtype)
    #[arg(long, value_name = "FIELDS", value_delimiter = ',')]
    pub fields: Vec<String>,

    /// Deadline per source, in seconds
    #[arg(long, value_name = "SECS", value_parser = parse_timeout)]
    pub timeout: Option<Duration>,

    /// Write output to PATH instead of stdout
    #[arg(short = 'o', long = "output", value_name = "PATH")]
    pub output: Option<PathBuf>,
}

fn parse_timeout(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero())
        .ok_or_else(|| format!("`{value}` is not a positive number of seconds"))
}

impl Cli {
    pub fn options(&self) -> ExtractOptions {
        ExtractOptions {
            count_directories: self.count_ifds,
            timeout: self.timeout,
            ..ExtractOptions::default()
        }
    }

    pub fn reads_stdin(&self) -> bool {
        self.sources.iter().any(|s| s == "-")
    }

    /// One JSON object per line unless exactly one source was given.
    pub fn line_output(&self, count: usize) -> bool {
        self.jsonl || count != 1 || self.reads_stdin()
    }
}
