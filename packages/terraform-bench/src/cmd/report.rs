//! Render a saved benchmark report.

use std::io::{Write, stdout};
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};
use terraform_bench::BenchmarkReport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Format {
    Markdown,
    Csv,
    Chart,
    Json,
}

#[derive(Args, Clone, Debug)]
pub struct Config {
    /// Input report file (JSON), as written by `run`.
    #[arg(short, long, default_value = "output/report.json")]
    input: PathBuf,

    /// Output format.
    #[arg(short, long, default_value = "markdown")]
    format: Format,
}

pub fn main(config: Config) -> Result<()> {
    let report = BenchmarkReport::load(&config.input)?;
    let mut out = stdout().lock();

    match config.format {
        Format::Markdown => report.print_markdown(&mut out),
        Format::Csv => report.print_csv(&mut out),
        Format::Chart => report.print_chart(&mut out),
        Format::Json => {
            serde_json::to_writer_pretty(&mut out, &report).wrap_err("write report JSON")?;
            writeln!(out).wrap_err("write report JSON")
        }
    }
}
