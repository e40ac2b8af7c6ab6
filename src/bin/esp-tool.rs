use clap::Parser;
use esp_tool::cli::{self, Cli};
use log::LevelFilter;
use miette::Result;

fn main() -> Result<()> {
    let cli = Cli::parse_from(cli::args_with_env());

    // quiet only silences progress prose, never errors
    let default_level = if cli.quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .format_target(false)
        .format_timestamp(None)
        .parse_default_env()
        .init();

    cli::run(cli)
}
