use clap::Parser;
use weigh_config::{AgentConfig, load_file};

mod cli;
mod commands;
mod error_fmt;
mod logging;

use cli::{Cli, Commands, JSON_MODE};

fn execute(cli: &Cli, cfg: &AgentConfig) -> eyre::Result<()> {
    match &cli.cmd {
        Commands::Run { simulate } => commands::run(cfg, *simulate),
        Commands::CheckConfig => commands::check_config(cfg),
        Commands::Health => commands::health(cfg),
        Commands::Parse { frame } => commands::parse(cfg, frame),
    }
}

fn report(err: &eyre::Report) -> ! {
    if cli::json_mode() {
        eprintln!("{}", error_fmt::format_error_json(err));
    } else {
        eprintln!("{}", error_fmt::humanize(err));
    }
    std::process::exit(error_fmt::exit_code_for_error(err));
}

fn main() {
    let _ = color_eyre::install();
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);

    let cfg = match load_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => report(&e),
    };
    if let Err(e) = logging::init(cli.log_level.as_deref(), cli.json, &cfg.logging) {
        report(&e);
    }
    if let Err(e) = execute(&cli, &cfg) {
        report(&e);
    }
}
