use clap::Parser;
use env_logger::Builder;
use env_logger::Env;
use log::{error, info, Level};
use std::io::Write;

use fundus_screen::color_utils::{colors, init_color_config, symbols};
use fundus_screen::config::{
    ExplainCommand, ExplainConfig, GlobalArgs, ScreenCommand, ScreenConfig, ValidateCommand,
    ValidateConfig,
};
use fundus_screen::explain_processing::run_explain;
use fundus_screen::screen_processing::run_screening;
use fundus_screen::validate_processing::run_validation;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Validate, classify and calibrate fundus photographs
    Screen(ScreenCommand),

    /// Check image quality and fundus plausibility only
    Validate(ValidateCommand),

    /// Screen images and explain where the model looked
    Explain(ExplainCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "fundus")]
#[command(about = "Retinal fundus photograph screening toolkit")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    // Shift by one so the default shows warnings
    let adjusted_level = match verbosity.log_level_filter() {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug | log::LevelFilter::Trace => log::LevelFilter::Trace,
    };

    // -q
    if verbosity.is_silent() {
        log::LevelFilter::Error
    } else {
        adjusted_level
    }
}

fn init_logger(global: &GlobalArgs) {
    let use_env = !global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let mut b = Builder::new();
        b.filter_level(get_log_level_from_verbosity(global.verbosity.clone()));
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => colors::error_level("ERROR"),
                Level::Warn => colors::warning_level("WARN"),
                Level::Info => colors::info_level("INFO"),
                Level::Debug => colors::debug_level("DEBUG"),
                Level::Trace => colors::trace_level("TRACE"),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();
}

fn describe_sources(sources: &[String]) -> String {
    if sources.len() == 1 {
        sources[0].clone()
    } else {
        format!("{} inputs", sources.len())
    }
}

fn exit_on_error<T>(result: anyhow::Result<T>, what: &str) {
    if let Err(e) = result {
        error!("{} {what} failed: {e:#}", symbols::operation_failed());
        std::process::exit(1);
    }
}

fn invalid_arguments(message: String) -> ! {
    error!("{} Invalid arguments: {message}", symbols::operation_failed());
    std::process::exit(2);
}

fn main() {
    let cli = Cli::parse();
    init_color_config(cli.global.no_color);
    init_logger(&cli.global);

    match cli.command {
        Some(Commands::Screen(cmd)) => {
            info!(
                "{} Screening: {} | task: {} | device: {}",
                symbols::screening_start(),
                describe_sources(&cmd.sources),
                cmd.model.task,
                cli.global.device
            );
            let config = ScreenConfig::from_args(cli.global, cmd).unwrap_or_else(|e| invalid_arguments(e));
            if let Some(sink) = &config.sink_path {
                info!("   Verdict sink: {} (session {})", sink.display(), config.session_id);
            }
            exit_on_error(run_screening(config), "Screening");
        }
        Some(Commands::Validate(cmd)) => {
            info!(
                "{} Validation: {}",
                symbols::validation_start(),
                describe_sources(&cmd.sources)
            );
            let config = ValidateConfig::from_args(cli.global, cmd).unwrap_or_else(|e| invalid_arguments(e));
            exit_on_error(run_validation(config), "Validation");
        }
        Some(Commands::Explain(cmd)) => {
            info!(
                "{} Explanation: {} | task: {} | colormap: {:?} | alpha: {}",
                symbols::explain_start(),
                describe_sources(&cmd.sources),
                cmd.model.task,
                cmd.colormap,
                cmd.alpha
            );
            let config = ExplainConfig::from_args(cli.global, cmd).unwrap_or_else(|e| invalid_arguments(e));
            exit_on_error(run_explain(config), "Explanation");
        }
        Some(Commands::Version) => {
            println!("fundus v{}", env!("CARGO_PKG_VERSION"));
            println!("{}", env!("CARGO_PKG_DESCRIPTION"));
            println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
        }
        None => {
            use clap::CommandFactory;
            // Print help when no subcommand is given
            if Cli::command().print_help().is_err() {
                std::process::exit(1);
            }
            println!();
        }
    }
}
