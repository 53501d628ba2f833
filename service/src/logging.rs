use crate::config::Config;
use log::{LevelFilter, SetLoggerError};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Modules to filter out from logging when not in Trace mode.
/// Redis reconnects and per-request HTTP spans would otherwise drown out
/// connection lifecycle messages.
const FILTERED_MODULES: &[&str] = &["redis", "tower", "tower_http", "hyper", "h2", "axum"];

/// What the terminal logger should print, derived from `Config`.
#[derive(Debug, PartialEq)]
struct LogSettings {
    level: LevelFilter,
    filter_dependencies: bool,
}

impl LogSettings {
    fn from_config(config: &Config) -> Self {
        Self {
            level: config.log_level_filter,
            // Trace means "show me everything", dependencies included
            filter_dependencies: config.log_level_filter != LevelFilter::Trace,
        }
    }

    fn build(&self) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder
            .set_time_format_rfc3339()
            .set_target_level(LevelFilter::Error)
            .set_thread_level(LevelFilter::Off);

        if self.filter_dependencies {
            for module in FILTERED_MODULES {
                builder.add_filter_ignore_str(module);
            }
        }

        builder.build()
    }
}

pub struct Logger {}

impl Logger {
    /// Installs the global terminal logger. Fails only if a logger has
    /// already been installed in this process.
    pub fn init_logger(config: &Config) -> Result<(), SetLoggerError> {
        let settings = LogSettings::from_config(config);
        TermLogger::init(
            settings.level,
            settings.build(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        )
    }
}
