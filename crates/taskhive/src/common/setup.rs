use env_logger::DEFAULT_FILTER_ENV;
use log::LevelFilter;
use std::io::Write;

/// How log lines look. `Short` is meant for people watching a terminal,
/// `Detailed` for debugging sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    /// `<time> <level> <message>`
    Short,
    /// Millisecond timestamps and the module that produced the line
    Detailed,
}

impl LogFormat {
    fn choose(verbose: bool, env_filter: Option<&str>) -> Self {
        let debugging = env_filter
            .map(|filter| filter.contains("debug") || filter.contains("trace"))
            .unwrap_or(false);
        if verbose || debugging {
            LogFormat::Detailed
        } else {
            LogFormat::Short
        }
    }
}

/// Installs the global logger. `--debug` lowers the level to debug,
/// `RUST_LOG` overrides both the level and the per-module filters.
pub fn setup_logging(verbose: bool) {
    let mut builder = env_logger::Builder::default();
    builder.filter_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    let env_filter = std::env::var(DEFAULT_FILTER_ENV).ok();
    match LogFormat::choose(verbose, env_filter.as_deref()) {
        LogFormat::Detailed => {
            builder.format_timestamp_millis().format_target(true);
        }
        LogFormat::Short => {
            builder.format(|buf, record| {
                let level_style = buf.default_level_style(record.level()).bold();
                writeln!(
                    buf,
                    "{} {level_style}{}{level_style:#} {}",
                    buf.timestamp_seconds(),
                    record.level(),
                    record.args()
                )
            });
        }
    }

    builder.parse_default_env();
    builder.init();
}

#[cfg(test)]
pub(crate) fn enable_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
