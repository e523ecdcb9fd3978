use chrono::Local;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::LoggingConfig;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Unknown level names fall back to Info.
fn level_filter(level: &str) -> LevelFilter {
    level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)
}

/// Install the global logger.
///
/// Console output always goes to stderr: the stdio worker uses stdout for
/// protocol lines.
pub fn setup_logging(config: &LoggingConfig) -> Result<(), Box<dyn std::error::Error>> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();

    let mut builder =
        Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");

    if let Some(dir) = &config.dir {
        std::fs::create_dir_all(dir)?;
        let timestamp = Local::now().format("%Y-%m-%d-%H_%M").to_string();
        let file_appender = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(PATTERN)))
            .build(format!("{dir}/{timestamp}.log"))?;
        builder = builder.appender(Appender::builder().build("file", Box::new(file_appender)));
        root = root.appender("file");
    }

    let config = builder.build(root.build(level_filter(&config.level)))?;
    log4rs::init_config(config)?;

    Ok(())
}
