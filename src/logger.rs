use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::Path;

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const ROLL_SIZE: u64 = 10 * 1024 * 1024;
const ROLL_KEEP: u32 = 7;

fn level_from(level: Option<&str>) -> LevelFilter {
    match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

/// Console logging for the daemon and the tests. Safe to call twice; the
/// second initialisation is ignored.
pub fn init_console(level: Option<&str>) {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .build(Root::builder().appender("console").build(level_from(level)));
    if let Ok(c) = config {
        let _ = log4rs::init_config(c);
    }
}

/// Rolling-file logging under `{base}/{name}_logs/{name}.log`, the layout
/// used for per-database logs.
pub fn init_for_scope(base: &Path, name: &str, level: Option<&str>) {
    let dir = base.join(format!("{name}_logs"));
    if std::fs::create_dir_all(&dir).is_err() {
        return init_console(level);
    }
    let roller = FixedWindowRoller::builder()
        .build(&format!("{}", dir.join(format!("{name}.{{}}.log")).display()), ROLL_KEEP);
    let Ok(roller) = roller else { return init_console(level) };
    let policy =
        CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_SIZE)), Box::new(roller));
    let appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(dir.join(format!("{name}.log")), Box::new(policy));
    let Ok(appender) = appender else { return init_console(level) };
    let config = Config::builder()
        .appender(Appender::builder().build("file", Box::new(appender)))
        .build(Root::builder().appender("file").build(level_from(level)));
    if let Ok(c) = config {
        let _ = log4rs::init_config(c);
    }
}
