/// log4rs setup shared by the supervisor and worker processes.
///
/// Logs go to stderr; stdout of a worker is reserved for its readiness line.
///
use anyhow::{anyhow, Result};
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::{Path, PathBuf};

pub const DEFAULT_LOG_CONFIG: &str = "config/log4rs.yaml";
pub const DEFAULT_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%S%.3f)} {h({l:<5})} [pid {P}] {t} - {m}{n}";

/// pick the log config file: an explicit path must exist, the default one may be absent
pub fn config_file(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) if path.exists() => Ok(Some(path.to_path_buf())),
        Some(path) => Err(anyhow!("log config not found: {}", path.display())),
        None => {
            let path = PathBuf::from(DEFAULT_LOG_CONFIG);
            Ok(path.exists().then_some(path))
        }
    }
}

/// the console config used when no log4rs file is present
pub fn stderr_config(level: LevelFilter) -> Result<Config> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(DEFAULT_PATTERN)))
        .build();

    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))?;

    Ok(config)
}

/// start logging from the log4rs file if there is one, else to stderr at `level`
pub fn init(explicit: Option<&Path>, level: LevelFilter) -> Result<()> {
    match config_file(explicit)? {
        Some(path) => log4rs::init_file(&path, Default::default())?,
        None => {
            log4rs::init_config(stderr_config(level)?)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_explicit_file() {
        let path = Path::new("/definitely/not/here/log4rs.yaml");
        assert!(config_file(Some(path)).is_err());
    }

    #[test]
    fn console_config_builds() {
        let config = stderr_config(LevelFilter::Debug).unwrap();
        assert_eq!(config.root().level(), LevelFilter::Debug);
        assert_eq!(config.appenders().len(), 1);
    }
}
