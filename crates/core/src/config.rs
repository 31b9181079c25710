use std::path::Path;

use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `FUNNEL_EXPRESS__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Controls how a batch of visits is partitioned across worker threads.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_parallel")]
    pub parallel: bool,
    /// Worker threads for parallel evaluation; 0 uses the rayon global pool.
    #[serde(default)]
    pub num_threads: usize,
    /// Batches smaller than this are evaluated on the calling thread.
    #[serde(default = "default_min_visits_per_task")]
    pub min_visits_per_task: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Soft-deleted funnels are purged once they have not been updated for
    /// this many days.
    #[serde(default = "default_deleted_funnel_days")]
    pub deleted_funnel_days: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_json")]
    pub json: bool,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

// Default functions
fn default_parallel() -> bool {
    true
}
fn default_min_visits_per_task() -> usize {
    1024
}
fn default_deleted_funnel_days() -> u32 {
    30
}
fn default_log_json() -> bool {
    true
}
fn default_log_filter() -> String {
    "funnel_express=info,funnel_reporting=info".to_string()
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            num_threads: 0,
            min_visits_per_task: default_min_visits_per_task(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            deleted_funnel_days: default_deleted_funnel_days(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: default_log_json(),
            filter: default_log_filter(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            evaluator: EvaluatorConfig::default(),
            retention: RetentionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    /// Environment variables take precedence over the file.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("FUNNEL_EXPRESS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert!(config.evaluator.parallel);
        assert_eq!(config.evaluator.num_threads, 0);
        assert_eq!(config.evaluator.min_visits_per_task, 1024);
        assert_eq!(config.retention.deleted_funnel_days, 30);
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!(
            "funnel-express-config-{}.toml",
            std::process::id()
        ));
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "[evaluator]").unwrap();
            writeln!(file, "parallel = false").unwrap();
            writeln!(file, "min_visits_per_task = 10").unwrap();
            writeln!(file, "[retention]").unwrap();
            writeln!(file, "deleted_funnel_days = 7").unwrap();
        }

        let config = AppConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert!(!config.evaluator.parallel);
        assert_eq!(config.evaluator.min_visits_per_task, 10);
        assert_eq!(config.retention.deleted_funnel_days, 7);
        // Sections absent from the file fall back to defaults
        assert!(config.logging.json);
    }
}
