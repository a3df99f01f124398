//! Per-request pre-transform configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How evaluated datasets are written back into the specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// Replace the data entry with inline `values` rows.
    Inline,
    /// Replace the data entry with a `url` reference plus the generated query.
    VendorReference,
}

/// What happens when an executor fails for one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorErrorPolicy {
    /// Abort the whole request.
    FailRequest,
    /// Leave that dataset (and its dependents) unevaluated and warn.
    SkipDataset,
}

/// SQL flavour used when a plan is rendered as text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    Generic,
    Spark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreTransformConfig {
    pub output_mode: OutputMode,

    pub on_executor_error: ExecutorErrorPolicy,

    /// IANA zone used by `timeunit` when the transform names none.
    pub local_timezone: String,

    /// Keep transforms that depend on interactive signals client-side.
    pub preserve_client_interactivity: bool,

    /// Bound on concurrently running data-source evaluations.
    pub max_parallel_tasks: usize,

    /// Truncate evaluated tables to this many rows (with a warning).
    pub row_limit: Option<usize>,

    /// Dialect for rendered SQL (vendor references and SQL executors).
    pub sql_dialect: SqlDialect,
}

impl Default for PreTransformConfig {
    fn default() -> Self {
        Self {
            output_mode: OutputMode::Inline,
            on_executor_error: ExecutorErrorPolicy::FailRequest,
            local_timezone: "UTC".to_string(),
            preserve_client_interactivity: true,
            max_parallel_tasks: 4,
            row_limit: None,
            sql_dialect: SqlDialect::Generic,
        }
    }
}

impl PreTransformConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `PREVEGA_OUTPUT_MODE`: `inline` or `vendor_reference`
    /// - `PREVEGA_ON_EXECUTOR_ERROR`: `fail_request` or `skip_dataset`
    /// - `PREVEGA_LOCAL_TIMEZONE`: IANA timezone name
    /// - `PREVEGA_PRESERVE_INTERACTIVITY`: `true`/`false`
    /// - `PREVEGA_MAX_PARALLEL_TASKS`: parallelism bound
    /// - `PREVEGA_ROW_LIMIT`: maximum rows per evaluated dataset
    /// - `PREVEGA_SQL_DIALECT`: `generic` or `spark`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("PREVEGA_OUTPUT_MODE") {
            match s.as_str() {
                "inline" => cfg.output_mode = OutputMode::Inline,
                "vendor_reference" => cfg.output_mode = OutputMode::VendorReference,
                _ => {}
            }
        }

        if let Ok(s) = std::env::var("PREVEGA_ON_EXECUTOR_ERROR") {
            match s.as_str() {
                "fail_request" => cfg.on_executor_error = ExecutorErrorPolicy::FailRequest,
                "skip_dataset" => cfg.on_executor_error = ExecutorErrorPolicy::SkipDataset,
                _ => {}
            }
        }

        if let Ok(s) = std::env::var("PREVEGA_LOCAL_TIMEZONE") {
            cfg.local_timezone = s;
        }

        if let Ok(s) = std::env::var("PREVEGA_PRESERVE_INTERACTIVITY") {
            if let Ok(v) = s.parse::<bool>() {
                cfg.preserve_client_interactivity = v;
            }
        }

        if let Ok(s) = std::env::var("PREVEGA_MAX_PARALLEL_TASKS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_parallel_tasks = v;
            }
        }

        if let Ok(s) = std::env::var("PREVEGA_ROW_LIMIT") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.row_limit = Some(v);
            }
        }

        if let Ok(s) = std::env::var("PREVEGA_SQL_DIALECT") {
            match s.as_str() {
                "generic" => cfg.sql_dialect = SqlDialect::Generic,
                "spark" => cfg.sql_dialect = SqlDialect::Spark,
                _ => {}
            }
        }

        cfg
    }

    /// Parse a YAML document; missing keys take their defaults.
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_tasks == 0 {
            return Err(Error::Config("max_parallel_tasks must be at least 1".into()));
        }
        self.timezone()?;
        Ok(())
    }

    pub fn timezone(&self) -> Result<chrono_tz::Tz> {
        self.local_timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|_| Error::Config(format!("unknown timezone '{}'", self.local_timezone)))
    }
}
