// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{catalog::XMode, codec::Charset, error::ConfigError};

const DEFAULT_N_OPS_SCALE: usize = 10;
const DEFAULT_MAX_VARBINARY_BYTES: usize = 100;
const DEFAULT_MAX_VARCHAR_CHARS: usize = 100;
const DEFAULT_RESULTS_DIR: &str = "target/crund";
const MAX_FIELD_BYTES: usize = u16::MAX as usize;

/// Benchmark run configuration.
///
/// The defaults describe a small smoke run against an in-memory store; a
/// real run usually starts from a TOML file, see [`Config::new_with_config_file`].
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) file_path: PathBuf,
    pub(crate) n_runs: usize,
    pub(crate) warmup_runs: usize,
    pub(crate) n_ops_start: usize,
    pub(crate) n_ops_end: usize,
    pub(crate) n_ops_scale: usize,
    pub(crate) modes: Vec<XMode>,
    pub(crate) max_varbinary_bytes: usize,
    pub(crate) max_varchar_chars: usize,
    pub(crate) charset: Charset,
    pub(crate) include: Vec<String>,
    pub(crate) exclude: Vec<String>,
    pub(crate) reinsert_attributes: bool,
    pub(crate) renew_connection: bool,
    pub(crate) renew_operations: bool,
    pub(crate) fail_on_error: bool,
    pub(crate) log_sum_of_ops: bool,
    pub(crate) enforce_foreign_keys: bool,
    pub(crate) results_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub(crate) n_runs: usize,
    pub(crate) n_ops_start: usize,
    pub(crate) n_ops_end: usize,
    pub(crate) file_path: Option<String>,
    pub(crate) warmup_runs: Option<usize>,
    pub(crate) n_ops_scale: Option<usize>,
    pub(crate) modes: Option<Vec<String>>,
    pub(crate) max_varbinary_bytes: Option<usize>,
    pub(crate) max_varchar_chars: Option<usize>,
    pub(crate) charset: Option<String>,
    #[serde(default)]
    pub(crate) include: Vec<String>,
    #[serde(default)]
    pub(crate) exclude: Vec<String>,
    pub(crate) reinsert_attributes: Option<bool>,
    pub(crate) renew_connection: Option<bool>,
    pub(crate) renew_operations: Option<bool>,
    pub(crate) fail_on_error: Option<bool>,
    pub(crate) log_sum_of_ops: Option<bool>,
    pub(crate) enforce_foreign_keys: Option<bool>,
    pub(crate) results_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            file_path: PathBuf::from(":memory:"),
            n_runs: 1,
            warmup_runs: 0,
            n_ops_start: 1000,
            n_ops_end: 1000,
            n_ops_scale: DEFAULT_N_OPS_SCALE,
            modes: XMode::ALL.to_vec(),
            max_varbinary_bytes: DEFAULT_MAX_VARBINARY_BYTES,
            max_varchar_chars: DEFAULT_MAX_VARCHAR_CHARS,
            charset: Charset::default(),
            include: Vec::new(),
            exclude: Vec::new(),
            reinsert_attributes: true,
            renew_connection: false,
            renew_operations: false,
            fail_on_error: false,
            log_sum_of_ops: true,
            enforce_foreign_keys: true,
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
        }
    }
}

impl Config {
    pub fn new(file_path: impl AsRef<Path>, n_ops: usize) -> Self {
        let mut config = Self::default();
        config.file_path(file_path).n_ops(n_ops, n_ops);
        config
    }

    /// Constructor of Config based on a config TOML file.
    /// `n_runs`, `n_ops_start` and `n_ops_end` must be present; every other
    /// key falls back to its default.
    pub fn new_with_config_file<P: AsRef<Path>>(config_file_path: P) -> Result<Self, ConfigError> {
        let path = config_file_path.as_ref();
        let config_file_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&config_file_str)
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(s)?;
        let mut config = Self::default();

        config
            .n_runs(file.n_runs)
            .n_ops(file.n_ops_start, file.n_ops_end)
            .include(file.include)
            .exclude(file.exclude);

        if let Some(p) = file.file_path {
            config.file_path(p);
        }
        if let Some(w) = file.warmup_runs {
            config.warmup_runs(w);
        }
        if let Some(s) = file.n_ops_scale {
            config.n_ops_scale(s);
        }
        if let Some(modes) = file.modes {
            let modes = modes
                .iter()
                .map(|m| m.parse())
                .collect::<Result<Vec<XMode>, _>>()?;
            config.modes(modes);
        }
        if let Some(b) = file.max_varbinary_bytes {
            config.max_varbinary_bytes(b);
        }
        if let Some(c) = file.max_varchar_chars {
            config.max_varchar_chars(c);
        }
        if let Some(cs) = file.charset {
            config.charset(cs.parse()?);
        }
        if let Some(v) = file.reinsert_attributes {
            config.reinsert_attributes(v);
        }
        if let Some(v) = file.renew_connection {
            config.renew_connection(v);
        }
        if let Some(v) = file.renew_operations {
            config.renew_operations(v);
        }
        if let Some(v) = file.fail_on_error {
            config.fail_on_error(v);
        }
        if let Some(v) = file.log_sum_of_ops {
            config.log_sum_of_ops(v);
        }
        if let Some(v) = file.enforce_foreign_keys {
            config.enforce_foreign_keys(v);
        }
        if let Some(d) = file.results_dir {
            config.results_dir(d);
        }

        config.validate()?;
        Ok(config)
    }

    /// Default: `:memory:`
    ///
    /// Where a backend keeps its data. Backends that can run without a file
    /// treat `:memory:` as a request to do so.
    pub fn file_path<P: AsRef<Path>>(&mut self, file_path: P) -> &mut Self {
        self.file_path = file_path.as_ref().to_path_buf();
        self
    }

    pub fn get_file_path(&self) -> &Path {
        &self.file_path
    }

    /// Default: 1
    pub fn n_runs(&mut self, n_runs: usize) -> &mut Self {
        self.n_runs = n_runs;
        self
    }

    pub fn get_n_runs(&self) -> usize {
        self.n_runs
    }

    /// Default: 0
    ///
    /// Runs executed before the measured ones; their timings are discarded.
    pub fn warmup_runs(&mut self, warmup_runs: usize) -> &mut Self {
        self.warmup_runs = warmup_runs;
        self
    }

    pub fn get_warmup_runs(&self) -> usize {
        self.warmup_runs
    }

    /// Default: 1000..=1000
    pub fn n_ops(&mut self, start: usize, end: usize) -> &mut Self {
        self.n_ops_start = start;
        self.n_ops_end = end;
        self
    }

    /// Default: 10
    pub fn n_ops_scale(&mut self, scale: usize) -> &mut Self {
        self.n_ops_scale = scale;
        self
    }

    /// Default: indy, each, bulk
    pub fn modes(&mut self, modes: Vec<XMode>) -> &mut Self {
        self.modes = modes;
        self
    }

    pub fn get_modes(&self) -> &[XMode] {
        &self.modes
    }

    /// Default: 100
    ///
    /// Upper bound of the varbinary length series; 0 disables those operations.
    pub fn max_varbinary_bytes(&mut self, max: usize) -> &mut Self {
        self.max_varbinary_bytes = max;
        self
    }

    pub fn get_max_varbinary_bytes(&self) -> usize {
        self.max_varbinary_bytes
    }

    /// Default: 100
    ///
    /// Upper bound of the varchar length series; 0 disables those operations.
    pub fn max_varchar_chars(&mut self, max: usize) -> &mut Self {
        self.max_varchar_chars = max;
        self
    }

    pub fn get_max_varchar_chars(&self) -> usize {
        self.max_varchar_chars
    }

    /// Default: utf8
    pub fn charset(&mut self, charset: Charset) -> &mut Self {
        self.charset = charset;
        self
    }

    pub fn get_charset(&self) -> Charset {
        self.charset
    }

    /// Default: empty, meaning every operation.
    ///
    /// Entries match either the full operation name or the name without its
    /// mode suffix.
    pub fn include(&mut self, names: Vec<String>) -> &mut Self {
        self.include = names;
        self
    }

    pub fn exclude(&mut self, names: Vec<String>) -> &mut Self {
        self.exclude = names;
        self
    }

    /// Default: true
    ///
    /// If set to false, the second insert pass writes keys only.
    pub fn reinsert_attributes(&mut self, v: bool) -> &mut Self {
        self.reinsert_attributes = v;
        self
    }

    /// Default: false
    ///
    /// Reopen the backend before every run.
    pub fn renew_connection(&mut self, v: bool) -> &mut Self {
        self.renew_connection = v;
        self
    }

    pub fn get_renew_connection(&self) -> bool {
        self.renew_connection
    }

    /// Default: false
    ///
    /// Rebuild the operation catalog before every run.
    pub fn renew_operations(&mut self, v: bool) -> &mut Self {
        self.renew_operations = v;
        self
    }

    pub fn get_renew_operations(&self) -> bool {
        self.renew_operations
    }

    /// Default: false
    ///
    /// Whether a failed backend run makes the whole benchmark fail.
    pub fn fail_on_error(&mut self, v: bool) -> &mut Self {
        self.fail_on_error = v;
        self
    }

    pub fn get_fail_on_error(&self) -> bool {
        self.fail_on_error
    }

    /// Default: true
    ///
    /// Append a row with the per-run sum over all operations to the log table.
    pub fn log_sum_of_ops(&mut self, v: bool) -> &mut Self {
        self.log_sum_of_ops = v;
        self
    }

    pub fn get_log_sum_of_ops(&self) -> bool {
        self.log_sum_of_ops
    }

    /// Default: true
    ///
    /// Whether backends reject `B.aid` values without a matching `A` row.
    pub fn enforce_foreign_keys(&mut self, v: bool) -> &mut Self {
        self.enforce_foreign_keys = v;
        self
    }

    pub fn get_enforce_foreign_keys(&self) -> bool {
        self.enforce_foreign_keys
    }

    /// Default: `target/crund`
    pub fn results_dir<P: AsRef<Path>>(&mut self, dir: P) -> &mut Self {
        self.results_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn get_results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Operation counts of successive rounds: `start, start * scale, ...`
    /// while not above `end`.
    pub fn op_sizes(&self) -> Vec<usize> {
        let scale = self.n_ops_scale.max(2);
        std::iter::successors(Some(self.n_ops_start), |n| n.checked_mul(scale))
            .take_while(|n| *n <= self.n_ops_end)
            .collect()
    }

    /// Validate the configuration and report any invalid parameter, if found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_runs == 0 {
            return Err(ConfigError::RunCount(
                "n_runs needs to be at least 1".to_string(),
            ));
        }

        if self.n_ops_start == 0 {
            return Err(ConfigError::OperationSize(
                "n_ops_start needs to be at least 1".to_string(),
            ));
        }

        if self.n_ops_start > self.n_ops_end {
            return Err(ConfigError::OperationSize(
                "n_ops_start cannot be greater than n_ops_end".to_string(),
            ));
        }

        if self.n_ops_end > i32::MAX as usize {
            return Err(ConfigError::OperationSize(format!(
                "n_ops_end cannot be larger than {}",
                i32::MAX
            )));
        }

        if self.n_ops_scale < 2 {
            return Err(ConfigError::OperationSize(
                "n_ops_scale needs to be at least 2".to_string(),
            ));
        }

        if self.modes.is_empty() {
            return Err(ConfigError::Modes(
                "at least one batching mode must be enabled".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        if let Some(dup) = self.modes.iter().find(|m| !seen.insert(**m)) {
            return Err(ConfigError::Modes(format!("mode {dup} listed twice")));
        }

        if self.max_varbinary_bytes > MAX_FIELD_BYTES {
            return Err(ConfigError::FieldLength(format!(
                "max_varbinary_bytes cannot be larger than {MAX_FIELD_BYTES}"
            )));
        }

        let per_char = self.charset.max_bytes_per_char();
        let varchar_bytes = self.max_varchar_chars.checked_mul(per_char);
        if varchar_bytes.map_or(true, |bytes| bytes > MAX_FIELD_BYTES) {
            return Err(ConfigError::FieldLength(format!(
                "max_varchar_chars cannot be larger than {} with charset {:?}",
                MAX_FIELD_BYTES / per_char,
                self.charset
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG_FILE: &str = "src/sample_config.toml";

    #[test]
    fn test_new_with_config_file() {
        let config = Config::new_with_config_file(SAMPLE_CONFIG_FILE).unwrap();

        assert_eq!(config.n_runs, 3);
        assert_eq!(config.warmup_runs, 1);
        assert_eq!(config.op_sizes(), vec![100, 1000]);
        assert_eq!(config.modes, vec![XMode::Indy, XMode::Bulk]);
        assert_eq!(config.charset, Charset::Latin1);
        assert_eq!(config.file_path, PathBuf::from(":memory:"));
        assert_eq!(config.exclude, vec!["A_getBs".to_string()]);
        assert!(!config.reinsert_attributes);
        // absent keys keep their defaults
        assert_eq!(config.max_varbinary_bytes, DEFAULT_MAX_VARBINARY_BYTES);
        assert!(config.enforce_foreign_keys);
    }

    #[test]
    fn test_missing_required_key() {
        let err = Config::from_toml("n_runs = 1\nn_ops_start = 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_unreadable_file() {
        let err = Config::new_with_config_file("does/not/exist.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_unknown_mode_and_charset() {
        let toml = "n_runs = 1\nn_ops_start = 1\nn_ops_end = 1\nmodes = [\"indy\", \"batch\"]\n";
        assert!(matches!(
            Config::from_toml(toml).unwrap_err(),
            ConfigError::UnknownMode(m) if m == "batch"
        ));

        let toml = "n_runs = 1\nn_ops_start = 1\nn_ops_end = 1\ncharset = \"ebcdic\"\n";
        assert!(matches!(
            Config::from_toml(toml).unwrap_err(),
            ConfigError::UnknownCharset(_)
        ));
    }

    #[test]
    fn test_op_sizes() {
        let mut config = Config::default();
        config.n_ops(1, 1000).n_ops_scale(10);
        assert_eq!(config.op_sizes(), vec![1, 10, 100, 1000]);

        config.n_ops(5, 60).n_ops_scale(2);
        assert_eq!(config.op_sizes(), vec![5, 10, 20, 40]);
    }

    #[test]
    fn test_validate() {
        assert!(Config::default().validate().is_ok());

        let mut config = Config::default();
        config.n_runs(0);
        assert!(matches!(config.validate(), Err(ConfigError::RunCount(_))));

        let mut config = Config::default();
        config.n_ops(10, 5);
        assert!(matches!(config.validate(), Err(ConfigError::OperationSize(_))));

        let mut config = Config::default();
        config.modes(vec![XMode::Bulk, XMode::Bulk]);
        assert!(matches!(config.validate(), Err(ConfigError::Modes(_))));

        let mut config = Config::default();
        config.modes(Vec::new());
        assert!(matches!(config.validate(), Err(ConfigError::Modes(_))));

        let mut config = Config::default();
        config.max_varchar_chars(20_000);
        assert!(matches!(config.validate(), Err(ConfigError::FieldLength(_))));
        config.charset(Charset::Latin1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_huge_varchar_length_is_rejected() {
        let toml = "n_runs = 1\nn_ops_start = 1\nn_ops_end = 1\nmax_varchar_chars = 9000000000000000000\n";
        assert!(matches!(
            Config::from_toml(toml),
            Err(ConfigError::FieldLength(_))
        ));

        let mut config = Config::default();
        config.max_varchar_chars(usize::MAX).charset(Charset::Latin1);
        assert!(matches!(config.validate(), Err(ConfigError::FieldLength(_))));
    }
}
