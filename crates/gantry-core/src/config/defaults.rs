//! Default configuration values

/// Default configuration file name (TOML)
pub const DEFAULT_CONFIG_TOML: &str = "gantry.toml";

/// Default configuration file name (YAML)
pub const DEFAULT_CONFIG_YAML: &str = "gantry.yaml";

/// Dist-tag a non-latest publish lands on before it is moved
pub const DEFAULT_TEMP_TAG: &str = "gantry-temp";

/// The dist-tag installs resolve by default
pub const LATEST_TAG: &str = "latest";

/// Packages published at the same time within a batch
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Get list of config file names to search for, in priority order
pub fn config_file_names() -> Vec<&'static str> {
    vec![
        DEFAULT_CONFIG_TOML,
        DEFAULT_CONFIG_YAML,
        ".gantry.toml",
        ".gantry.yaml",
    ]
}
