use crate::core::{Result, ShelfError};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub sanitize: Option<SanitizeConfig>,
    /// Bootstrap records, one `[[reference]]` table each.
    #[serde(default, rename = "reference")]
    pub references: Vec<toml::value::Table>,
}

/// Output sanitization configuration.
#[derive(Debug, Deserialize)]
pub struct SanitizeConfig {
    pub html: Option<bool>,
}

impl Config {
    /// HTML escaping is on unless `[sanitize] html = false`.
    pub fn html_escaping(&self) -> bool {
        self.sanitize
            .as_ref()
            .and_then(|s| s.html)
            .unwrap_or(true)
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Example
///
/// ```no_run
/// let config = sqlshelf::config::load_config("config.toml").expect("Failed to load config");
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| ShelfError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    Ok(toml::from_str(&content)?)
}

/// `<config dir>/sqlshelf/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sqlshelf").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_CONFIG: &str = r#"
[sanitize]
html = false

[[reference]]
type = "literal"
name = "main"
dbName = "app"
dsn = "sqlite:/var/lib/app/app.db"
options = { mode = "ro" }

[[reference]]
type = "external-source"
name = "reports"
dbName = "reports"
locator = "/etc/app/connections.toml"
slot = "reporting"
"#;

    #[test]
    fn test_load_config_from_str() {
        let config: Config = toml::from_str(SAMPLE_CONFIG).expect("Failed to parse sample config");
        assert!(!config.html_escaping());
        assert_eq!(config.references.len(), 2);
        assert_eq!(config.references[0].get("name").and_then(|v| v.as_str()), Some("main"));
        assert_eq!(config.references[1].get("slot").and_then(|v| v.as_str()), Some("reporting"));
    }

    #[test]
    fn test_empty_config_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.html_escaping());
        assert!(config.references.is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE_CONFIG.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.references.len(), 2);
    }

    #[test]
    fn test_load_config_errors() {
        assert!(matches!(load_config("/nonexistent/sqlshelf.toml"), Err(ShelfError::Config(_))));

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(b"[[reference]\nname = ").unwrap();
        assert!(matches!(load_config(file.path()), Err(ShelfError::Config(_))));
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("sqlshelf/config.toml"));
        }
    }
}
