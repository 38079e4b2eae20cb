#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use serde::Deserialize;
use shadow_core::{Primitives, Ratio};
use thiserror::Error;

pub const CONFIG_FILE: &str = "shadowdp.toml";

#[derive(Debug, Error, Diagnostic)]
#[error("config error: {message}")]
#[diagnostic(code(shadowdp::config))]
pub struct ConfigError {
    pub message: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub verifier: VerifierConfig,
    pub primitives: PrimitivesConfig,
    pub policy: PolicyConfig,
    pub log: LogConfig,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifierConfig {
    /// Checker installation directory (holds `scripts/cpa.sh`).
    pub path: PathBuf,
    /// Extra arguments appended to every run, split on whitespace.
    pub args: String,
    pub timeout_secs: u64,
    /// Solver configurations raced against each other.
    pub configs: Vec<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./cpachecker"),
            args: String::new(),
            timeout_secs: 30,
            configs: vec!["MathSat".to_string(), "Z3".to_string(), "SMTInterpol".to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrimitivesConfig {
    pub assume: String,
    pub assert: String,
    pub havoc: String,
}

impl Default for PrimitivesConfig {
    fn default() -> Self {
        let p = shadow_backend_c::cpachecker_primitives();
        Self {
            assume: p.assume,
            assert: p.assert,
            havoc: p.havoc,
        }
    }
}

impl From<&PrimitivesConfig> for Primitives {
    fn from(c: &PrimitivesConfig) -> Self {
        Primitives {
            assume: c.assume.clone(),
            assert: c.assert.clone(),
            havoc: c.havoc.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    /// Largest distance of one query answer.
    pub element_bound: i64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self { element_bound: 1 }
    }
}

impl PolicyConfig {
    pub fn element_bound(&self) -> Ratio {
        Ratio::integer(i128::from(self.element_bound))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

pub fn parse_config(raw: &str, base: &Path) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(raw).map_err(|e| ConfigError {
        message: e.to_string(),
    })?;
    if config.policy.element_bound <= 0 {
        return Err(ConfigError {
            message: format!("policy.element_bound must be positive, got {}", config.policy.element_bound),
        });
    }
    if config.verifier.configs.is_empty() {
        return Err(ConfigError {
            message: "verifier.configs lists no solver configuration".to_string(),
        });
    }
    if config.verifier.path.is_relative() {
        config.verifier.path = base.join(&config.verifier.path);
    }
    Ok(config)
}

/// Load `explicit` if given, else `shadowdp.toml` in the current directory
/// when present, else the defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let candidate = PathBuf::from(CONFIG_FILE);
            if !candidate.exists() {
                return Ok(Config::default());
            }
            candidate
        }
    };
    let raw = fs::read_to_string(&path).map_err(|e| ConfigError {
        message: format!("failed to read {}: {e}", path.display()),
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    parse_config(&raw, base).map_err(|e| ConfigError {
        message: format!("{}: {}", path.display(), e.message),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("", Path::new(".")).unwrap();
        assert_eq!(config.verifier.timeout_secs, 30);
        assert_eq!(config.verifier.configs, ["MathSat", "Z3", "SMTInterpol"]);
        assert_eq!(config.primitives.assume, "__VERIFIER_assume");
        assert_eq!(config.policy.element_bound(), Ratio::ONE);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn sections_override_defaults_independently() {
        let raw = r#"
[verifier]
path = "tools/cpa"
timeout_secs = 5
configs = ["Z3"]

[policy]
element_bound = 2
"#;
        let config = parse_config(raw, Path::new("/work")).unwrap();
        assert_eq!(config.verifier.path, PathBuf::from("/work/tools/cpa"));
        assert_eq!(config.verifier.timeout_secs, 5);
        assert_eq!(config.verifier.configs, ["Z3"]);
        assert_eq!(config.verifier.args, "");
        assert_eq!(config.policy.element_bound(), Ratio::integer(2));
        assert_eq!(config.primitives, PrimitivesConfig::default());
    }

    #[test]
    fn primitives_flow_into_engine_names() {
        let raw = "[primitives]\nassume = \"assume\"\nassert = \"assert\"\nhavoc = \"havoc\"\n";
        let config = parse_config(raw, Path::new(".")).unwrap();
        assert_eq!(Primitives::from(&config.primitives), Primitives::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = parse_config("[policy]\nelement_bound = 0\n", Path::new(".")).unwrap_err();
        assert!(err.message.contains("element_bound"), "{}", err.message);

        let err = parse_config("[verifier]\nconfigs = []\n", Path::new(".")).unwrap_err();
        assert!(err.message.contains("configs"), "{}", err.message);

        assert!(parse_config("[verifier]\nsolver = \"z3\"\n", Path::new(".")).is_err());
    }
}
