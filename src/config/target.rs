use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// Machine architecture of an accelerator target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum March {
    /// Floating-point tensor processor.
    Bm1680,
    /// int8 tensor processor.
    Bm1880,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid target name '{name}'")]
    InvalidName { name: String },
    #[error("unknown target '{name}' (looked for '{looked}'); available targets: bm1880, bm1680")]
    Unknown { name: String, looked: String },
    #[error("cannot read target config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: {reason}")]
    Invalid { path: String, reason: String },
}

/// Accelerator target configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetConfig {
    /// Short identifier used in CLI and file paths (e.g. "bm1880").
    pub name: String,
    /// Human-readable name.
    pub display_name: String,
    pub march: March,
    /// Whether the target executes int8 and needs a calibration table.
    pub quantized: bool,
    /// Signed width of fixed-point multipliers.
    pub multiplier_bits: u32,
    /// File extension of the instruction listing (e.g. ".s").
    pub output_extension: String,
}

#[derive(Deserialize)]
struct TargetFile {
    target: TargetSection,
}

#[derive(Deserialize)]
struct TargetSection {
    name: String,
    display_name: Option<String>,
    march: March,
    quantized: Option<bool>,
    multiplier_bits: Option<u32>,
    output_extension: Option<String>,
}

impl TargetConfig {
    /// Built-in BM1880 configuration.
    pub fn bm1880() -> Self {
        Self {
            name: "bm1880".to_string(),
            display_name: "BM1880 (int8)".to_string(),
            march: March::Bm1880,
            quantized: true,
            multiplier_bits: 16,
            output_extension: ".s".to_string(),
        }
    }

    /// Built-in BM1680 configuration.
    pub fn bm1680() -> Self {
        Self {
            name: "bm1680".to_string(),
            display_name: "BM1680 (fp32)".to_string(),
            march: March::Bm1680,
            quantized: false,
            multiplier_bits: 16,
            output_extension: ".s".to_string(),
        }
    }

    /// Load a target configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse_toml(&content, path)
    }

    /// Resolve a target by name: built-ins first, then `targets/{name}.toml`
    /// relative to the compiler binary or the working directory.
    pub fn resolve(name: &str) -> Result<Self, ConfigError> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || name.starts_with('.')
        {
            return Err(ConfigError::InvalidName {
                name: name.to_string(),
            });
        }

        match name {
            "bm1880" => return Ok(Self::bm1880()),
            "bm1680" => return Ok(Self::bm1680()),
            _ => {}
        }

        let relative = format!("targets/{}.toml", name);
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Ok(exe) = std::env::current_exe() {
            let mut dir = exe.parent();
            for _ in 0..3 {
                let Some(d) = dir else { break };
                candidates.push(d.join(&relative));
                dir = d.parent();
            }
        }
        candidates.push(PathBuf::from(&relative));

        match candidates.iter().find(|p| p.exists()) {
            Some(path) => Self::load(path),
            None => Err(ConfigError::Unknown {
                name: name.to_string(),
                looked: relative,
            }),
        }
    }

    fn parse_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        let err = |reason: String| ConfigError::Invalid {
            path: path.display().to_string(),
            reason,
        };
        let file: TargetFile = toml::from_str(content).map_err(|e| err(e.to_string()))?;
        let t = file.target;
        if t.name.is_empty() {
            return Err(err("missing target.name".to_string()));
        }
        let multiplier_bits = t.multiplier_bits.unwrap_or(16);
        if !(2..=32).contains(&multiplier_bits) {
            return Err(err(format!(
                "target.multiplier_bits must be in 2..=32, found {}",
                multiplier_bits
            )));
        }
        Ok(Self {
            display_name: t.display_name.unwrap_or_else(|| t.name.clone()),
            name: t.name,
            march: t.march,
            quantized: t.quantized.unwrap_or(t.march == March::Bm1880),
            multiplier_bits,
            output_extension: t.output_extension.unwrap_or_else(|| ".s".to_string()),
        })
    }
}
