use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure that can be loaded from CLI or a config file
///
/// Example configuration file content
/// # Video Snapshot Configuration
///
/// # Server configuration
/// listen_on_port = 5001
/// workspace = "./data"
///
/// # Extraction configuration
/// jpeg_quality = 85
/// max_upload_bytes = 1073741824
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = 5001)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Working directory for temporary upload staging
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// JPEG quality for extracted frames (1-100)
    #[arg(short = 'q', long, default_value_t = 85)]
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// Maximum accepted upload size in bytes
    #[arg(short = 'm', long, default_value_t = default_max_upload_bytes())]
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,

    /// Configuration file path (overrides all other arguments)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            workspace: default_workspace(),
            jpeg_quality: default_jpeg_quality(),
            max_upload_bytes: default_max_upload_bytes(),
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        // First parse CLI args
        let mut config = Config::parse();

        // If a config file is specified, load it and merge
        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If the CLI value is still the default, use the file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.jpeg_quality == default_jpeg_quality() {
            self.jpeg_quality = file_config.jpeg_quality;
        }
        if self.max_upload_bytes == default_max_upload_bytes() {
            self.max_upload_bytes = file_config.max_upload_bytes;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err(anyhow::anyhow!(
                "jpeg_quality must be in the range 1-100, got {}",
                self.jpeg_quality
            ));
        }

        if self.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("max_upload_bytes cannot be zero"));
        }

        Ok(())
    }
}

// Default value functions
fn default_port() -> u16 {
    5001
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_jpeg_quality() -> u8 {
    85
}

fn default_max_upload_bytes() -> usize {
    1024 * 1024 * 1024
}
