use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

fn default_models() -> Vec<String> {
    [
        "qwen2.5",
        "qwen2.5:3b",
        "qwen2.5:14b",
        "qwen2.5:32b",
        "llama3.2",
        "llama3.2:1b",
        "llama3.1:70b",
        "gemma2:27b",
        "phi3.5",
        "codegemma",
    ]
    .iter()
    .map(|m| m.to_string())
    .collect()
}

fn default_request_timeout() -> u64 {
    600
}

fn default_image_api_url() -> String {
    "https://commons.wikimedia.org/w/api.php".to_string()
}

fn default_user_agent() -> String {
    format!("gen-browser/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_attempts() -> usize {
    3
}

fn default_candidate_limit() -> usize {
    20
}

fn default_concurrency() -> usize {
    8
}

fn default_image_timeout() -> u64 {
    20
}

fn default_page_timeout() -> u64 {
    90
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub images: ImageConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub host: String,
    pub model: String,
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        OllamaConfig {
            host: "http://localhost:11434".to_string(),
            model: "qwen2.5".to_string(),
            models: default_models(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl OllamaConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_api_url")]
    pub api_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Search attempts per image before the placeholder is used.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,
    /// Resolutions running at once for a single page.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_image_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_timeout")]
    pub page_timeout_secs: u64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        ImageConfig {
            api_url: default_image_api_url(),
            user_agent: default_user_agent(),
            max_attempts: default_max_attempts(),
            candidate_limit: default_candidate_limit(),
            concurrency: default_concurrency(),
            timeout_secs: default_image_timeout(),
            page_timeout_secs: default_page_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub min_width: u32,
    pub min_height: u32,
    #[serde(default = "default_true")]
    pub dark_mode: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        WindowConfig {
            width: 1280,
            height: 720,
            min_width: 640,
            min_height: 400,
            dark_mode: true,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = Self::get_config_path();

        if config_path.exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => match Self::parse(&contents) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Error parsing {}: {}. Using defaults.", config_path.display(), e)
                    }
                },
                Err(e) => {
                    tracing::warn!("Error reading {}: {}. Using defaults.", config_path.display(), e)
                }
            }
        } else if let Some(parent) = config_path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        Config::default()
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn get_config_path() -> PathBuf {
        Self::get_config_dir().join("config.toml")
    }

    pub fn get_config_dir() -> PathBuf {
        if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home).join(".config/gen-browser")
        } else {
            PathBuf::from(".")
        }
    }

    pub fn bookmarks_path() -> PathBuf {
        Self::get_config_dir().join("bookmarks.json")
    }

    pub fn pages_dir() -> PathBuf {
        Self::get_config_dir().join("pages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.ollama.host, "http://localhost:11434");
        assert_eq!(config.ollama.model, "qwen2.5");
        assert_eq!(config.images.max_attempts, 3);
        assert_eq!(config.images.candidate_limit, 20);
        assert!(config.window.dark_mode);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
            [ollama]
            host = "http://gpu-box:11434"
            model = "llama3.2"

            [images]
            concurrency = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.ollama.host, "http://gpu-box:11434");
        assert_eq!(config.ollama.model, "llama3.2");
        assert!(config.ollama.models.contains(&"qwen2.5".to_string()));
        assert_eq!(config.ollama.request_timeout(), Duration::from_secs(600));
        assert_eq!(config.images.concurrency, 2);
        assert_eq!(config.images.timeout_secs, 20);
        assert_eq!(config.window.width, 1280);
    }

    #[test]
    fn test_single_window_field() {
        let config = Config::parse("[window]\ndark_mode = false\n").unwrap();
        assert!(!config.window.dark_mode);
        assert_eq!((config.window.width, config.window.height), (1280, 720));
        assert_eq!((config.window.min_width, config.window.min_height), (640, 400));
        assert_eq!(config.ollama.host, "http://localhost:11434");
    }

    #[test]
    fn test_single_ollama_field() {
        let config = Config::parse("[ollama]\nmodel = \"llama3.2\"\n").unwrap();
        assert_eq!(config.ollama.model, "llama3.2");
        assert_eq!(config.ollama.host, "http://localhost:11434");
        assert_eq!(config.ollama.request_timeout_secs, 600);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(Config::parse("[ollama\nhost = 1").is_err());
    }
}
