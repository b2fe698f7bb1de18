//! Configuration management for genforge
//!
//! Stores settings in ~/.config/genforge/config.json. Every section has defaults, so a
//! config file only needs the fields it wants to change. The loaded value is passed into
//! each component explicitly; nothing reads configuration from globals.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::util::write_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub generation: GenerationConfig,
    pub toolchain: ToolchainConfig,
    pub packages: PackageConfig,
    pub tree: TreeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of an OpenAI-compatible API; `/chat/completions` is appended.
    pub base_url: String,
    pub model: String,
    /// Never written back to disk. Prefer the environment.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub system_prompt: String,
    /// Hard wall-clock ceiling for one streamed attempt.
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Linear backoff unit: attempt `n` failing sleeps `n * backoff_secs`.
    pub backoff_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://integrate.api.nvidia.com/v1".to_string(),
            model: "moonshotai/kimi-k2.5".to_string(),
            api_key: None,
            system_prompt: crate::llm::prompts::CODEGEN_SYSTEM.to_string(),
            request_timeout_secs: 900,
            connect_timeout_secs: 30,
            backoff_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    pub retries: u32,
    pub temperature: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 16384,
            retries: 3,
            temperature: 0.7,
        }
    }
}

/// An external program plus its fixed arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub build: CommandSpec,
    /// Installs named packages; the names are appended to `args`.
    pub install: CommandSpec,
    /// Full dependency install run once before the first build, if set.
    pub install_all: Option<CommandSpec>,
    pub build_timeout_secs: u64,
    pub install_timeout_secs: u64,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            build: CommandSpec::new("npm", &["run", "build"]),
            install: CommandSpec::new("npm", &["install", "--legacy-peer-deps"]),
            install_all: Some(CommandSpec::new("npm", &["install", "--legacy-peer-deps"])),
            build_timeout_secs: 180,
            install_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackageConfig {
    /// Version pins known to build together. Unknown packages get `latest`.
    pub known_good_versions: BTreeMap<String, String>,
    /// Platform builtins and framework packages that never go into the manifest.
    pub builtins: Vec<String>,
    /// Import prefixes that map to project files rather than packages.
    pub path_alias_prefixes: Vec<String>,
    pub required_dependencies: BTreeMap<String, String>,
    pub required_dev_dependencies: BTreeMap<String, String>,
}

const KNOWN_GOOD_VERSIONS: &[(&str, &str)] = &[
    ("next", "^14.2.21"),
    ("react", "^18.3.1"),
    ("react-dom", "^18.3.1"),
    ("typescript", "^5.7.3"),
    ("@types/node", "^20.17.16"),
    ("@types/react", "^18.3.18"),
    ("@types/react-dom", "^18.3.5"),
    ("tailwindcss", "^3.4.17"),
    ("postcss", "^8.5.1"),
    ("autoprefixer", "^10.4.20"),
    ("eslint", "^8.56.0"),
    ("eslint-config-next", "^14.2.21"),
    ("@supabase/supabase-js", "^2.49.1"),
    ("lucide-react", "^0.469.0"),
    ("framer-motion", "^11.18.0"),
    ("recharts", "^2.15.0"),
    ("date-fns", "^4.1.0"),
    ("clsx", "^2.1.0"),
    ("tailwind-merge", "^2.2.0"),
    ("class-variance-authority", "^0.7.0"),
    ("@radix-ui/react-dialog", "^1.0.5"),
    ("@radix-ui/react-dropdown-menu", "^2.0.6"),
    ("@radix-ui/react-slot", "^1.0.2"),
    ("@radix-ui/react-toast", "^1.1.5"),
    ("@radix-ui/react-tabs", "^1.0.4"),
    ("@headlessui/react", "^2.2.0"),
    ("@heroicons/react", "^2.2.0"),
    ("zustand", "^5.0.0"),
    ("react-hot-toast", "^2.4.1"),
    ("react-icons", "^5.4.0"),
    ("sonner", "^1.7.0"),
    ("uuid", "^9.0.0"),
    ("zod", "^3.22.0"),
    ("react-hook-form", "^7.50.0"),
    ("chart.js", "^4.4.1"),
    ("react-chartjs-2", "^5.2.0"),
    ("cmdk", "^0.2.0"),
    ("react-dropzone", "^14.2.3"),
    ("react-markdown", "^9.0.1"),
    ("next-themes", "^0.2.1"),
    ("sharp", "^0.33.2"),
    ("axios", "^1.6.7"),
    ("papaparse", "^5.4.1"),
    ("js-yaml", "^4.1.0"),
    ("fast-xml-parser", "^4.3.4"),
    ("jspdf", "^2.5.1"),
    ("jspdf-autotable", "^3.8.2"),
    ("@dnd-kit/core", "^6.3.0"),
    ("@dnd-kit/sortable", "^10.0.0"),
];

const BUILTINS: &[&str] = &[
    "fs",
    "path",
    "os",
    "crypto",
    "stream",
    "util",
    "http",
    "https",
    "url",
    "events",
    "buffer",
    "child_process",
    "net",
    "tls",
    "dns",
    "zlib",
    "querystring",
    "assert",
    "readline",
    "string_decoder",
    "timers",
    "tty",
    "vm",
    "worker_threads",
    "cluster",
    "dgram",
    "perf_hooks",
    "process",
    // Framework packages the sanitizer already guarantees.
    "react",
    "react-dom",
    "next",
];

fn pins(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(name, version)| (name.to_string(), version.to_string()))
        .collect()
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            known_good_versions: pins(KNOWN_GOOD_VERSIONS),
            builtins: BUILTINS.iter().map(|s| s.to_string()).collect(),
            path_alias_prefixes: vec!["@/".to_string(), "~/".to_string()],
            required_dependencies: pins(&[
                ("next", "^14.2.21"),
                ("react", "^18.3.1"),
                ("react-dom", "^18.3.1"),
            ]),
            required_dev_dependencies: pins(&[
                ("typescript", "^5.7.3"),
                ("@types/node", "^20.17.16"),
                ("@types/react", "^18.3.18"),
                ("@types/react-dom", "^18.3.5"),
            ]),
        }
    }
}

impl PackageConfig {
    pub fn version_for(&self, package: &str) -> String {
        self.known_good_versions
            .get(package)
            .cloned()
            .unwrap_or_else(|| "latest".to_string())
    }

    pub fn is_builtin(&self, package: &str) -> bool {
        package.starts_with("node:") || self.builtins.iter().any(|b| b == package)
    }

    pub fn is_path_alias(&self, specifier: &str) -> bool {
        self.path_alias_prefixes
            .iter()
            .any(|prefix| specifier.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Extensions (without the dot) that count as source files.
    pub source_extensions: Vec<String>,
    /// Directory names never descended into.
    pub ignored_dirs: Vec<String>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            source_extensions: ["ts", "tsx", "js", "jsx", "mjs", "cjs"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ignored_dirs: ["node_modules", ".next", ".git", "dist", "build", "out", ".turbo"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Config {
    /// Get the config directory path
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("genforge"))
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from `path` (or the default location), then apply environment overrides.
    ///
    /// A missing file yields defaults. A corrupt file is moved aside and defaults are used.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).or_else(Self::config_path);
        let mut config = path
            .as_deref()
            .and_then(Self::read_file)
            .unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    fn read_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Config>(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupted; a backup was saved and defaults were loaded"
                );
                None
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(key) = ["GENFORGE_API_KEY", "NVIDIA_API_KEY", "OPENAI_API_KEY"]
            .iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
        {
            self.api.api_key = Some(key);
        }
        if let Ok(base_url) = std::env::var("GENFORGE_BASE_URL") {
            if !base_url.trim().is_empty() {
                self.api.base_url = base_url;
            }
        }
        if let Ok(model) = std::env::var("GENFORGE_MODEL") {
            if !model.trim().is_empty() {
                self.api.model = model;
            }
        }
    }

    /// Reject settings that would make every request or build fail.
    pub fn validate(&self) -> anyhow::Result<()> {
        let parsed = url::Url::parse(&self.api.base_url)
            .map_err(|e| anyhow::anyhow!("Invalid api.base_url '{}': {}", self.api.base_url, e))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            anyhow::bail!("api.base_url must be http(s), got '{}'", parsed.scheme());
        }
        if self.api.model.trim().is_empty() {
            anyhow::bail!("api.model must not be empty");
        }
        if self.generation.retries == 0 {
            anyhow::bail!("generation.retries must be at least 1");
        }
        if self.toolchain.build.program.trim().is_empty() {
            anyhow::bail!("toolchain.build.program must not be empty");
        }
        Ok(())
    }

    /// Save config atomically. The API key is never persisted.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        write_atomic(path, &content).with_context(|| format!("Failed to write {}", path.display()))
    }

    /// Get the config file location for display
    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/genforge/config.json".to_string())
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.generation.retries, 3);
        assert_eq!(config.api.request_timeout_secs, 900);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let json = r#"{"generation": {"max_tokens": 2048}, "toolchain": {"build_timeout_secs": 5}}"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.generation.max_tokens, 2048);
        assert_eq!(config.generation.retries, 3);
        assert_eq!(config.toolchain.build_timeout_secs, 5);
        assert_eq!(config.toolchain.build, CommandSpec::new("npm", &["run", "build"]));
        assert_eq!(config.packages.version_for("clsx"), "^2.1.0");
    }

    #[test]
    fn test_version_lookup_falls_back_to_latest() {
        let packages = PackageConfig::default();
        assert_eq!(packages.version_for("some-unknown-pkg"), "latest");
        assert!(packages.is_builtin("fs"));
        assert!(packages.is_builtin("node:fs"));
        assert!(!packages.is_builtin("clsx"));
        assert!(packages.is_path_alias("@/components/Button"));
        assert!(!packages.is_path_alias("@radix-ui/react-dialog"));
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let mut config = Config::default();
        config.api.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
        config.api.base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_corrupt_config_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::read_file(&path).is_none());
        assert!(dir.path().join("config.json.corrupt").exists());
    }

    #[test]
    fn test_save_never_writes_api_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.api.api_key = Some("sk-secret".to_string());
        config.save(&path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.contains("sk-secret"));
        let reloaded = Config::read_file(&path).unwrap();
        assert_eq!(reloaded.api.model, config.api.model);
    }
}
