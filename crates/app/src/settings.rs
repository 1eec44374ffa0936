use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use counsel_llm::{
    BACKEND_PROVIDER_ID, DEFAULT_OPENAI_MODEL, ProviderConfig, RIG_OPENAI_PROVIDER_ID,
};
use counsel_storage::{DEFAULT_API_BASE_URL, UserId};

pub const SETTINGS_DIRECTORY_NAME: &str = "counsel";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "COUNSEL_";
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_OPENAI_ENDPOINT: &str = "https://api.openai.com/v1";
pub const DEFAULT_PROFILE: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionBackend {
    /// The chat backend's `/api/chat`, which also runs enrichment.
    #[default]
    Backend,
    /// Direct streaming from an OpenAI-compatible endpoint.
    Openai,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default = "default_response_timeout_secs")]
    pub response_timeout_secs: u64,
    #[serde(default)]
    pub completion_backend: CompletionBackend,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_endpoint")]
    pub openai_endpoint: String,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    /// Origin used to build share links; falls back to `api_base_url`.
    #[serde(default)]
    pub share_base_url: String,
    #[serde(default = "default_profile")]
    pub profile: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            user_id: String::new(),
            response_timeout_secs: default_response_timeout_secs(),
            completion_backend: CompletionBackend::default(),
            openai_api_key: String::new(),
            openai_endpoint: default_openai_endpoint(),
            openai_model: default_openai_model(),
            share_base_url: String::new(),
            profile: default_profile(),
        }
    }
}

impl Settings {
    pub fn normalized(mut self) -> Self {
        self.api_base_url = non_blank_or(self.api_base_url, default_api_base_url);
        self.user_id = self.user_id.trim().to_string();
        if self.response_timeout_secs == 0 {
            self.response_timeout_secs = DEFAULT_RESPONSE_TIMEOUT_SECS;
        }
        self.openai_api_key = self.openai_api_key.trim().to_string();
        self.openai_endpoint = non_blank_or(self.openai_endpoint, default_openai_endpoint);
        self.openai_model = non_blank_or(self.openai_model, default_openai_model);
        self.share_base_url = self.share_base_url.trim().to_string();
        self.profile = non_blank_or(self.profile, default_profile);
        self
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn user_id(&self) -> Option<UserId> {
        UserId::parse(&self.user_id).ok()
    }

    pub fn share_base_url(&self) -> &str {
        if self.share_base_url.is_empty() {
            &self.api_base_url
        } else {
            &self.share_base_url
        }
    }

    pub fn provider_config(&self) -> ProviderConfig {
        let config = match self.completion_backend {
            CompletionBackend::Backend => {
                ProviderConfig::new(BACKEND_PROVIDER_ID, "", &self.api_base_url)
            }
            CompletionBackend::Openai => ProviderConfig::new(
                RIG_OPENAI_PROVIDER_ID,
                &self.openai_api_key,
                &self.openai_endpoint,
            )
            .with_model(&self.openai_model),
        };
        config.with_response_timeout(self.response_timeout())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

/// Layered settings: defaults, then the JSON file, then `COUNSEL_*`
/// environment variables.
pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".counsel"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path, Env::prefixed(ENV_PREFIX));
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> SettingsResult<()> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Returns the configured user id, minting and persisting one on first use.
    pub fn ensure_user_id(&self) -> SettingsResult<UserId> {
        let current = self.settings();
        if let Some(user_id) = current.user_id() {
            return Ok(user_id);
        }

        let user_id = UserId::new_v4();
        tracing::info!(user_id = %user_id, "generated a new user id");
        let mut settings = (*current).clone();
        settings.user_id = user_id.to_string();
        self.update(settings)?;
        Ok(user_id)
    }

    fn load_layers(path: &Path, env: Env) -> Settings {
        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(env);

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %error,
                    "failed to read settings; using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> SettingsResult<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = %self.config_path.display(), "saved settings");
        Ok(())
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    match value.trim() {
        "" => fallback(),
        trimmed => trimmed.to_string(),
    }
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_response_timeout_secs() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_SECS
}

fn default_openai_endpoint() -> String {
    DEFAULT_OPENAI_ENDPOINT.to_string()
}

fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.to_string()
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}
