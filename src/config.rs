use crate::error::ChatError;
use crate::models::{gemini_models, openai_models, Model};
use keyring::Entry;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Parley, a helpful and highly intelligent assistant. \
You provide concise, accurate, and professional answers. If you don't know something, state it clearly.";

const KEYRING_SERVICE: &str = "parley_api_key";

// Which backend protocol the chat client speaks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    OpenAICompatible,
}

impl ProviderKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenAICompatible => "openai_compatible",
        }
    }

    fn default_api_url(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::OpenAICompatible => "https://api.openai.com/v1",
        }
    }

    fn default_api_key_ref(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "env:GEMINI_API_KEY",
            ProviderKind::OpenAICompatible => "env:OPENAI_API_KEY",
        }
    }

    fn catalog(&self) -> Vec<Model> {
        match self {
            ProviderKind::Gemini => gemini_models(),
            ProviderKind::OpenAICompatible => openai_models(),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(ProviderKind::Gemini),
            "openai" | "openai_compatible" => Ok(ProviderKind::OpenAICompatible),
            other => Err(ChatError::Configuration(format!(
                "Unsupported provider '{}'. Expected 'gemini' or 'openai_compatible'",
                other
            ))),
        }
    }
}

// Sampling parameters sent with every generation request
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.95,
            top_k: 64,
        }
    }
}

/// Process-wide settings, read once at startup.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub provider: ProviderKind,
    pub api_url: String,
    /// Where to find the API key: `env:NAME` or `keyring`.
    pub api_key_ref: String,
    pub models: Vec<Model>,
    pub default_model_id: String,
    pub title_model_id: String,
    pub system_prompt: String,
    pub database_path: PathBuf,
    pub generation: GenerationOptions,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ChatError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ChatError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let provider = match var("PARLEY_PROVIDER") {
            Some(value) => value.parse()?,
            None => ProviderKind::Gemini,
        };

        let mut models = provider.catalog();
        let default_model_id = var("PARLEY_MODEL").unwrap_or_else(|| models[0].id.clone());
        if !models.iter().any(|m| m.id == default_model_id) {
            log::info!("Model '{}' is not in the built-in catalog, adding it", default_model_id);
            models.push(Model::custom(&default_model_id));
        }
        let title_model_id = var("PARLEY_TITLE_MODEL").unwrap_or_else(|| models[0].id.clone());

        let database_path = match var("PARLEY_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .map(|dir| dir.join("parley").join("parley.sqlite"))
                .ok_or_else(|| {
                    ChatError::Configuration(
                        "Could not determine a data directory; set PARLEY_DB_PATH".to_string(),
                    )
                })?,
        };

        let defaults = GenerationOptions::default();
        let generation = GenerationOptions {
            temperature: parse_var(&var, "PARLEY_TEMPERATURE", defaults.temperature)?,
            top_p: parse_var(&var, "PARLEY_TOP_P", defaults.top_p)?,
            top_k: parse_var(&var, "PARLEY_TOP_K", defaults.top_k)?,
        };

        Ok(Self {
            provider,
            api_url: var("PARLEY_API_URL").unwrap_or_else(|| provider.default_api_url().to_string()),
            api_key_ref: var("PARLEY_API_KEY_REF")
                .unwrap_or_else(|| provider.default_api_key_ref().to_string()),
            models,
            default_model_id,
            title_model_id,
            system_prompt: var("PARLEY_SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            database_path,
            generation,
        })
    }

    pub fn model(&self, model_id: &str) -> Option<&Model> {
        self.models.iter().find(|m| m.id == model_id)
    }
}

fn parse_var<T, F>(var: &F, key: &str, default: T) -> Result<T, ChatError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            ChatError::Configuration(format!("Invalid value '{}' for {}", raw, key))
        }),
        None => Ok(default),
    }
}

// --- API Key Retrieval ---

/// Retrieves the API key for the configured provider.
/// `api_key_ref` decides whether it is read from an environment variable or the OS keyring.
pub fn get_api_key(config: &AppConfig) -> Result<String, ChatError> {
    resolve_api_key(&config.api_key_ref, config.provider, |name| std::env::var(name).ok())
}

fn resolve_api_key<F>(key_ref: &str, provider: ProviderKind, env: F) -> Result<String, ChatError>
where
    F: Fn(&str) -> Option<String>,
{
    let key = if let Some(env_var_name) = key_ref.strip_prefix("env:") {
        log::debug!("Retrieving API key from environment variable: {}", env_var_name);
        env(env_var_name).ok_or_else(|| {
            ChatError::Configuration(format!(
                "API key is not configured: environment variable '{}' is not set",
                env_var_name
            ))
        })?
    } else if key_ref == "keyring" {
        log::debug!("Retrieving API key from keyring for service: {}", KEYRING_SERVICE);
        Entry::new(KEYRING_SERVICE, provider.name())
            .and_then(|entry| entry.get_password())
            .map_err(|e| {
                ChatError::Configuration(format!(
                    "Failed to get API key from keyring for '{}': {}",
                    provider.name(),
                    e
                ))
            })?
    } else {
        return Err(ChatError::Configuration(format!(
            "Unsupported api_key_ref format: {}",
            key_ref
        )));
    };

    if key.trim().is_empty() {
        return Err(ChatError::Configuration("API key is empty".to_string()));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_to_gemini_catalog() {
        let config = AppConfig::from_lookup(lookup(&[("PARLEY_DB_PATH", "/tmp/parley.sqlite")])).unwrap();
        assert_eq!(config.provider, ProviderKind::Gemini);
        assert_eq!(config.default_model_id, "gemini-3-flash-preview");
        assert_eq!(config.title_model_id, "gemini-3-flash-preview");
        assert_eq!(config.api_key_ref, "env:GEMINI_API_KEY");
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.generation, GenerationOptions::default());
    }

    #[test]
    fn unknown_model_is_added_as_custom_entry() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PARLEY_PROVIDER", "openai_compatible"),
            ("PARLEY_MODEL", "llama3:8b"),
            ("PARLEY_DB_PATH", "/tmp/parley.sqlite"),
        ]))
        .unwrap();
        assert_eq!(config.provider, ProviderKind::OpenAICompatible);
        assert_eq!(config.model("llama3:8b").unwrap().provider, "Custom");
        assert_eq!(config.title_model_id, "gpt-4o-mini");
    }

    #[test]
    fn rejects_malformed_options() {
        let err = AppConfig::from_lookup(lookup(&[
            ("PARLEY_TOP_K", "many"),
            ("PARLEY_DB_PATH", "/tmp/parley.sqlite"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ChatError::Configuration(_)));

        let err = AppConfig::from_lookup(lookup(&[("PARLEY_PROVIDER", "carrier-pigeon")])).unwrap_err();
        assert!(matches!(err, ChatError::Configuration(_)));
    }

    #[test]
    fn resolves_env_key_refs() {
        let env = lookup(&[("MY_KEY", "secret")]);
        assert_eq!(resolve_api_key("env:MY_KEY", ProviderKind::Gemini, &env).unwrap(), "secret");

        let missing = resolve_api_key("env:OTHER_KEY", ProviderKind::Gemini, &env).unwrap_err();
        assert!(missing.to_string().contains("OTHER_KEY"));

        let unsupported = resolve_api_key("vault:x", ProviderKind::Gemini, &env).unwrap_err();
        assert!(matches!(unsupported, ChatError::Configuration(_)));
    }
}
