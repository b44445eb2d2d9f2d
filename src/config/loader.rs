use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

use super::schema::Config;
use crate::error::{ConfigError, Result};

const ENV_PREFIX: &str = "PIPELINES_";
const FILE_STEM: &str = "pipeline-gateway";

pub async fn load_from_env_or_file() -> Result<Config> {
    let mut figment = Figment::new();
    if let Some(dir) = dirs::config_dir() {
        figment = figment.merge(Toml::file(dir.join(FILE_STEM).join("config.toml")));
    }
    let config: Config = figment
        .merge(Toml::file(format!("{FILE_STEM}.toml")))
        .merge(Json::file(format!("{FILE_STEM}.json")))
        .merge(Yaml::file(format!("{FILE_STEM}.yaml")))
        .merge(Yaml::file(format!("{FILE_STEM}.yml")))
        // PIPELINES_PLUGINS__CALL_TIMEOUT_MS=1000 → plugins.call_timeout_ms
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let plugins = &config.plugins;

    if plugins.worker_pool_size == 0 {
        return Err(ConfigError::Validation("Worker pool size must be greater than 0".into()).into());
    }
    if plugins.pool_size_per_plugin == 0 {
        return Err(ConfigError::Validation(
            "Process pool size per plugin must be greater than 0".into(),
        )
        .into());
    }
    if plugins.stream_buffer == 0 {
        return Err(ConfigError::Validation("Stream buffer must be greater than 0".into()).into());
    }
    // a day is the longest deadline that still means something
    if plugins.call_timeout_ms > 86_400_000 {
        return Err(ConfigError::Validation(
            "Call timeout must not exceed 86400000ms".into(),
        )
        .into());
    }

    if plugins.failed_dir.is_empty()
        || plugins.failed_dir.contains('/')
        || plugins.failed_dir.contains('\\')
    {
        return Err(ConfigError::Validation(format!(
            "Quarantine folder '{}' must be a plain folder name",
            plugins.failed_dir
        ))
        .into());
    }

    for (extension, interpreter) in &plugins.interpreters {
        if extension.is_empty() || extension.starts_with('.') {
            return Err(ConfigError::Validation(format!(
                "Interpreter extension '{extension}' must be given without a leading dot"
            ))
            .into());
        }
        if extension == "toml" {
            return Err(ConfigError::Validation(
                "The 'toml' extension is reserved for native plugin manifests".into(),
            )
            .into());
        }
        if interpreter.as_os_str().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Interpreter for '.{extension}' files is empty"
            ))
            .into());
        }
    }

    if let Some(command) = &plugins.requirements_command {
        if command.is_empty() {
            return Err(ConfigError::Validation(
                "Requirements command must not be empty".into(),
            )
            .into());
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    if let Some(api_key) = &mut config.auth.api_key {
        *api_key = substitute_env_vars(api_key)?;
    }

    if let Some(command) = &mut config.plugins.requirements_command {
        for arg in command.iter_mut() {
            *arg = substitute_env_vars(arg)?;
        }
    }

    Ok(config)
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("valid regex"))
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in env_pattern().captures_iter(input) {
        let expression = &cap[1];
        let value = match expression.split_once(":-") {
            Some((name, default)) => {
                std::env::var(name).unwrap_or_else(|_| default.to_string())
            }
            None => std::env::var(expression).map_err(|_| {
                ConfigError::EnvVar(format!("Environment variable '{expression}' not found"))
            })?,
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("PIPELINE_GATEWAY_TEST_VAR", "test_value");

        let result = substitute_env_vars("Hello ${PIPELINE_GATEWAY_TEST_VAR}!").unwrap();
        assert_eq!(result, "Hello test_value!");

        let result = substitute_env_vars("${PIPELINE_GATEWAY_MISSING:-default}").unwrap();
        assert_eq!(result, "default");

        assert!(substitute_env_vars("${PIPELINE_GATEWAY_MISSING}").is_err());

        std::env::remove_var("PIPELINE_GATEWAY_TEST_VAR");
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let mut config = Config::default();
        config.plugins.worker_pool_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_reserved_extension() {
        let mut config = Config::default();
        config
            .plugins
            .interpreters
            .insert("toml".into(), "python3".into());
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.server.port, 9099);
        assert_eq!(config.plugins.failed_dir, "failed");
        assert_eq!(
            config.plugins.interpreters.get("py").map(|p| p.as_path()),
            Some(Path::new("python3"))
        );
    }

    #[tokio::test]
    async fn test_load_from_toml_path() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 8080

[plugins]
dir = "/tmp/pipelines"
call_timeout_ms = 0

[auth]
api_key = "${{PIPELINE_GATEWAY_LOADER_KEY:-secret}}"
"#
        )
        .unwrap();

        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.plugins.call_timeout(), None);
        assert_eq!(config.auth.api_key.as_deref(), Some("secret"));
        assert_eq!(config.plugins.pool_size_per_plugin, 2);
    }

    #[tokio::test]
    async fn test_unsupported_extension() {
        let file = Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(load_from_path(file.path()).await.is_err());
    }
}
