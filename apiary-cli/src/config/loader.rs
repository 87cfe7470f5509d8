use super::types::{
    ApiaryConfig, RawApiaryConfig, RawIdentitySection, RawServerSection, RawSessionSection,
};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load merged configuration (user, project, then environment)
    pub fn load() -> Result<ApiaryConfig> {
        let user = Self::user_config_path();
        Self::load_layers(
            user.as_deref(),
            &Self::project_config_path(),
            |key| std::env::var(key).ok(),
        )
    }

    /// Load from explicit layer paths with a pluggable environment lookup
    fn load_layers(
        user_path: Option<&Path>,
        project_path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ApiaryConfig> {
        let mut raw = RawApiaryConfig::default();

        // Layer 1: User config
        if let Some(user_path) = user_path
            && user_path.exists()
        {
            raw = Self::merge_raw(raw, Self::read_raw(user_path)?);
        }

        // Layer 2: Project config
        if project_path.exists() {
            raw = Self::merge_raw(raw, Self::read_raw(project_path)?);
        }

        // Layer 3: Environment
        let raw = Self::apply_env(raw, env)?;

        Ok(ApiaryConfig::from_raw(raw))
    }

    /// Get user config path (platform-specific)
    pub fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "apiary").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Get project config path
    /// Can be overridden with APIARY_PROJECT_CONFIG_DIR
    pub fn project_config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("APIARY_PROJECT_CONFIG_DIR") {
            PathBuf::from(dir).join("config.toml")
        } else {
            PathBuf::from(".apiary/config.toml")
        }
    }

    fn read_raw(path: &Path) -> Result<RawApiaryConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
    }

    /// Merge two raw configs (overlay values override base only if explicitly set)
    fn merge_raw(base: RawApiaryConfig, overlay: RawApiaryConfig) -> RawApiaryConfig {
        RawApiaryConfig {
            server: RawServerSection {
                host: overlay.server.host.or(base.server.host),
                port: overlay.server.port.or(base.server.port),
            },
            identity: RawIdentitySection {
                secret: overlay.identity.secret.or(base.identity.secret),
                token_lifetime_secs: overlay
                    .identity
                    .token_lifetime_secs
                    .or(base.identity.token_lifetime_secs),
            },
            session: RawSessionSection {
                max_session_age_secs: overlay
                    .session
                    .max_session_age_secs
                    .or(base.session.max_session_age_secs),
                reap_interval_secs: overlay
                    .session
                    .reap_interval_secs
                    .or(base.session.reap_interval_secs),
                transaction_timeout_secs: overlay
                    .session
                    .transaction_timeout_secs
                    .or(base.session.transaction_timeout_secs),
            },
        }
    }

    fn apply_env(
        mut raw: RawApiaryConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<RawApiaryConfig> {
        if let Some(secret) = env("APIARY_SECRET") {
            raw.identity.secret = Some(secret);
        }
        if let Some(value) = env("APIARY_TOKEN_LIFETIME_SECS") {
            raw.identity.token_lifetime_secs = Some(parse_secs("APIARY_TOKEN_LIFETIME_SECS", &value)?);
        }
        if let Some(value) = env("APIARY_SESSION_MAX_AGE_SECS") {
            raw.session.max_session_age_secs = Some(parse_secs("APIARY_SESSION_MAX_AGE_SECS", &value)?);
        }
        if let Some(value) = env("APIARY_TRANSACTION_TIMEOUT_SECS") {
            raw.session.transaction_timeout_secs =
                Some(parse_secs("APIARY_TRANSACTION_TIMEOUT_SECS", &value)?);
        }
        if let Some(addr) = env("APIARY_ADDR") {
            let (host, port) = split_addr(&addr)?;
            raw.server.host = Some(host);
            raw.server.port = Some(port);
        }
        Ok(raw)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds, got {:?}", key, value))
}

/// `host:port`, with `[v6]:port` for IPv6 hosts
fn split_addr(addr: &str) -> Result<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .with_context(|| format!("APIARY_ADDR must be host:port, got {:?}", addr))?;
    let port = port
        .parse()
        .with_context(|| format!("APIARY_ADDR has an invalid port: {:?}", port))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    anyhow::ensure!(!host.is_empty(), "APIARY_ADDR has an empty host");
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ==================== Layering Tests ====================

    #[test]
    fn test_missing_files_give_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigLoader::load_layers(
            Some(&temp_dir.path().join("user.toml")),
            &temp_dir.path().join("project.toml"),
            no_env,
        )
        .unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_project_overrides_user() {
        let temp_dir = TempDir::new().unwrap();
        let user = temp_dir.path().join("user.toml");
        let project = temp_dir.path().join("project.toml");
        std::fs::write(
            &user,
            "[server]\nhost = \"0.0.0.0\"\nport = 4000\n\n[identity]\nsecret = \"user-secret\"\n",
        )
        .unwrap();
        std::fs::write(&project, "[server]\nport = 5000\n").unwrap();

        let config = ConfigLoader::load_layers(Some(&user), &project, no_env).unwrap();

        assert_eq!(config.server.port, 5000);
        // Unset in the project layer, so the user value survives
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.identity.secret, "user-secret");
    }

    #[test]
    fn test_env_overrides_files() {
        let temp_dir = TempDir::new().unwrap();
        let project = temp_dir.path().join("project.toml");
        std::fs::write(
            &project,
            "[server]\nport = 5000\n\n[session]\ntransaction_timeout_secs = 120\n",
        )
        .unwrap();

        let env = env_from(&[
            ("APIARY_ADDR", "0.0.0.0:8088"),
            ("APIARY_SECRET", "from-env"),
            ("APIARY_TOKEN_LIFETIME_SECS", "60"),
            ("APIARY_SESSION_MAX_AGE_SECS", "3600"),
            ("APIARY_TRANSACTION_TIMEOUT_SECS", "15"),
        ]);
        let config = ConfigLoader::load_layers(None, &project, env).unwrap();

        assert_eq!(config.server.addr(), "0.0.0.0:8088");
        assert_eq!(config.server.identity.secret, "from-env");
        assert_eq!(config.server.identity.token_lifetime_secs, 60);
        assert_eq!(config.server.session.max_session_age_secs, 3600);
        assert_eq!(config.server.session.transaction_timeout_secs, 15);
    }

    #[test]
    fn test_invalid_env_number_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let env = env_from(&[("APIARY_TRANSACTION_TIMEOUT_SECS", "soon")]);
        let err = ConfigLoader::load_layers(None, &temp_dir.path().join("none.toml"), env)
            .unwrap_err();
        assert!(err.to_string().contains("APIARY_TRANSACTION_TIMEOUT_SECS"));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let temp_dir = TempDir::new().unwrap();
        let project = temp_dir.path().join("project.toml");
        std::fs::write(&project, "this is not valid toml {{").unwrap();

        assert!(ConfigLoader::load_layers(None, &project, no_env).is_err());
    }

    // ==================== Address Tests ====================

    #[test]
    fn test_split_addr() {
        assert_eq!(split_addr("127.0.0.1:3000").unwrap(), ("127.0.0.1".to_string(), 3000));
        assert_eq!(split_addr("[::1]:9000").unwrap(), ("::1".to_string(), 9000));
        assert!(split_addr("localhost").is_err());
        assert!(split_addr("localhost:http").is_err());
        assert!(split_addr(":3000").is_err());
    }

    #[test]
    fn test_user_config_path_returns_some() {
        let path = ConfigLoader::user_config_path().unwrap();
        assert!(path.to_string_lossy().contains("apiary"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }
}
