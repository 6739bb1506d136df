use std::path::PathBuf;

use crate::error::ConfigError;

const ENV_PREFIX: &str = "APP_";

/// Broker process settings, populated from `APP_*` environment variables.
///
/// Anything secret stays in the environment; only paths and endpoints have
/// compiled-in defaults. A required variable that is missing aborts startup
/// with a diagnostic naming the variable.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Listen address.
    pub bind: String,
    pub port: u16,
    /// redb database file. `None` selects the in-memory store.
    pub store_path: Option<PathBuf>,
    /// Secret used to sign session cookies. Required.
    pub session_secret: String,
    /// Base URL of the lab back-end service; enables the lab provisioner.
    pub lab_url: Option<String>,
    /// CLI binary used to talk to the lab service.
    pub lab_command: String,
    /// YAML file holding the SSH credential candidates for inspection.
    pub ssh_credentials: Option<PathBuf>,
    /// House-keeper sweep interval in seconds.
    pub sweep_interval: u64,
}

impl Settings {
    pub fn from_env() -> Result<Settings, ConfigError> {
        Ok(Settings {
            bind: optional("BIND")?.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parsed("PORT")?.unwrap_or(8080),
            store_path: optional("STORE_PATH")?.map(PathBuf::from),
            session_secret: required("SESSION_SECRET")?,
            lab_url: optional("LAB_URL")?.map(|u| u.trim_end_matches('/').to_string()),
            lab_command: optional("LAB_COMMAND")?.unwrap_or_else(|| "labctl".to_string()),
            ssh_credentials: optional("SSH_CREDENTIALS")?.map(PathBuf::from),
            sweep_interval: parsed("SWEEP_INTERVAL")?.unwrap_or(60),
        })
    }
}

fn var_name(name: &str) -> String {
    format!("{}{}", ENV_PREFIX, name)
}

fn optional(name: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(var_name(name)) {
        Ok(v) if v.is_empty() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(_) => Ok(None),
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    optional(name)?.ok_or_else(|| ConfigError::MissingEnv(var_name(name)))
}

fn parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    optional(name)?
        .map(|v| {
            v.parse::<T>().map_err(|e| ConfigError::BadEnv {
                name: var_name(name),
                message: e.to_string(),
            })
        })
        .transpose()
}

/// Booleans accept `1`/`TRUE` (case-insensitive) as true, everything else
/// as false.
pub fn env_bool(name: &str) -> Result<Option<bool>, ConfigError> {
    Ok(optional(name)?.map(|v| {
        let v = v.to_ascii_uppercase();
        v == "1" || v == "TRUE"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_names_the_variable() {
        std::env::remove_var("APP_SESSION_SECRET");
        let err = Settings::from_env().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("APP_SESSION_SECRET"), "got: {}", msg);
        assert!(msg.contains("export APP_SESSION_SECRET"), "got: {}", msg);
    }

    #[test]
    fn bool_spellings() {
        std::env::set_var("APP_TEST_FLAG", "TRUE");
        assert_eq!(env_bool("TEST_FLAG").unwrap(), Some(true));
        std::env::set_var("APP_TEST_FLAG", "1");
        assert_eq!(env_bool("TEST_FLAG").unwrap(), Some(true));
        std::env::set_var("APP_TEST_FLAG", "no");
        assert_eq!(env_bool("TEST_FLAG").unwrap(), Some(false));
        std::env::remove_var("APP_TEST_FLAG");
    }
}
