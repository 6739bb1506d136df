use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::ConfigError;

/// Candidate credentials tried, in order, when opening an inspection shell.
///
/// Loaded from a small YAML file:
/// ```yaml
/// users: [root]
/// passwords: [redhat, ""]
/// key_files:
///   - /etc/hostpool/id_rsa
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SshCredentials {
    #[serde(default = "default_users")]
    pub users: Vec<String>,
    #[serde(default)]
    pub passwords: Vec<String>,
    #[serde(default)]
    pub key_files: Vec<PathBuf>,
}

fn default_users() -> Vec<String> {
    vec!["root".to_string()]
}

impl Default for SshCredentials {
    fn default() -> Self {
        SshCredentials {
            users: default_users(),
            passwords: Vec::new(),
            key_files: Vec::new(),
        }
    }
}

impl SshCredentials {
    pub fn load(path: &Path) -> Result<SshCredentials, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let creds: SshCredentials =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParse {
                path: path.display().to_string(),
                source: e,
            })?;
        debug!(
            users = creds.users.len(),
            passwords = creds.passwords.len(),
            key_files = creds.key_files.len(),
            "loaded ssh credential candidates"
        );
        Ok(creds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_yaml_and_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "passwords: [redhat]").unwrap();
        let creds = SshCredentials::load(file.path()).unwrap();
        assert_eq!(creds.users, vec!["root".to_string()]);
        assert_eq!(creds.passwords, vec!["redhat".to_string()]);
        assert!(creds.key_files.is_empty());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SshCredentials::load(Path::new("/no/such/creds.yml")).unwrap_err();
        assert!(err.to_string().contains("/no/such/creds.yml"));
    }
}
