use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "the required environment variable \"{0}\" is currently not set; \
         set it with `export {0}=<value>` or provide an env file before starting"
    )]
    MissingEnv(String),

    #[error("environment variable \"{name}\" has an invalid value: {message}")]
    BadEnv { name: String, message: String },

    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("yaml parse error in {path}: {source}")]
    YamlParse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}
