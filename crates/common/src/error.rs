//! Configuration and bootstrap errors

use thiserror::Error;

/// Errors raised while loading gateway configuration.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_the_offending_setting() {
        let err = Error::Config("retry.max_attempts must be greater than 0".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: retry.max_attempts must be greater than 0"
        );
    }

    #[test]
    fn io_error_converts_with_prefix() {
        let err: Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "api_keys_file missing").into();
        assert!(err.to_string().starts_with("I/O error:"), "got: {err}");
        assert!(err.to_string().contains("api_keys_file missing"));
    }

    #[test]
    fn toml_error_converts() {
        let parse = toml::from_str::<toml::Table>("[claude\nmodel = ").unwrap_err();
        let err: Error = parse.into();
        assert!(matches!(err, Error::Toml(_)));
        assert!(format!("{err:?}").contains("Toml"));
    }
}
