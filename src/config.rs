use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Autoscription";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default `tracing` filter when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "autoscription_lib=info"
}

/// Get the application data directory
/// ~/Autoscription/ on all platforms. Falls back to the working directory
/// when no home directory can be resolved (service accounts, CI).
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the default configuration file (`config.json` under the data dir)
pub fn config_file_path() -> PathBuf {
    app_data_dir().join("config.json")
}

/// Get the directory scanned pages are copied into before verification
pub fn scans_dir() -> PathBuf {
    app_data_dir().join("scans")
}

/// Get the directory holding one registry JSON document per prescription
pub fn metadata_dir() -> PathBuf {
    app_data_dir().join("metadata")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_ends_with_app_name() {
        let dir = app_data_dir();
        assert!(dir.ends_with("Autoscription"));
        if let Some(home) = dirs::home_dir() {
            assert!(dir.starts_with(home));
        }
    }

    #[test]
    fn config_file_under_app_data() {
        let path = config_file_path();
        assert!(path.starts_with(app_data_dir()));
        assert!(path.ends_with("config.json"));
    }

    #[test]
    fn scans_dir_under_app_data() {
        assert!(scans_dir().starts_with(app_data_dir()));
        assert!(scans_dir().ends_with("scans"));
    }

    #[test]
    fn metadata_dir_under_app_data() {
        assert!(metadata_dir().starts_with(app_data_dir()));
        assert_ne!(metadata_dir(), scans_dir());
    }

    #[test]
    fn app_name_is_autoscription() {
        assert_eq!(APP_NAME, "Autoscription");
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.6.0");
    }

    #[test]
    fn log_filter_targets_crate() {
        assert!(default_log_filter().starts_with("autoscription_lib"));
    }
}
