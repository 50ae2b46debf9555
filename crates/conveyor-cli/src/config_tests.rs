//! Tests for the CLI config module.

#[cfg(test)]
mod tests {
    use crate::config::{CliConfig, DEFAULT_MAX_PARALLEL, OutputFormat};
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let config = CliConfig::default();
        assert_eq!(config.max_parallel, DEFAULT_MAX_PARALLEL);
        assert_eq!(config.output_format, OutputFormat::Table);
        assert!(!config.keep_workspaces);
        assert!(config.default_workflow.is_none());
    }

    #[test]
    fn test_directories_derive_from_cache_dir() {
        let mut config = CliConfig::default();
        config.set("cache_dir", "/var/cache/conveyor").unwrap();

        assert_eq!(config.blob_dir(), PathBuf::from("/var/cache/conveyor/blobs"));
        assert_eq!(
            config.workspace_root(),
            PathBuf::from("/var/cache/conveyor/workspaces")
        );
        assert_eq!(
            config.artifacts_root(),
            PathBuf::from("/var/cache/conveyor/artifacts")
        );

        config.set("workspace_dir", "/tmp/ws").unwrap();
        assert_eq!(config.workspace_root(), PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn test_set_validates_values() {
        let mut config = CliConfig::default();

        config.set("max_parallel", "8").unwrap();
        assert_eq!(config.max_parallel, 8);
        assert!(config.set("max_parallel", "0").is_err());
        assert!(config.set("max_parallel", "many").is_err());

        config.set("output_format", "json").unwrap();
        assert_eq!(config.output_format, OutputFormat::Json);
        assert!(config.set("output_format", "yaml").is_err());

        config.set("keep_workspaces", "true").unwrap();
        assert!(config.keep_workspaces);
        assert!(config.set("keep_workspaces", "yes").is_err());

        config.set("default_workflow", "videofront").unwrap();
        assert_eq!(config.default_workflow.as_deref(), Some("videofront"));
        config.set("default_workflow", "").unwrap();
        assert!(config.default_workflow.is_none());

        let err = config.set("api_url", "http://localhost").unwrap_err();
        assert!(err.to_string().contains("Unknown config key"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conveyor/config.yaml");

        let mut config = CliConfig::default();
        config.set("max_parallel", "2").unwrap();
        config.set("default_workflow", "videofront").unwrap();
        config.save_to(&path).unwrap();

        assert_eq!(CliConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CliConfig::load_from(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config, CliConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "output_format: json\n").unwrap();

        let config = CliConfig::load_from(&path).unwrap();
        assert_eq!(config.output_format, OutputFormat::Json);
        assert_eq!(config.max_parallel, DEFAULT_MAX_PARALLEL);
    }
}
