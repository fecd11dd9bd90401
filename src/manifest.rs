use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{Manifest, RestartPolicy, TaskSpec};

/// Raw on-disk shape of a `prun.toml` manifest, before validation.
#[derive(Debug, Deserialize)]
struct RawManifest {
    tasks: Vec<String>,
    #[serde(rename = "task", default)]
    task: HashMap<String, RawTask>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    cmd: String,
    #[serde(default)]
    path: Option<PathBuf>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default = "default_true")]
    shell: bool,
    #[serde(default)]
    watch: bool,
    #[serde(default)]
    restart: Option<RawRestart>,
}

fn default_true() -> bool {
    true
}

/// The `restart` field accepts either a bool or the string `"on-failure"`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawRestart {
    Bool(bool),
    Policy(String),
}

impl RawRestart {
    fn into_policy(self) -> Result<RestartPolicy> {
        match self {
            RawRestart::Bool(true) => Ok(RestartPolicy::Always),
            RawRestart::Bool(false) => Ok(RestartPolicy::Never),
            RawRestart::Policy(s) if s == "on-failure" => Ok(RestartPolicy::OnFailure),
            RawRestart::Policy(other) => Err(Error::ManifestValidation(format!(
                "invalid `restart` value `{other}` (expected true, false, or \"on-failure\")"
            ))),
        }
    }
}

/// Loads and validates a manifest from `path`.
///
/// Missing file and parse failure are distinguished so the CLI can select
/// the matching exit code (2 vs. 3, per the external interfaces contract).
pub fn load(path: &Path) -> Result<Manifest> {
    if !path.exists() {
        return Err(Error::ManifestNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)?;
    let raw: RawManifest = toml::from_str(&content).map_err(|source| Error::ManifestParse {
        path: path.to_path_buf(),
        source,
    })?;

    let mut tasks = HashMap::with_capacity(raw.task.len());
    for (name, raw_task) in raw.task {
        let restart = match raw_task.restart {
            Some(r) => r.into_policy()?,
            None => RestartPolicy::Never,
        };
        let spec = TaskSpec {
            name: name.clone(),
            command: raw_task.cmd,
            working_directory: raw_task.path,
            environment: raw_task.env,
            use_shell: raw_task.shell,
            watch_enabled: raw_task.watch,
            restart,
        };
        tasks.insert(name, spec);
    }

    let manifest = Manifest { order: raw.tasks, tasks };
    manifest.validate()?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("prun.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn loads_well_formed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
                tasks = ["hello", "world"]

                [task.hello]
                cmd = "echo hello"

                [task.world]
                cmd = "echo world"
                watch = true
            "#,
        );
        let manifest = load(&path).unwrap();
        assert_eq!(manifest.order, vec!["hello", "world"]);
        assert!(manifest.tasks["world"].watch_enabled);
        assert!(!manifest.tasks["hello"].watch_enabled);
    }

    #[test]
    fn missing_file_is_manifest_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, Error::ManifestNotFound(_)));
        assert_eq!(err.exit_code(), std::process::ExitCode::from(2));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(dir.path(), "this is not valid toml [[[");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, Error::ManifestParse { .. }));
        assert_eq!(err.exit_code(), std::process::ExitCode::from(3));
    }

    #[test]
    fn unknown_task_in_order_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
                tasks = ["ghost"]
            "#,
        );
        let err = load(&path).unwrap_err();
        assert_eq!(err.exit_code(), std::process::ExitCode::from(3));
    }

    #[test]
    fn restart_field_accepts_bool_and_policy_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
                tasks = ["a", "b"]

                [task.a]
                cmd = "true"
                restart = true

                [task.b]
                cmd = "true"
                restart = "on-failure"
            "#,
        );
        let manifest = load(&path).unwrap();
        assert_eq!(manifest.tasks["a"].restart, RestartPolicy::Always);
        assert_eq!(manifest.tasks["b"].restart, RestartPolicy::OnFailure);
    }

    #[test]
    fn restart_field_rejects_unknown_string() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
                tasks = ["a"]

                [task.a]
                cmd = "true"
                restart = "always-and-forever"
            "#,
        );
        assert!(load(&path).is_err());
    }

    #[test]
    fn env_and_path_are_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_manifest(
            dir.path(),
            r#"
                tasks = ["a"]

                [task.a]
                cmd = "true"
                path = "./subdir"
                env = { FOO = "bar" }
            "#,
        );
        let manifest = load(&path).unwrap();
        let spec = &manifest.tasks["a"];
        assert_eq!(spec.working_directory, Some(PathBuf::from("./subdir")));
        assert_eq!(spec.environment.get("FOO"), Some(&"bar".to_string()));
    }
}
