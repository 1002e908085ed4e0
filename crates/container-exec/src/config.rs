//! Launch configuration for a unit
//!
//! [`UnitConfig`] is handed to the backend verbatim by
//! [`Backend::create`](crate::Backend::create). It is `Serialize` and
//! `Deserialize` so unit templates can be kept in JSON or YAML files.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The configuration of a unit to be run
///
/// Some properties are handled specially by [`Cmd`](crate::Cmd):
/// * `auto_remove` defaults to true.
/// * `stdin_once` defaults to true. Unsetting it keeps the unit's stdin open
///   after the first attached client detaches.
/// * `open_stdin` is set automatically when stdin is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Image (or unit template) to run
    pub image: String,
    /// Entrypoint override; prepended to `cmd`
    pub entrypoint: Vec<String>,
    /// Program and arguments
    pub cmd: Vec<String>,
    /// Environment variables to set
    pub env: BTreeMap<String, String>,
    /// Working directory inside the unit
    pub working_dir: Option<String>,
    /// User to run as inside the unit
    pub user: Option<String>,
    /// Labels attached to the unit
    pub labels: BTreeMap<String, String>,
    /// Allocate a pseudo-terminal; stdout and stderr are then one stream
    pub tty: bool,
    /// Keep stdin open
    pub open_stdin: bool,
    /// Close stdin after the attached client disconnects
    pub stdin_once: bool,
    /// Remove the unit once it exits
    pub auto_remove: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            user: None,
            labels: BTreeMap::new(),
            tty: false,
            open_stdin: false,
            stdin_once: true,
            auto_remove: true,
        }
    }
}

impl UnitConfig {
    /// Configuration running `program` with `args` in `image`
    pub fn new<I, S>(image: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut cmd = vec![program.into()];
        cmd.extend(args.into_iter().map(Into::into));
        Self {
            image: image.into(),
            cmd,
            ..Self::default()
        }
    }

    /// Add an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.cmd.push(arg.into());
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env.insert(key.into(), val.into());
        self
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the user
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Set a label
    pub fn label(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.labels.insert(key.into(), val.into());
        self
    }

    /// Override the entrypoint
    pub fn entrypoint<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = words.into_iter().map(Into::into).collect();
        self
    }

    /// Request a pseudo-terminal
    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Set whether the unit is removed once it exits
    pub fn auto_remove(mut self, auto_remove: bool) -> Self {
        self.auto_remove = auto_remove;
        self
    }

    /// The full command line: entrypoint followed by cmd
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        self.entrypoint.iter().chain(&self.cmd).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = UnitConfig::new("alpine", "echo", ["hello"]);
        assert_eq!(config.image, "alpine");
        assert_eq!(config.cmd, vec!["echo", "hello"]);
        assert!(config.auto_remove);
        assert!(config.stdin_once);
        assert!(!config.open_stdin);
        assert!(!config.tty);
    }

    #[test]
    fn test_config_builder() {
        let config = UnitConfig::new("alpine", "sh", ["-c"])
            .arg("echo $TEST_VAR")
            .env("TEST_VAR", "test_value")
            .working_dir("/tmp")
            .entrypoint(["/bin/env"])
            .label("owner", "tests");

        assert_eq!(
            config.argv().collect::<Vec<_>>(),
            vec!["/bin/env", "sh", "-c", "echo $TEST_VAR"]
        );
        assert_eq!(config.env.get("TEST_VAR").map(String::as_str), Some("test_value"));
        assert_eq!(config.working_dir.as_deref(), Some("/tmp"));
        assert_eq!(config.labels.get("owner").map(String::as_str), Some("tests"));
    }

    #[test]
    fn test_config_from_json_keeps_defaults() {
        let config: UnitConfig =
            serde_json::from_str(r#"{"image": "ubuntu:focal", "cmd": ["cat"], "tty": true}"#).unwrap();

        assert_eq!(config.image, "ubuntu:focal");
        assert_eq!(config.cmd, vec!["cat"]);
        assert!(config.tty);
        assert!(config.auto_remove);
        assert!(config.stdin_once);
    }
}
