//! Builds the OS command for a daemon.

use std::process::{Command, Stdio};

use corral_wire::env as wire_env;

use crate::spec::DaemonSpec;

/// Variables the host controls. Inherited copies are removed so a daemon only
/// sees the channels its spec declares.
const WIRING_KEYS: [&str; 5] = [
    wire_env::DAEMON_ID,
    wire_env::EVENT_ENDPOINT,
    wire_env::LOG_ENDPOINT,
    wire_env::LOG_LEVEL,
    wire_env::LOG_PREFIX,
];

/// Assembles the command: program, arguments, environment overlay, injected
/// wiring, working directory, and piped output. Daemons lead their own
/// process group on Unix so termination reaches their children too.
pub(super) fn build(spec: &DaemonSpec, injected: &[(&'static str, String)]) -> Command {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    for key in WIRING_KEYS.iter().copied().chain(spec.env_remove.iter().map(String::as_str)) {
        command.env_remove(key);
    }
    command.envs(&spec.env);
    for (key, value) in injected {
        command.env(key, value);
    }
    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn env_of<'a>(command: &'a Command, key: &str) -> Option<Option<&'a OsStr>> {
        command
            .get_envs()
            .find(|(name, _)| *name == OsStr::new(key))
            .map(|(_, value)| value)
    }

    #[test]
    fn overlay_and_wiring_are_applied() {
        let spec = DaemonSpec::builder("master-1", "/usr/bin/salt-master")
            .args(["-l", "debug"])
            .env("SALT_CONFIG", "/tmp/conf")
            .env_remove("HOME")
            .build()
            .expect("valid spec");
        let command = build(&spec, &[(wire_env::DAEMON_ID, "master-1".to_owned())]);

        let args: Vec<&OsStr> = command.get_args().collect();
        assert_eq!(args, vec![OsStr::new("-l"), OsStr::new("debug")]);
        assert_eq!(env_of(&command, "SALT_CONFIG"), Some(Some(OsStr::new("/tmp/conf"))));
        assert_eq!(env_of(&command, "HOME"), Some(None));
        assert_eq!(
            env_of(&command, wire_env::DAEMON_ID),
            Some(Some(OsStr::new("master-1")))
        );
    }

    #[test]
    fn undeclared_channels_are_scrubbed() {
        let spec = DaemonSpec::builder("minion-1", "/bin/true")
            .build()
            .expect("valid spec");
        let command = build(&spec, &[]);
        assert_eq!(env_of(&command, wire_env::EVENT_ENDPOINT), Some(None));
        assert_eq!(env_of(&command, wire_env::LOG_ENDPOINT), Some(None));
    }

    #[test]
    fn working_directory_is_set() {
        let dir = tempfile::tempdir().expect("temp dir");
        let spec = DaemonSpec::builder("d1", "/bin/true")
            .cwd(dir.path())
            .build()
            .expect("valid spec");
        let command = build(&spec, &[]);
        assert_eq!(command.get_current_dir(), Some(dir.path()));
    }
}
