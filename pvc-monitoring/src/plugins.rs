//! Health-check plugin execution.
//!
//! Plugins are standalone executables in the configured plugin directory.
//! The contract: `<plugin> setup` prepares it (non-zero exit drops the
//! plugin), `<plugin> run <coordinator-state>` prints a JSON
//! [`PluginResult`] on stdout, `<plugin> cleanup` runs at shutdown.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};
use threadpool::ThreadPool;
use tracing::{info, warn};

use pvc_common::command::run_command;

/// Hard cap on a single plugin run.
const PLUGIN_TIMEOUT: Duration = Duration::from_secs(60);

/// What one plugin run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResult {
    pub plugin_name: String,
    #[serde(default)]
    pub last_run: u64,
    pub health_delta: u64,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub runtime: String,
}

#[derive(Debug, Clone)]
struct Plugin {
    name: String,
    path: PathBuf,
}

/// The set of loaded plugins.
pub struct PluginHost {
    plugins: Vec<Plugin>,
}

impl PluginHost {
    /// Discover executable plugins in `directory` (sorted by name).
    ///
    /// A missing directory yields an empty host; monitoring then only
    /// handles fault predicates.
    pub fn discover(directory: &Path) -> Result<Self, Error> {
        let mut plugins = Vec::new();
        let entries = match std::fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(_) => {
                warn!(
                    "plugin directory {} does not exist; no plugins loaded",
                    directory.display()
                );
                return Ok(PluginHost { plugins });
            }
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() || !is_executable(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            plugins.push(Plugin { name, path });
        }
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(PluginHost { plugins })
    }

    /// Run every plugin's `setup` step, dropping the ones that fail.
    pub fn setup(&mut self) {
        self.plugins.retain(|plugin| {
            match run_command(
                &format!("{} setup", plugin.path.display()),
                Some(PLUGIN_TIMEOUT),
            ) {
                Ok(output) if output.success() => {
                    info!(plugin = %plugin.name, "loaded monitoring plugin");
                    true
                }
                Ok(output) => {
                    warn!(
                        plugin = %plugin.name,
                        "plugin setup failed, not loading: {}",
                        output.stderr.trim()
                    );
                    false
                }
                Err(err) => {
                    warn!(plugin = %plugin.name, "plugin setup failed, not loading: {err:#}");
                    false
                }
            }
        });
    }

    pub fn cleanup(&self) {
        for plugin in &self.plugins {
            let _ = run_command(
                &format!("{} cleanup", plugin.path.display()),
                Some(PLUGIN_TIMEOUT),
            );
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|plugin| plugin.name.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run all plugins in parallel on `pool`; failed runs are dropped so
    /// their previous results stay in place.
    pub fn run_all(&self, pool: &ThreadPool, coordinator_state: &str) -> Vec<PluginResult> {
        let (tx, rx) = mpsc::channel();
        for plugin in &self.plugins {
            let tx = tx.clone();
            let plugin = plugin.clone();
            let coordinator_state = coordinator_state.to_owned();
            pool.execute(move || {
                let result = run_plugin(&plugin, &coordinator_state);
                let _ = tx.send((plugin.name, result));
            });
        }
        drop(tx);

        let mut results = Vec::new();
        for (name, result) in rx {
            match result {
                Ok(result) => results.push(result),
                Err(err) => warn!(plugin = %name, "plugin run failed, keeping last result: {err:#}"),
            }
        }
        results.sort_by(|a, b| a.plugin_name.cmp(&b.plugin_name));
        results
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn run_plugin(plugin: &Plugin, coordinator_state: &str) -> Result<PluginResult, Error> {
    let started = Instant::now();
    let output = run_command(
        &format!("{} run {coordinator_state}", plugin.path.display()),
        Some(PLUGIN_TIMEOUT),
    )?;
    if !output.success() {
        anyhow::bail!("exit status {}: {}", output.status, output.stderr.trim());
    }

    let mut result: PluginResult = serde_json::from_str(output.stdout.trim())
        .with_context(|| format!("unparsable result from plugin {}", plugin.name))?;
    result.plugin_name = plugin.name.clone();
    result.last_run = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    result.runtime = format!("{:.2}", started.elapsed().as_secs_f64());
    Ok(result)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_plugin(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{body}").unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn test_discover_run_and_drop_failing_setup() {
        let dir = std::env::temp_dir().join(format!("pvc-plugins-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        write_plugin(
            &dir,
            "10-disk",
            r#"case "$1" in
setup) exit 0 ;;
run) echo '{"plugin_name":"","health_delta":10,"message":"1 disk degraded"}' ;;
esac"#,
        );
        write_plugin(&dir, "20-broken", "exit 1");

        let mut host = PluginHost::discover(&dir).unwrap();
        assert_eq!(host.names(), vec!["10-disk", "20-broken"]);
        host.setup();
        assert_eq!(host.names(), vec!["10-disk"]);

        let pool = ThreadPool::new(4);
        let results = host.run_all(&pool, "primary");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].plugin_name, "10-disk");
        assert_eq!(results[0].health_delta, 10);
        assert_eq!(results[0].message, "1 disk degraded");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let host = PluginHost::discover(Path::new("/nonexistent/pvc-plugins")).unwrap();
        assert!(host.is_empty());
    }
}
