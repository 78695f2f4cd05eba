//! Makes sure the headless browser engine the backend drives is on disk
//! before the backend is started.

use crate::config::{LaunchMode, ShellConfig};
use crate::error::{Result, ShellError};
use serde::Serialize;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStage {
    Checking,
    Installing,
    Copying,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionProgress {
    pub stage: ProvisionStage,
    pub caption: String,
}

impl ProvisionProgress {
    fn new(stage: ProvisionStage, caption: impl Into<String>) -> Self {
        Self {
            stage,
            caption: caption.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstallerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone)]
pub enum InstallSource {
    /// Run the engine's own installer (development).
    Installer(InstallerCommand),
    /// Copy the engine shipped inside the app bundle (production).
    Bundled(PathBuf),
}

pub struct AssetProvisioner {
    cache_dir: PathBuf,
    prefix: String,
    source: InstallSource,
}

impl AssetProvisioner {
    pub fn new(cache_dir: PathBuf, prefix: impl Into<String>, source: InstallSource) -> Self {
        Self {
            cache_dir,
            prefix: prefix.into(),
            source,
        }
    }

    pub fn from_config(config: &ShellConfig, resource_dir: Option<&Path>) -> Self {
        let source = match config.mode {
            LaunchMode::Development => {
                let cwd = config
                    .backend_dir
                    .clone()
                    .unwrap_or_else(|| Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("backend"));
                InstallSource::Installer(InstallerCommand {
                    program: PathBuf::from(if cfg!(target_os = "windows") { "uv.exe" } else { "uv" }),
                    args: ["run", "playwright", "install", "chromium"]
                        .iter()
                        .map(|arg| arg.to_string())
                        .collect(),
                    cwd,
                })
            }
            LaunchMode::Production => InstallSource::Bundled(
                resource_dir
                    .map(|dir| dir.join("backend-dist").join("playwright-browsers"))
                    .unwrap_or_else(|| PathBuf::from("backend-dist").join("playwright-browsers")),
            ),
        };
        Self::new(config.asset_cache_dir.clone(), config.asset_prefix.clone(), source)
    }

    pub fn is_installed(&self) -> bool {
        is_asset_installed(&self.cache_dir, &self.prefix)
    }

    pub fn ensure_asset_installed(&self, report: &mut dyn FnMut(ProvisionProgress)) -> Result<()> {
        report(ProvisionProgress::new(ProvisionStage::Checking, "Checking browser engine..."));
        if self.is_installed() {
            log::info!("browser engine already present in {}", self.cache_dir.display());
            report(ProvisionProgress::new(ProvisionStage::Ready, "Browser engine ready"));
            return Ok(());
        }

        let outcome = match &self.source {
            InstallSource::Installer(installer) => self.run_installer(installer, report),
            InstallSource::Bundled(bundle) => self.copy_bundled(bundle, report),
        };
        let outcome = outcome.and_then(|()| {
            if self.is_installed() {
                Ok(())
            } else {
                Err(self.missing("no engine build found after installation"))
            }
        });

        match &outcome {
            Ok(()) => report(ProvisionProgress::new(ProvisionStage::Ready, "Browser engine ready")),
            Err(e) => {
                log::error!("browser engine provisioning failed: {e}");
                report(ProvisionProgress::new(ProvisionStage::Failed, e.to_string()));
            }
        }
        outcome
    }

    fn missing(&self, details: impl Into<String>) -> ShellError {
        ShellError::AssetMissing {
            path: self.cache_dir.clone(),
            details: details.into(),
        }
    }

    /// Only the installer's exit status decides success; its output just feeds the caption.
    fn run_installer(
        &self,
        installer: &InstallerCommand,
        report: &mut dyn FnMut(ProvisionProgress),
    ) -> Result<()> {
        log::info!(
            "installing browser engine: {} {}",
            installer.program.display(),
            installer.args.join(" ")
        );
        report(ProvisionProgress::new(ProvisionStage::Installing, "Installing browser engine..."));

        let mut child = Command::new(&installer.program)
            .args(&installer.args)
            .current_dir(&installer.cwd)
            .env("PLAYWRIGHT_BROWSERS_PATH", &self.cache_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| self.missing(format!("installer could not start: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            while let Ok(read) = reader.read_until(b'\n', &mut buf) {
                if read == 0 {
                    break;
                }
                let line = String::from_utf8_lossy(&buf).trim().to_string();
                buf.clear();
                if line.is_empty() {
                    continue;
                }
                log::info!(target: "installer", "{line}");
                if let Some(caption) = caption_for_installer_line(&line) {
                    report(ProvisionProgress::new(ProvisionStage::Installing, caption));
                }
            }
        }

        let status = child
            .wait()
            .map_err(|e| self.missing(format!("installer did not finish: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(self.missing(format!("installer exited with {status}")))
        }
    }

    fn copy_bundled(&self, bundle: &Path, report: &mut dyn FnMut(ProvisionProgress)) -> Result<()> {
        let builds: Vec<PathBuf> = fs::read_dir(bundle)
            .map_err(|e| self.missing(format!("bundled engine at {} unreadable: {e}", bundle.display())))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(&self.prefix))
            .map(|entry| entry.path())
            .collect();
        if builds.is_empty() {
            return Err(self.missing(format!(
                "no `{}*` build inside {}",
                self.prefix,
                bundle.display()
            )));
        }

        fs::create_dir_all(&self.cache_dir)
            .map_err(|e| self.missing(format!("cannot create cache dir: {e}")))?;
        for build in builds {
            let Some(name) = build.file_name() else {
                continue;
            };
            report(ProvisionProgress::new(
                ProvisionStage::Copying,
                format!("Copying {}...", name.to_string_lossy()),
            ));
            let target = self.cache_dir.join(name);
            copy_tree(&build, &target).map_err(|details| self.missing(details))?;
            log::info!("copied bundled engine {} -> {}", build.display(), target.display());
        }
        Ok(())
    }
}

/// An engine is installed iff the cache holds a non-empty `<prefix>*` directory.
pub fn is_asset_installed(cache_dir: &Path, prefix: &str) -> bool {
    let Ok(entries) = fs::read_dir(cache_dir) else {
        return false;
    };
    entries.filter_map(|entry| entry.ok()).any(|entry| {
        let path = entry.path();
        path.is_dir()
            && entry.file_name().to_string_lossy().starts_with(prefix)
            && fs::read_dir(&path)
                .map(|mut children| children.next().is_some())
                .unwrap_or(false)
    })
}

/// Cosmetic caption for one line of installer output.
pub fn caption_for_installer_line(line: &str) -> Option<String> {
    let lower = line.to_lowercase();
    if let Some(percent) = line
        .split_whitespace()
        .find(|word| word.ends_with('%') && word[..word.len() - 1].parse::<f32>().is_ok())
    {
        return Some(format!("Downloading browser engine... {percent}"));
    }
    if lower.contains("downloading") {
        Some("Downloading browser engine...".to_string())
    } else if lower.contains("extract") || lower.contains("unzip") {
        Some("Unpacking browser engine...".to_string())
    } else if lower.contains("downloaded to") || lower.contains("installed") {
        Some("Finishing installation...".to_string())
    } else {
        None
    }
}

/// Recursive copy keeping permission bits and symlinks. Content failures are
/// fatal, permission failures are only logged.
fn copy_tree(src: &Path, dst: &Path) -> std::result::Result<(), String> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| format!("cannot walk {}: {e}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| format!("bad path {}: {e}", entry.path().display()))?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| format!("cannot create {}: {e}", target.display()))?;
            copy_permissions(entry.path(), &target);
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                format!("cannot copy {} -> {}: {e}", entry.path().display(), target.display())
            })?;
            copy_permissions(entry.path(), &target);
        }
    }
    Ok(())
}

fn copy_permissions(src: &Path, dst: &Path) {
    let applied = fs::metadata(src).and_then(|meta| fs::set_permissions(dst, meta.permissions()));
    if let Err(e) = applied {
        log::warn!("could not copy permissions to {}: {e}", dst.display());
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> std::result::Result<(), String> {
    let link = fs::read_link(src).map_err(|e| format!("cannot read link {}: {e}", src.display()))?;
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst).map_err(|e| format!("cannot replace {}: {e}", dst.display()))?;
    }
    std::os::unix::fs::symlink(&link, dst)
        .map_err(|e| format!("cannot link {} -> {}: {e}", dst.display(), link.display()))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> std::result::Result<(), String> {
    fs::copy(src, dst)
        .map(|_| ())
        .map_err(|e| format!("cannot copy {} -> {}: {e}", src.display(), dst.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(provisioner: &AssetProvisioner) -> (Result<()>, Vec<ProvisionProgress>) {
        let mut events = Vec::new();
        let result = provisioner.ensure_asset_installed(&mut |progress| events.push(progress));
        (result, events)
    }

    #[test]
    fn detection_needs_a_non_empty_prefixed_directory() {
        let cache = tempfile::tempdir().unwrap();
        assert!(!is_asset_installed(&cache.path().join("missing"), "chromium"));
        assert!(!is_asset_installed(cache.path(), "chromium"));

        fs::create_dir(cache.path().join("firefox-1")).unwrap();
        fs::write(cache.path().join("firefox-1").join("x"), b"x").unwrap();
        assert!(!is_asset_installed(cache.path(), "chromium"));

        fs::create_dir(cache.path().join("chromium-1091")).unwrap();
        assert!(!is_asset_installed(cache.path(), "chromium"));

        fs::write(cache.path().join("chromium-1091").join("INSTALLATION_COMPLETE"), b"").unwrap();
        assert!(is_asset_installed(cache.path(), "chromium"));
    }

    #[test]
    fn installed_engine_skips_provisioning() {
        let cache = tempfile::tempdir().unwrap();
        fs::create_dir_all(cache.path().join("chromium-1").join("bin")).unwrap();
        let provisioner = AssetProvisioner::new(
            cache.path().to_path_buf(),
            "chromium",
            InstallSource::Bundled(PathBuf::from("/nowhere")),
        );
        let (result, events) = collect(&provisioner);
        assert!(result.is_ok());
        assert_eq!(events.last().unwrap().stage, ProvisionStage::Ready);
        assert!(!events.iter().any(|e| e.stage == ProvisionStage::Copying));
    }

    #[test]
    fn missing_bundle_is_asset_missing() {
        let cache = tempfile::tempdir().unwrap();
        let bundle = tempfile::tempdir().unwrap();
        let provisioner = AssetProvisioner::new(
            cache.path().join("ms-playwright"),
            "chromium",
            InstallSource::Bundled(bundle.path().to_path_buf()),
        );
        let (result, events) = collect(&provisioner);
        assert!(matches!(result, Err(ShellError::AssetMissing { .. })));
        assert_eq!(events.last().unwrap().stage, ProvisionStage::Failed);
    }

    #[cfg(unix)]
    #[test]
    fn bundled_copy_keeps_exec_bits_and_links() {
        use std::os::unix::fs::PermissionsExt;

        let bundle = tempfile::tempdir().unwrap();
        let build = bundle.path().join("chromium-1091").join("chrome-linux");
        fs::create_dir_all(&build).unwrap();
        let exe = build.join("chrome");
        fs::write(&exe, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(build.join("resources.pak"), b"data").unwrap();
        fs::set_permissions(build.join("resources.pak"), fs::Permissions::from_mode(0o640)).unwrap();
        std::os::unix::fs::symlink("chrome", build.join("chrome-link")).unwrap();

        let cache = tempfile::tempdir().unwrap();
        let cache_dir = cache.path().join("ms-playwright");
        let provisioner = AssetProvisioner::new(
            cache_dir.clone(),
            "chromium",
            InstallSource::Bundled(bundle.path().to_path_buf()),
        );
        let (result, events) = collect(&provisioner);
        result.unwrap();
        assert!(events.iter().any(|e| e.stage == ProvisionStage::Copying));

        let copied = cache_dir.join("chromium-1091").join("chrome-linux");
        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&copied.join("chrome")), 0o755);
        assert_eq!(mode(&copied.join("resources.pak")), 0o640);
        assert_eq!(
            fs::read_link(copied.join("chrome-link")).unwrap(),
            PathBuf::from("chrome")
        );
        assert!(provisioner.is_installed());
    }

    #[cfg(unix)]
    #[test]
    fn installer_exit_status_decides_not_its_output() {
        let cache = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let installer = |script: &str| InstallerCommand {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: work.path().to_path_buf(),
        };

        let lying = AssetProvisioner::new(
            cache.path().to_path_buf(),
            "chromium",
            InstallSource::Installer(installer("echo 'Chromium downloaded to /tmp'; exit 1")),
        );
        let (result, events) = collect(&lying);
        assert!(matches!(result, Err(ShellError::AssetMissing { .. })));
        assert!(events
            .iter()
            .any(|e| e.caption == "Finishing installation..."));

        let honest = AssetProvisioner::new(
            cache.path().to_path_buf(),
            "chromium",
            InstallSource::Installer(installer(
                "echo 'Downloading Chromium 120'; echo '|====| 50% of 150 MiB'; \
                 mkdir -p \"$PLAYWRIGHT_BROWSERS_PATH/chromium-1/bin\"; \
                 touch \"$PLAYWRIGHT_BROWSERS_PATH/chromium-1/bin/chrome\"",
            )),
        );
        let (result, events) = collect(&honest);
        result.unwrap();
        assert!(events
            .iter()
            .any(|e| e.caption == "Downloading browser engine... 50%"));
        assert_eq!(events.last().unwrap().stage, ProvisionStage::Ready);
    }

    #[test]
    fn captions_are_heuristic_only() {
        assert_eq!(
            caption_for_installer_line("Downloading Chromium 120.0 (playwright build v1091)"),
            Some("Downloading browser engine...".to_string())
        );
        assert_eq!(
            caption_for_installer_line("|■■■■■■■■        |  40% of 153.1 MiB"),
            Some("Downloading browser engine... 40%".to_string())
        );
        assert_eq!(caption_for_installer_line("some unrelated noise"), None);
    }
}
