//! Spec resolution: CLI flags, the selected profile, and env sources merge
//! into one canonical `PackageSpec`. Every validation error here fires before
//! any engine or network call.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::cli::{Cli, DeployCommand};
use crate::config::{Config, CustomPackage};
use crate::env::EnvMap;
use crate::error::{Error, Result};
use crate::fetch;

pub const DEFAULT_TARGET_LAUNCHER: &str = "swarm";
pub const DEFAULT_IMAGE_VERSION: &str = "latest";

/// The fully-resolved deployment intent. Constructed fresh per invocation and
/// threaded through the launch; never persisted.
#[derive(Debug, Clone)]
pub struct PackageSpec {
    pub command: DeployCommand,
    pub packages: Vec<String>,
    pub custom_packages: Vec<CustomPackage>,
    /// Flat `KEY=VALUE` list, keys unique, last write already applied.
    pub environment: Vec<String>,
    pub dev: bool,
    pub only: bool,
    pub image_version: String,
    pub target_launcher: String,
}

impl PackageSpec {
    /// Command handed to the container entrypoint:
    /// `<action> -t <launcher> [--dev] [--only] <packages...> <custom names not already listed>`.
    /// The shape is parsed by the image and must not change.
    pub fn container_command(&self) -> Vec<String> {
        let mut cmd = vec![
            self.command.as_str().to_string(),
            "-t".to_string(),
            self.target_launcher.clone(),
        ];
        if self.dev {
            cmd.push("--dev".to_string());
        }
        if self.only {
            cmd.push("--only".to_string());
        }
        cmd.extend(self.packages.iter().cloned());
        for custom in &self.custom_packages {
            let name = fetch::derive_name(custom);
            if !self.packages.contains(&name) && !cmd[3..].contains(&name) {
                cmd.push(name);
            }
        }
        cmd
    }

    /// Human-readable recap, printed before the first destructive call so a
    /// failed run's transcript is self-diagnosing.
    pub fn summary(&self, image: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "action:  {}", self.command);
        let _ = writeln!(out, "target:  {}", self.target_launcher);
        let _ = writeln!(out, "image:   {image}:{}", self.image_version);
        let _ = writeln!(out, "packages: {}", self.packages.join(", "));
        if !self.custom_packages.is_empty() {
            let customs: Vec<String> = self
                .custom_packages
                .iter()
                .map(|c| format!("{} ({})", fetch::derive_name(c), c.path))
                .collect();
            let _ = writeln!(out, "custom packages: {}", customs.join(", "));
        }
        if self.dev {
            let _ = writeln!(out, "mode:    dev");
        }
        if self.only {
            let _ = writeln!(out, "mode:    only");
        }
        out
    }
}

/// Merge flags, the named profile, and env sources into a `PackageSpec`.
pub fn resolve(cli: &Cli, config: &Config, config_path: &Path) -> Result<PackageSpec> {
    if config.image.trim().is_empty() {
        return Err(Error::NoConfigImage {
            path: config_path.to_path_buf(),
        });
    }

    let profile = match &cli.profile {
        Some(name) => Some(config.profile(name).ok_or_else(|| Error::NoSuchProfile {
            name: name.clone(),
        })?),
        None => None,
    };

    // An explicit flag that disagrees with the profile is an error, never a
    // silent override. A profile that leaves dev/only unset declares nothing.
    let mut dev = cli.dev;
    let mut only = cli.only;
    if let Some(profile) = profile {
        match profile.dev {
            Some(value) if cli.dev && !value => {
                return Err(Error::ConflictingDevFlag {
                    profile: profile.name.clone(),
                    profile_value: value,
                });
            }
            Some(value) if !cli.dev => dev = value,
            _ => {}
        }
        match profile.only {
            Some(value) if cli.only && !value => {
                return Err(Error::ConflictingOnlyFlag {
                    profile: profile.name.clone(),
                    profile_value: value,
                });
            }
            Some(value) if !cli.only => only = value,
            _ => {}
        }
    }

    if config.packages.is_empty() && config.custom_packages.is_empty() && cli.custom_paths.is_empty()
    {
        return Err(Error::NoPackages);
    }

    // Configured custom packages always take part; -c either selects one of
    // them (by id or path) or adds an ad-hoc entry.
    let mut custom_packages = config.custom_packages.clone();
    for value in &cli.custom_paths {
        if !custom_packages.iter().any(|c| c.matches(value)) {
            custom_packages.push(CustomPackage::ad_hoc(value.clone()));
        }
    }

    if let Some(profile) = profile {
        let ad_hoc_names: Vec<String> = cli
            .custom_paths
            .iter()
            .map(|p| fetch::derive_name(&CustomPackage::ad_hoc(p.clone())))
            .collect();
        let mut undefined: Vec<&str> = Vec::new();
        for p in &profile.packages {
            let defined = config.packages.contains(p)
                || config
                    .custom_packages
                    .iter()
                    .any(|c| c.id.as_deref() == Some(p.as_str()))
                || ad_hoc_names.contains(p);
            if !defined {
                undefined.push(p.as_str());
            }
        }
        if !undefined.is_empty() {
            return Err(Error::UndefinedProfilePackages {
                profile: profile.name.clone(),
                packages: undefined.join(", "),
            });
        }
    }

    let custom_names: Vec<String> = custom_packages.iter().map(fetch::derive_name).collect();
    for name in &cli.names {
        if !config.packages.contains(name) && !custom_names.contains(name) {
            return Err(Error::UndefinedPackage { name: name.clone() });
        }
    }

    // Profile packages sit ahead of explicitly named ones; with nothing named
    // anywhere the whole catalog deploys.
    let mut packages: Vec<String> = Vec::new();
    if let Some(profile) = profile {
        packages.extend(profile.packages.iter().cloned());
    }
    packages.extend(cli.names.iter().cloned());
    let mut deduped: Vec<String> = Vec::new();
    for p in packages {
        if !deduped.contains(&p) {
            deduped.push(p);
        }
    }
    let packages = if deduped.is_empty() {
        config.packages.clone()
    } else {
        deduped
    };

    let environment = resolve_environment(cli, profile, config_path)?;

    Ok(PackageSpec {
        command: cli.action,
        packages,
        custom_packages,
        environment,
        dev,
        only,
        image_version: cli
            .image_version
            .clone()
            .unwrap_or_else(|| DEFAULT_IMAGE_VERSION.to_string()),
        target_launcher: cli
            .target_launcher
            .clone()
            .unwrap_or_else(|| DEFAULT_TARGET_LAUNCHER.to_string()),
    })
}

/// Precedence, lowest to highest: profile env files (declared order), profile
/// env vars, `--env-file` (given order), `--env-var`.
fn resolve_environment(
    cli: &Cli,
    profile: Option<&crate::config::Profile>,
    config_path: &Path,
) -> Result<Vec<String>> {
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let mut env = EnvMap::new();
    if let Some(profile) = profile {
        for file in &profile.env_files {
            // profile paths are relative to the config file, not the cwd
            let path: PathBuf = if file.is_absolute() {
                file.clone()
            } else {
                config_dir.join(file)
            };
            env.load_file(&path)?;
        }
        for var in &profile.env_vars {
            env.set_literal(var);
        }
    }
    for file in &cli.env_files {
        env.load_file(file)?;
    }
    for var in &cli.env_vars {
        env.set_literal(var);
    }
    Ok(env.into_flat())
}
