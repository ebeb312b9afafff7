//! Lifecycle of the single reserved deployment container:
//! clean slate, pull, create, inject custom packages, start, stream output
//! while awaiting a terminal state, then remove the reserved volume.
//!
//! The reserved container and volume names act as a singleton slot per engine
//! endpoint; leftovers are always cleared before a new launch, so concurrent
//! invocations against the same endpoint race destructively and are
//! unsupported.

use std::path::Path;
use std::time::Duration;

use bollard::models::{ContainerCreateBody, HostConfig};
use log::{info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::fetch;
use crate::relay;
use crate::spec::PackageSpec;

/// Fixed mount point of the reserved volume inside the container.
pub const VOLUME_MOUNT_PATH: &str = "/data";
/// Where injected custom packages land; the entrypoint scans this directory.
pub const CUSTOM_PACKAGE_DIR: &str = "/opt/custom-packages";
/// Mount point for the optional host log directory.
pub const LOG_MOUNT_PATH: &str = "/var/log/deployment";
/// The host engine socket is bound in so the inner orchestration can itself
/// drive the engine.
pub const ENGINE_SOCKET: &str = "/var/run/docker.sock";

/// One deadline bounds the whole launch attempt; no step is retried.
pub const LAUNCH_TIMEOUT: Duration = Duration::from_secs(15 * 60);

const RELAY_DRAIN_GRACE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    engine: Engine,
    container: String,
    volume: String,
}

impl Orchestrator {
    pub fn new(engine: Engine, config: &Config) -> Self {
        let (container, volume) = reserved_names(config);
        Orchestrator {
            engine,
            container,
            volume,
        }
    }

    /// Drive the full lifecycle under the launch deadline.
    pub async fn launch(&self, spec: &PackageSpec, config: &Config) -> Result<()> {
        match tokio::time::timeout(LAUNCH_TIMEOUT, self.run(spec, config)).await {
            Ok(result) => result,
            Err(_) => Err(Error::DeadlineExceeded(LAUNCH_TIMEOUT)),
        }
    }

    async fn run(&self, spec: &PackageSpec, config: &Config) -> Result<()> {
        self.clean_slate().await?;
        self.engine
            .pull_image(&config.image, &spec.image_version)
            .await?;

        info!("creating container {}", self.container);
        self.engine
            .create_container(&self.container, container_body(spec, config, &self.volume))
            .await?;

        // From here on the reserved volume must not survive a failure.
        let outcome = self.run_created(spec).await;
        match outcome {
            Ok(()) => {
                self.clean_slate().await?;
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn run_created(&self, spec: &PackageSpec) -> Result<()> {
        self.inject_custom_packages(spec).await?;

        // Attach before start so no early output is lost.
        let attached = self.engine.attach_output(&self.container).await?;
        info!("starting container {}", self.container);
        self.engine.start_container(&self.container).await?;

        let relay_task = tokio::spawn(relay::pump(attached.output));
        let status = self.engine.wait_container(&self.container).await;
        drain_relay(relay_task).await?;

        let status = status?;
        if status != 0 {
            return Err(Error::ContainerFailed { status });
        }
        Ok(())
    }

    /// Fetch every custom package into one staging directory, tar it, and
    /// copy it into the created container before start. The staging TempDir
    /// is deleted on drop whether or not acquisition succeeds.
    async fn inject_custom_packages(&self, spec: &PackageSpec) -> Result<()> {
        if spec.custom_packages.is_empty() {
            return Ok(());
        }
        let staging = tempfile::tempdir().map_err(|e| Error::io("create staging dir", e))?;
        for custom in &spec.custom_packages {
            let name = fetch::fetch_into(custom, staging.path()).await?;
            info!("staged custom package {name}");
        }

        let target = Path::new(CUSTOM_PACKAGE_DIR);
        let parent = target
            .parent()
            .and_then(Path::to_str)
            .unwrap_or("/");
        let dirname = target
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("custom-packages");
        let archive = fetch::archive_staging(staging.path(), dirname).await?;
        self.engine
            .upload_archive(&self.container, parent, archive)
            .await
    }

    /// Remove any same-named leftovers. Runs before every launch and after a
    /// successful teardown.
    pub async fn clean_slate(&self) -> Result<()> {
        self.engine.remove_container_if_present(&self.container).await?;
        self.engine.remove_volume_if_present(&self.volume).await
    }

    /// Best-effort cleanup on failure paths so a rerun starts clean.
    pub async fn teardown(&self) {
        if let Err(e) = self.engine.remove_container_if_present(&self.container).await {
            warn!("teardown: {e}");
        }
        if let Err(e) = self.engine.remove_volume_if_present(&self.volume).await {
            warn!("teardown: {e}");
        }
    }
}

/// Give the relay a moment to drain the tail of the stream; a stream that
/// closed with the container is a clean end, not a failure. A relay still
/// running when the grace expires is aborted so no task outlives the launch.
async fn drain_relay(mut task: tokio::task::JoinHandle<Result<()>>) -> Result<()> {
    match tokio::time::timeout(RELAY_DRAIN_GRACE, &mut task).await {
        Ok(Ok(relay_result)) => relay_result,
        Ok(Err(join_err)) => Err(Error::io("output relay", std::io::Error::other(join_err))),
        Err(_) => {
            warn!("output relay still draining at exit; aborting it");
            task.abort();
            let _ = task.await;
            Ok(())
        }
    }
}

/// One reserved container and one reserved volume per engine endpoint.
fn reserved_names(config: &Config) -> (String, String) {
    let project = config.project();
    (format!("{project}-deployer"), format!("{project}-data"))
}

fn container_body(spec: &PackageSpec, config: &Config, volume: &str) -> ContainerCreateBody {
    let mut binds = vec![
        format!("{ENGINE_SOCKET}:{ENGINE_SOCKET}"),
        format!("{volume}:{VOLUME_MOUNT_PATH}"),
    ];
    if let Some(log_path) = &config.log_path {
        binds.push(format!("{}:{LOG_MOUNT_PATH}", log_path.display()));
    }

    let mut env = spec.environment.clone();
    if let Some(platform) = &config.platform_image {
        if !env.iter().any(|e| e.starts_with("PLATFORM_IMAGE=")) {
            env.push(format!("PLATFORM_IMAGE={platform}"));
        }
    }

    ContainerCreateBody {
        image: Some(format!("{}:{}", config.image, spec.image_version)),
        cmd: Some(spec.container_command()),
        env: Some(env),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            binds: Some(binds),
            ..Default::default()
        }),
        ..Default::default()
    }
}
