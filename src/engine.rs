//! Thin wrapper over the container engine API. All calls operate on the
//! reserved container/volume names owned by the orchestrator.
//!
//! Benign-status classification lives here so callers never string-match
//! engine messages themselves. The literal substrings ("no such container",
//! "no such volume", "connection closed") are the compatibility contract with
//! the engine and are matched only as a fallback to the structured status.

use bollard::body_full;
use bollard::container::AttachContainerResults;
use bollard::errors::Error as DockerError;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    ListContainersOptionsBuilder, ListVolumesOptions, RemoveContainerOptionsBuilder,
    RemoveVolumeOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptionsBuilder, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use log::{debug, info};

use crate::error::{Error, Result};

/// Expected during cleanup races: the target is already gone.
pub fn is_benign_not_found(err: &DockerError) -> bool {
    match err {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => true,
        DockerError::DockerResponseServerError { message, .. } => {
            let message = message.to_lowercase();
            message.contains("no such container") || message.contains("no such volume")
        }
        _ => false,
    }
}

/// Expected while tearing down the output relay after the container stopped.
pub fn is_connection_closed(err: &DockerError) -> bool {
    match err {
        DockerError::IOError { err } => matches!(
            err.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
        ),
        other => other.to_string().to_lowercase().contains("connection closed"),
    }
}

fn already_stopped(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 304,
            ..
        }
    ) || is_benign_not_found(err)
}

pub struct Engine {
    docker: Docker,
}

impl Engine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::engine("connect to engine", e))?;
        Ok(Engine { docker })
    }

    /// Stop and remove the reserved container if any incarnation of it
    /// exists, running or not. Missing is a successful no-op.
    pub async fn remove_container_if_present(&self, name: &str) -> Result<()> {
        let options = ListContainersOptionsBuilder::default().all(true).build();
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| Error::engine("list containers", e))?;
        let slash_name = format!("/{name}");
        let present = containers.iter().any(|c| {
            c.names
                .as_ref()
                .is_some_and(|names| names.iter().any(|n| n == &slash_name))
        });
        if !present {
            return Ok(());
        }

        info!("removing leftover container {name}");
        if let Err(e) = self
            .docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
        {
            if !already_stopped(&e) {
                return Err(Error::engine(format!("stop container {name}"), e));
            }
        }
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_benign_not_found(&e) => Ok(()),
            Err(e) => Err(Error::engine(format!("remove container {name}"), e)),
        }
    }

    /// Remove the reserved volume; missing is a successful no-op.
    pub async fn remove_volume_if_present(&self, name: &str) -> Result<()> {
        let volumes = self
            .docker
            .list_volumes(None::<ListVolumesOptions>)
            .await
            .map_err(|e| Error::engine("list volumes", e))?;
        let present = volumes
            .volumes
            .unwrap_or_default()
            .iter()
            .any(|v| v.name == name);
        if !present {
            return Ok(());
        }
        info!("removing volume {name}");
        match self
            .docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_benign_not_found(&e) => Ok(()),
            Err(e) => Err(Error::engine(format!("remove volume {name}"), e)),
        }
    }

    pub async fn pull_image(&self, image: &str, tag: &str) -> Result<()> {
        info!("pulling {image}:{tag}");
        let options = CreateImageOptionsBuilder::default()
            .from_image(image)
            .tag(tag)
            .build();
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(update) = progress.next().await {
            let update = update.map_err(|e| Error::engine(format!("pull {image}:{tag}"), e))?;
            if let Some(status) = update.status {
                debug!("pull: {status}");
            }
        }
        Ok(())
    }

    pub async fn create_container(&self, name: &str, body: ContainerCreateBody) -> Result<()> {
        let options = CreateContainerOptionsBuilder::default().name(name).build();
        self.docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| Error::engine(format!("create container {name}"), e))?;
        Ok(())
    }

    /// Copy an uncompressed tar stream into `path` inside the created (not
    /// yet started) container.
    pub async fn upload_archive(&self, name: &str, path: &str, tar: Vec<u8>) -> Result<()> {
        let options = UploadToContainerOptionsBuilder::default().path(path).build();
        self.docker
            .upload_to_container(name, Some(options), body_full(tar.into()))
            .await
            .map_err(|e| Error::engine(format!("upload archive to {name}:{path}"), e))
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|e| Error::engine(format!("start container {name}"), e))
    }

    /// Attach to the container's multiplexed output before starting it.
    pub async fn attach_output(&self, name: &str) -> Result<AttachContainerResults> {
        let options = AttachContainerOptionsBuilder::default()
            .stream(true)
            .stdout(true)
            .stderr(true)
            .logs(true)
            .build();
        self.docker
            .attach_container(name, Some(options))
            .await
            .map_err(|e| Error::engine(format!("attach to container {name}"), e))
    }

    /// Block until the container reaches a terminal state and return its exit
    /// status. A container already removed counts as a clean exit: during the
    /// teardown race the engine reports it as missing.
    pub async fn wait_container(&self, name: &str) -> Result<i64> {
        let mut wait = self
            .docker
            .wait_container(name, None::<WaitContainerOptions>);
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) if is_benign_not_found(&e) => Ok(0),
            Some(Err(e)) => Err(Error::engine(format!("wait for container {name}"), e)),
            None => Ok(0),
        }
    }
}
