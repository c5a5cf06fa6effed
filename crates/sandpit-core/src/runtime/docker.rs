//! Docker-backed sandbox runtime

use super::{Acquired, FileEntry, Sandbox, SandboxRuntime, StopOutcome, archive};
use crate::locks::KeyedLocks;
use crate::{Result, RunOutput, SandboxConfig, SandpitError, SessionKey};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder,
    RestartContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
    UploadToContainerOptionsBuilder,
};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::Path;

const MANAGED_LABEL: &str = "sandpit.session";

/// Lists `/proc` and exits 0 when some other process has the target path
/// as one of its arguments.
const PROBE_SCRIPT: &str = r"
import os, sys
target = sys.argv[1].encode()
me = str(os.getpid())
for pid in os.listdir('/proc'):
    if not pid.isdigit() or pid == me:
        continue
    try:
        with open('/proc/%s/cmdline' % pid, 'rb') as f:
            args = f.read().split(b'\0')
    except OSError:
        continue
    if target in args:
        sys.exit(0)
sys.exit(1)
";

/// Runtime placing each session in its own long-lived container
pub struct DockerRuntime {
    docker: Docker,
    config: SandboxConfig,
    creation: KeyedLocks<String>,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon
    pub fn connect(config: SandboxConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandpitError::Backend(format!("cannot connect to docker: {e}")))?;
        Ok(Self::with_client(docker, config))
    }

    #[must_use]
    pub fn with_client(docker: Docker, config: SandboxConfig) -> Self {
        Self {
            docker,
            config,
            creation: KeyedLocks::new(),
        }
    }

    /// Inspect `name`, returning its id and whether it is running
    async fn inspect(&self, name: &str) -> Result<Option<(String, bool)>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let id = info.id.unwrap_or_else(|| name.to_owned());
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                Ok(Some((id, running)))
            }
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(backend_error("inspect_container", name, &e)),
        }
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions>)
            .await
            .map_err(|e| SandpitError::CreationFailure(format!("start {name}: {e}")))
    }

    async fn create(&self, key: &SessionKey, name: &str) -> Result<String> {
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(name).build()),
                create_body(&self.config, key),
            )
            .await
            .map_err(|e| SandpitError::CreationFailure(format!("create {name}: {e}")))?;

        for warning in &created.warnings {
            tracing::warn!(container = %name, %warning, "docker create warning");
        }

        if let Err(e) = self.start_container(name).await {
            let _ = self
                .docker
                .remove_container(name, Some(RemoveContainerOptionsBuilder::new().force(true).build()))
                .await;
            return Err(e);
        }

        Ok(created.id)
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn acquire(&self, key: &SessionKey) -> Result<Acquired> {
        let name = key.container_name();
        let creating = self.creation.lock(&name).await;

        let acquired = match self.inspect(&name).await? {
            Some((id, running)) => {
                if !running {
                    tracing::info!(session = %key, container = %name, "starting stopped sandbox");
                    self.start_container(&name).await?;
                }
                tracing::debug!(session = %key, container = %name, "reusing sandbox");
                Acquired::Existing(Sandbox { id, name: name.clone(), session: key.clone() })
            }
            None => {
                let id = self.create(key, &name).await?;
                tracing::info!(session = %key, container = %name, id = %id, "created sandbox");
                Acquired::Created(Sandbox { id, name: name.clone(), session: key.clone() })
            }
        };

        drop(creating);
        self.creation.prune(&name);
        Ok(acquired)
    }

    async fn find(&self, key: &SessionKey) -> Result<Option<Sandbox>> {
        let name = key.container_name();
        Ok(self.inspect(&name).await?.and_then(|(id, running)| {
            running.then(|| Sandbox { id, name, session: key.clone() })
        }))
    }

    async fn exec(&self, sandbox: &Sandbox, command: &[String]) -> Result<RunOutput> {
        let started = tokio::time::Instant::now();
        let exec = self
            .docker
            .create_exec(
                &sandbox.name,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(self.config.workdir.to_string_lossy().into_owned()),
                    user: self.config.user.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| map_missing(sandbox, "create_exec", &e))?;

        let mut output = Vec::new();
        let mut truncated = false;
        let limit = self.config.max_output_bytes;

        match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await
            .map_err(|e| map_missing(sandbox, "start_exec", &e))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    let message = match chunk.map_err(|e| map_missing(sandbox, "exec output", &e))? {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => message,
                        LogOutput::StdIn { .. } => continue,
                    };
                    let room = limit.saturating_sub(output.len());
                    if message.len() > room {
                        output.extend_from_slice(&message[..room]);
                        truncated = true;
                    } else {
                        output.extend_from_slice(&message);
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(SandpitError::Backend("exec unexpectedly detached".into()));
            }
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| map_missing(sandbox, "inspect_exec", &e))?;

        Ok(RunOutput {
            exit_code: inspected.exit_code.unwrap_or(-1),
            output,
            duration: started.elapsed(),
            timed_out: false,
            truncated,
        })
    }

    async fn kill_processes(&self, sandbox: &Sandbox) -> Result<()> {
        self.docker
            .restart_container(&sandbox.name, Some(RestartContainerOptionsBuilder::new().t(0).build()))
            .await
            .map_err(|e| map_missing(sandbox, "restart_container", &e))
    }

    async fn has_process(&self, sandbox: &Sandbox, path: &Path) -> Result<bool> {
        let mut command = self.config.interpreter.clone();
        command.push("-c".into());
        command.push(PROBE_SCRIPT.into());
        command.push(path.to_string_lossy().into_owned());
        Ok(self.exec(sandbox, &command).await?.exit_code == 0)
    }

    async fn push_files(&self, sandbox: &Sandbox, dir: &Path, files: &[FileEntry]) -> Result<()> {
        let bundle = archive::bundle(dir, files)?;
        self.docker
            .upload_to_container(
                &sandbox.name,
                Some(UploadToContainerOptionsBuilder::new().path("/").build()),
                bollard::body_full(bundle.into()),
            )
            .await
            .map_err(|e| match map_missing(sandbox, "upload_to_container", &e) {
                SandpitError::Backend(message) => SandpitError::InjectionFailure(message),
                other => other,
            })
    }

    async fn restart(&self, sandbox: &Sandbox) -> Result<()> {
        tracing::debug!(container = %sandbox.name, "restarting sandbox");
        self.docker
            .restart_container(&sandbox.name, Some(RestartContainerOptionsBuilder::new().t(1).build()))
            .await
            .map_err(|e| map_missing(sandbox, "restart_container", &e))
    }

    async fn sessions(&self) -> Result<Vec<SessionKey>> {
        let filters = HashMap::from([("label", vec![MANAGED_LABEL])]);
        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::new()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(|e| backend_error("list_containers", MANAGED_LABEL, &e))?;

        Ok(containers
            .into_iter()
            .filter_map(|container| session_label(container.labels.as_ref()?))
            .collect())
    }

    async fn stop(&self, key: &SessionKey) -> Result<StopOutcome> {
        let name = key.container_name();
        match self
            .docker
            .stop_container(&name, Some(StopContainerOptionsBuilder::new().t(2).build()))
            .await
        {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => return Ok(StopOutcome::NotFound),
            // 304: already stopped, removal below still applies
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => {}
            Err(e) => return Err(backend_error("stop_container", &name, &e)),
        }

        match self
            .docker
            .remove_container(
                &name,
                Some(RemoveContainerOptionsBuilder::new().force(true).v(true).build()),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(session = %key, container = %name, "sandbox stopped and removed");
                Ok(StopOutcome::Stopped)
            }
            Err(e) if is_not_found(&e) => Ok(StopOutcome::NotFound),
            Err(e) => Err(backend_error("remove_container", &name, &e)),
        }
    }
}

fn create_body(config: &SandboxConfig, key: &SessionKey) -> ContainerCreateBody {
    let env: Vec<String> = config.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    ContainerCreateBody {
        image: Some(config.image.clone()),
        cmd: Some(vec!["sleep".into(), "infinity".into()]),
        working_dir: Some(config.workdir.to_string_lossy().into_owned()),
        env: if env.is_empty() { None } else { Some(env) },
        user: config.user.clone(),
        labels: Some(HashMap::from([(MANAGED_LABEL.to_owned(), key.to_string())])),
        network_disabled: Some(!config.allow_network),
        host_config: Some(HostConfig {
            runtime: config.oci_runtime.clone(),
            memory: i64::try_from(config.memory_limit).ok(),
            cpu_quota: Some(config.cpu_quota),
            cpu_period: Some(100_000),
            pids_limit: Some(config.max_pids),
            security_opt: Some(vec!["no-new-privileges".into()]),
            cap_drop: Some(vec!["ALL".into()]),
            network_mode: if config.allow_network { None } else { Some("none".into()) },
            init: Some(true),
            ..HostConfig::default()
        }),
        ..ContainerCreateBody::default()
    }
}

/// Session owning a labelled container; foreign or mangled labels are skipped
fn session_label(labels: &HashMap<String, String>) -> Option<SessionKey> {
    let raw = labels.get(MANAGED_LABEL)?;
    match SessionKey::new(raw.clone()) {
        Ok(key) => Some(key),
        Err(e) => {
            tracing::warn!(label = %raw, error = %e, "ignoring container with invalid session label");
            None
        }
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError { status_code: 404, .. }
    )
}

fn backend_error(operation: &str, target: &str, error: &BollardError) -> SandpitError {
    SandpitError::Backend(format!("{operation} {target}: {error}"))
}

/// 404 on a sandbox means the session has to be started again
fn map_missing(sandbox: &Sandbox, operation: &str, error: &BollardError) -> SandpitError {
    if is_not_found(error) {
        SandpitError::SandboxNotFound(sandbox.session.to_string())
    } else {
        backend_error(operation, &sandbox.name, error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_body_applies_caps() {
        let key = SessionKey::new("u1").unwrap();
        let body = create_body(&SandboxConfig::default(), &key);
        let host = body.host_config.unwrap();
        assert_eq!(host.memory, Some(256 * 1024 * 1024));
        assert_eq!(host.cpu_quota, Some(50_000));
        assert_eq!(host.network_mode.as_deref(), Some("none"));
        assert_eq!(host.security_opt, Some(vec!["no-new-privileges".to_owned()]));
        assert_eq!(body.network_disabled, Some(true));
        assert_eq!(body.working_dir.as_deref(), Some("/sandbox"));
        assert_eq!(
            body.labels.unwrap().get(MANAGED_LABEL).map(String::as_str),
            Some("u1")
        );
    }

    #[test]
    fn session_labels_round_trip_through_create_body() {
        let key = SessionKey::new("user@example.com").unwrap();
        let labels = create_body(&SandboxConfig::default(), &key).labels.unwrap();
        assert_eq!(session_label(&labels), Some(key));

        let foreign = HashMap::from([("other".to_owned(), "x".to_owned())]);
        assert_eq!(session_label(&foreign), None);
        let empty = HashMap::from([(MANAGED_LABEL.to_owned(), String::new())]);
        assert_eq!(session_label(&empty), None);
    }

    #[test]
    fn not_found_is_recognised() {
        let err = BollardError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        assert!(is_not_found(&err));

        let sandbox = Sandbox {
            id: "abc".into(),
            name: "sandbox_u1".into(),
            session: SessionKey::new("u1").unwrap(),
        };
        assert!(matches!(
            map_missing(&sandbox, "exec", &err),
            SandpitError::SandboxNotFound(s) if s == "u1"
        ));
    }
}
