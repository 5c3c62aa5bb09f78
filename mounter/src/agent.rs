use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use csi_s3_types::error::Result;
use csi_s3_types::{DriverError, OptionsFrame};
use csi_s3_utils::consts::{CA_BUNDLE_FILENAME, CREDENTIAL_FILES_DIR, ERROR_FILENAME, EXIT_CODE_FILENAME};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::transport;

const STDERR_TAIL_BYTES: usize = 64 * 1024;

pub struct AgentConfig {
    pub socket_path: PathBuf,
    pub transport_accept_timeout: Duration,
    pub fuse_binary: String,
    pub source_dir: PathBuf,
}

/// `Start → WaitForOptions → Exec → RunFUSE → Exit`, with a timeout edge from `WaitForOptions`
/// straight to `Exit(TransportTimeout)` (§4.4). Each variant carries exactly the data the next
/// transition needs.
enum AgentState {
    Start,
    WaitForOptions,
    Exec(OptionsFrame),
    RunFuse(tokio::process::Child),
    Exit { exit_code: i32, error_tail: Option<String> },
}

/// Runs the mounter-pod agent's entire lifetime and returns the exit code the process itself
/// should exit with.
pub async fn run(cfg: AgentConfig) -> i32 {
    let mut state = AgentState::Start;
    loop {
        state = match state {
            AgentState::Start => AgentState::WaitForOptions,

            AgentState::WaitForOptions => match transport::receive_options(&cfg.socket_path, cfg.transport_accept_timeout).await {
                Ok(frame) => AgentState::Exec(frame),
                Err(e) => {
                    warn!(error = %e, "did not receive options before deadline");
                    AgentState::Exit {
                        exit_code: 1,
                        error_tail: Some("transport timeout waiting for mount options".to_owned()),
                    }
                }
            },

            AgentState::Exec(frame) => match start_fuse(&cfg, &frame).await {
                Ok(child) => AgentState::RunFuse(child),
                Err(e) => AgentState::Exit {
                    exit_code: 1,
                    error_tail: Some(e.to_string()),
                },
            },

            AgentState::RunFuse(child) => {
                let (exit_code, error_tail) = wait_for_fuse(child).await;
                AgentState::Exit { exit_code, error_tail }
            }

            AgentState::Exit { exit_code, error_tail } => {
                return finish(&cfg.source_dir, exit_code, error_tail.as_deref()).await;
            }
        };
    }
}

async fn start_fuse(cfg: &AgentConfig, frame: &OptionsFrame) -> Result<tokio::process::Child> {
    prepare_source_dir(&cfg.source_dir).await?;
    let args = write_credential_files(frame).await?;
    info!(bucket = %frame.bucket_name, source = %frame.source_path, "execing FUSE process");
    Command::new(&cfg.fuse_binary)
        .args(&args)
        .envs(&frame.envp)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| DriverError::Internal(format!("spawning FUSE process: {e}")))
}

/// Writes `frame.credential_files` into [`CREDENTIAL_FILES_DIR`] and, if a CA bundle was among
/// them, appends the argv flag pointing FUSE at it (§4.2, §4.4) unless the caller already
/// supplied one.
async fn write_credential_files(frame: &OptionsFrame) -> Result<Vec<String>> {
    let mut args = frame.argv.clone();
    if frame.credential_files.is_empty() {
        return Ok(args);
    }
    let dir = Path::new(CREDENTIAL_FILES_DIR);
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DriverError::Internal(format!("creating credential files dir {}: {e}", dir.display())))?;
    for (name, contents) in &frame.credential_files {
        let path = dir.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| DriverError::Internal(format!("writing credential file {}: {e}", path.display())))?;
        if name == CA_BUNDLE_FILENAME && !args.iter().any(|a| a.starts_with("--ca-bundle")) {
            args.push(format!("--ca-bundle={}", path.display()));
        }
    }
    Ok(args)
}

async fn prepare_source_dir(source_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(source_dir)
        .await
        .map_err(|e| DriverError::Internal(format!("creating source dir {}: {e}", source_dir.display())))
}

async fn wait_for_fuse(mut child: tokio::process::Child) -> (i32, Option<String>) {
    let mut stderr_tail = Vec::new();
    if let Some(mut stderr) = child.stderr.take() {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        let start = buf.len().saturating_sub(STDERR_TAIL_BYTES);
        stderr_tail = buf[start..].to_vec();
    }

    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            error!(error = %e, "waiting for FUSE process failed");
            return (1, Some(e.to_string()));
        }
    };

    let code = status.code().unwrap_or(-1);
    if code != 0 {
        error!(code, "FUSE process exited non-zero");
        return (code, Some(String::from_utf8_lossy(&stderr_tail).into_owned()));
    }
    (code, None)
}

/// Writes the exit sentinel files (§4.4).
async fn finish(source_dir: &Path, exit_code: i32, error_tail: Option<&str>) -> i32 {
    let exit_code_path = source_dir.join(EXIT_CODE_FILENAME);
    if let Err(e) = tokio::fs::write(&exit_code_path, exit_code.to_string()).await {
        error!(error = %e, path = %exit_code_path.display(), "failed to write exit-code sentinel");
    }
    if let Some(tail) = error_tail {
        let error_path = source_dir.join(ERROR_FILENAME);
        if let Err(e) = tokio::fs::write(&error_path, tail).await {
            error!(error = %e, path = %error_path.display(), "failed to write error sentinel");
        }
    }
    exit_code
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn finish_writes_exit_code_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let code = finish(dir.path(), 0, None).await;
        assert_eq!(code, 0);
        let contents = tokio::fs::read_to_string(dir.path().join(EXIT_CODE_FILENAME)).await.unwrap();
        assert_eq!(contents, "0");
        assert!(!dir.path().join(ERROR_FILENAME).exists());
    }

    #[tokio::test]
    async fn finish_writes_error_sentinel_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let code = finish(dir.path(), 1, Some("boom")).await;
        assert_eq!(code, 1);
        let err = tokio::fs::read_to_string(dir.path().join(ERROR_FILENAME)).await.unwrap();
        assert_eq!(err, "boom");
    }

    fn empty_frame() -> OptionsFrame {
        OptionsFrame {
            argv: vec!["--read-only".to_owned()],
            envp: Default::default(),
            credential_files: Default::default(),
            fs_group: String::new(),
            bucket_name: "bucket".to_owned(),
            source_path: "/mnt/source".to_owned(),
        }
    }

    #[tokio::test]
    async fn no_credential_files_leaves_argv_untouched() {
        let frame = empty_frame();
        let args = write_credential_files(&frame).await.unwrap();
        assert_eq!(args, frame.argv);
    }

    #[tokio::test]
    async fn ca_bundle_is_written_and_flagged() {
        let mut frame = empty_frame();
        frame
            .credential_files
            .insert(CA_BUNDLE_FILENAME.to_owned(), b"-----BEGIN CERTIFICATE-----".to_vec());
        let args = write_credential_files(&frame).await.unwrap();
        assert!(args.iter().any(|a| a.starts_with("--ca-bundle=")));
        let written = tokio::fs::read(Path::new(CREDENTIAL_FILES_DIR).join(CA_BUNDLE_FILENAME))
            .await
            .unwrap();
        assert_eq!(written, b"-----BEGIN CERTIFICATE-----");
    }
}
