//! Subprocess-backed [`ModelFitter`].
//!
//! The external program receives one JSON request on stdin and writes
//! newline-delimited JSON messages to stdout:
//!
//! ```text
//! {"type":"progress","fraction":0.4,"message":"epoch 4/10"}
//! {"type":"fit","model_artifact_path":"/out/model.onnx","validation_predictions":[...]}
//! ```
//!
//! A `predict` request is answered with `{"type":"predict","predictions":[...]}`.

use crate::config::FitterConfig;
use crate::data::Sample;
use crate::error::MisreadError;
use crate::eval::Prediction;
use crate::training::fitter::{FitOutcome, FitRequest, ModelFitter, ProgressSink, report};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum FitterCommand<'a> {
    Fit(&'a FitRequest),
    Predict {
        model_artifact_path: &'a Path,
        samples: &'a [Sample],
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FitterMessage {
    Progress {
        fraction: f64,
        #[serde(default)]
        message: String,
    },
    Fit(FitOutcome),
    Predict {
        predictions: Vec<Prediction>,
    },
}

/// Runs an external training program per fit or predict call.
pub struct CommandFitter {
    program: String,
    args: Vec<String>,
    workspace: PathBuf,
    timeout: Duration,
}

impl CommandFitter {
    pub fn new(program: impl Into<String>, workspace: PathBuf) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workspace,
            timeout: Duration::from_secs(3600),
        }
    }

    pub fn from_config(config: &FitterConfig, workspace: PathBuf) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            workspace,
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn invoke(
        &self,
        command: &FitterCommand<'_>,
        progress: &Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Result<FitterMessage, MisreadError> {
        let input = serde_json::to_vec(command)?;
        debug!(program = %self.program, bytes = input.len(), "Invoking fitter");

        let run = async {
            let mut child = Command::new(&self.program)
                .args(&self.args)
                .current_dir(&self.workspace)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| MisreadError::fitter(format!("Failed to spawn {}: {e}", self.program)))?;

            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| MisreadError::fitter("Fitter stdin unavailable"))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| MisreadError::fitter("Fitter stdout unavailable"))?;
            let mut stderr = child
                .stderr
                .take()
                .ok_or_else(|| MisreadError::fitter("Fitter stderr unavailable"))?;

            // Service every pipe at once; the child may write before it reads.
            let stderr_task = tokio::spawn(async move {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            });
            let stdin_task = tokio::spawn(async move {
                stdin.write_all(&input).await?;
                stdin.shutdown().await
            });

            let mut lines = BufReader::new(stdout).lines();
            let mut answer = None;
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<FitterMessage>(line) {
                    Ok(FitterMessage::Progress { fraction, message }) => {
                        report(progress, fraction, &message)
                    }
                    Ok(message) => answer = Some(message),
                    Err(e) => debug!(error = %e, "Ignoring non-protocol fitter output"),
                }
            }

            let status = child.wait().await?;
            let stderr = stderr_task.await.unwrap_or_default();
            if !status.success() {
                return Err(MisreadError::fitter(format!(
                    "Fitter failed (exit {status}): {}",
                    stderr.trim()
                )));
            }
            match stdin_task.await {
                Ok(Ok(())) => {}
                // The child may answer without consuming the whole request.
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                    debug!("Fitter closed stdin early")
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(MisreadError::fitter(format!("Request writer failed: {e}"))),
            }
            answer.ok_or_else(|| MisreadError::fitter("Fitter produced no result"))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(MisreadError::Cancelled),
            result = tokio::time::timeout(self.timeout, run) => match result {
                Ok(inner) => inner,
                Err(_) => Err(MisreadError::Timeout(format!(
                    "Fitter timed out after {}s",
                    self.timeout.as_secs()
                ))),
            },
        }
    }
}

#[async_trait]
impl ModelFitter for CommandFitter {
    async fn fit(
        &self,
        request: FitRequest,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<FitOutcome, MisreadError> {
        let cancel = request.cancellation.clone();
        match self
            .invoke(&FitterCommand::Fit(&request), &progress, &cancel)
            .await?
        {
            FitterMessage::Fit(outcome) => Ok(outcome),
            other => Err(MisreadError::fitter(format!(
                "Expected fit result, got {other:?}"
            ))),
        }
    }

    async fn predict(
        &self,
        model_artifact: &Path,
        samples: &[Sample],
    ) -> Result<Vec<Prediction>, MisreadError> {
        let command = FitterCommand::Predict {
            model_artifact_path: model_artifact,
            samples,
        };
        match self
            .invoke(&command, &None, &CancellationToken::new())
            .await?
        {
            FitterMessage::Predict { predictions } => Ok(predictions),
            other => Err(MisreadError::fitter(format!(
                "Expected predictions, got {other:?}"
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn request(dir: &Path) -> FitRequest {
        FitRequest {
            training_dir: dir.to_path_buf(),
            output_dir: dir.to_path_buf(),
            samples: vec![Sample::new(dir.join("blur/0.png"), "blur")],
            learning_rate: 0.01,
            epochs: 2,
            batch_size: 4,
            validation_split_ratio: None,
            augmentation: None,
            balancing: None,
            cancellation: CancellationToken::new(),
        }
    }

    fn shell(dir: &Path, script: &str) -> CommandFitter {
        CommandFitter::new("sh", dir.to_path_buf()).with_args(vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn test_fit_parses_progress_and_result() {
        let dir = tempfile::tempdir().unwrap();
        let fitter = shell(
            dir.path(),
            r#"cat > request.json
echo '{"type":"progress","fraction":0.5,"message":"epoch 1/2"}'
echo 'loading weights'
echo '{"type":"fit","model_artifact_path":"/m/model.bin","validation_predictions":[{"actual":"blur","predicted":"blur"}]}'"#,
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: Arc<dyn ProgressSink> = Arc::new(move |f: f64, m: &str| {
            sink_seen.lock().unwrap().push((f, m.to_string()));
        });

        let outcome = fitter.fit(request(dir.path()), Some(sink)).await.unwrap();
        assert_eq!(outcome.model_artifact_path, PathBuf::from("/m/model.bin"));
        assert_eq!(outcome.validation_predictions.len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![(0.5, "epoch 1/2".to_string())]);

        let written = std::fs::read_to_string(dir.path().join("request.json")).unwrap();
        let json: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert_eq!(json["command"], "fit");
        assert_eq!(json["epochs"], 2);
    }

    #[tokio::test]
    async fn test_predict() {
        let dir = tempfile::tempdir().unwrap();
        let fitter = shell(
            dir.path(),
            r#"cat > /dev/null; echo '{"type":"predict","predictions":[{"actual":"glare","predicted":"blur"}]}'"#,
        );
        let predictions = fitter
            .predict(Path::new("/m/model.bin"), &[Sample::new("/x.png", "glare")])
            .await
            .unwrap();
        assert_eq!(predictions[0].predicted, "blur");
    }

    #[tokio::test]
    async fn test_large_request_with_noisy_stderr() {
        let dir = tempfile::tempdir().unwrap();
        // Fills the stderr pipe before touching a request that overflows stdin's.
        let fitter = shell(
            dir.path(),
            r#"head -c 200000 /dev/zero | tr '\0' x >&2
cat > /dev/null
echo '{"type":"predict","predictions":[]}'"#,
        )
        .with_timeout(Duration::from_secs(20));
        let samples: Vec<Sample> = (0..5000)
            .map(|i| Sample::new(format!("/data/damaged/sample_{i:06}.png"), "damaged"))
            .collect();

        let predictions = fitter
            .predict(Path::new("/m/model.bin"), &samples)
            .await
            .unwrap();
        assert!(predictions.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_fitter_error() {
        let dir = tempfile::tempdir().unwrap();
        let fitter = shell(dir.path(), "cat > /dev/null; echo 'cuda missing' >&2; exit 3");
        let err = fitter.fit(request(dir.path()), None).await.unwrap_err();
        assert!(matches!(err, MisreadError::Fitter(ref m) if m.contains("cuda missing")));
    }

    #[tokio::test]
    async fn test_missing_result_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let fitter = shell(dir.path(), "cat > /dev/null; echo hello");
        assert!(fitter.fit(request(dir.path()), None).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let fitter = shell(dir.path(), "sleep 5").with_timeout(Duration::from_millis(100));
        let err = fitter.fit(request(dir.path()), None).await.unwrap_err();
        assert!(matches!(err, MisreadError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let fitter = shell(dir.path(), "sleep 5");
        let req = request(dir.path());
        let token = req.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let err = fitter.fit(req, None).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fitter = CommandFitter::new("definitely-not-a-real-binary", dir.path().to_path_buf());
        assert!(matches!(
            fitter.fit(request(dir.path()), None).await,
            Err(MisreadError::Fitter(_))
        ));
    }
}
