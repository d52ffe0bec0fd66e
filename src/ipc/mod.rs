pub mod commands;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TrackerError;
use crate::tracker::OvenTracker;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// One line from the operator interface.
#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub command: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct Response {
    pub id: Value,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    fn success(id: Value, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(id: Value, err: &TrackerError) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Handles a single request line.
pub async fn handle_line(tracker: &OvenTracker, line: &str) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            let err = TrackerError::invalid(format!("malformed request: {err}"));
            return Response::failure(Value::Null, &err);
        }
    };

    log_debug!("ipc command {}", request.command);
    match commands::dispatch(tracker, &request.command, request.args).await {
        Ok(data) => Response::success(request.id, data),
        Err(err) => {
            log_warn!("{} failed: {err}", request.command);
            Response::failure(request.id, &err)
        }
    }
}

/// Answers newline-delimited JSON requests until `input` reaches EOF.
pub async fn serve<R, W>(tracker: &OvenTracker, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await.context("failed to read request")? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(tracker, &line).await;
        let mut encoded = serde_json::to_vec(&response)?;
        encoded.push(b'\n');
        output
            .write_all(&encoded)
            .await
            .context("failed to write response")?;
        output.flush().await?;
    }
    log_info!("request stream closed");
    Ok(())
}
