//! Stage processors backed by an external model service.
//!
//! Each stage posts to `{base_url}/v1/{stage}` with a JSON body carrying the
//! audio it works on as base64 and maps the JSON response to the stage's
//! result.

use super::models::{InstrumentTag, Stage, StageError, StageErrorKind, StageOutput};
use super::processor::{ProcessorContext, StageInput, StageProcessor};
use crate::storage::{ArtifactHandle, StorageError};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RemoteProcessorError {
    #[error("Request timed out")]
    Timeout,

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Model service returned {status}: {body}")]
    Api { status: StatusCode, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Stage {0} is not served by the model service")]
    UnsupportedStage(Stage),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Error kind for a non-success HTTP status from the model service.
pub fn classify_status(status: StatusCode) -> StageErrorKind {
    match status.as_u16() {
        408 | 504 => StageErrorKind::Timeout,
        429 | 507 => StageErrorKind::ResourceExhausted,
        502 | 503 => StageErrorKind::ModelUnavailable,
        400 | 422 => StageErrorKind::MalformedInput,
        415 => StageErrorKind::UnsupportedCodec,
        _ => StageErrorKind::ModelUnavailable,
    }
}

impl From<RemoteProcessorError> for StageError {
    fn from(error: RemoteProcessorError) -> Self {
        let kind = match &error {
            RemoteProcessorError::Timeout | RemoteProcessorError::Cancelled => {
                StageErrorKind::Timeout
            }
            RemoteProcessorError::Connection(_) | RemoteProcessorError::InvalidResponse(_) => {
                StageErrorKind::ModelUnavailable
            }
            RemoteProcessorError::Api { status, .. } => classify_status(*status),
            RemoteProcessorError::Storage(StorageError::Closed) => StageErrorKind::Timeout,
            RemoteProcessorError::Storage(StorageError::Io(_)) => {
                StageErrorKind::ResourceExhausted
            }
            RemoteProcessorError::Storage(_)
            | RemoteProcessorError::UnsupportedStage(_)
            | RemoteProcessorError::Client(_) => StageErrorKind::Internal,
        };
        StageError::new(kind, error.to_string())
    }
}

fn transport_error(error: reqwest::Error) -> RemoteProcessorError {
    if error.is_timeout() {
        RemoteProcessorError::Timeout
    } else {
        RemoteProcessorError::Connection(error.to_string())
    }
}

/// Read an input artifact, reporting a missing one as `missing_kind`.
fn read_input(
    ctx: &ProcessorContext,
    handle: &ArtifactHandle,
    missing_kind: StageErrorKind,
) -> Result<String, StageError> {
    match ctx.artifacts.get(handle) {
        Ok(bytes) => Ok(STANDARD.encode(bytes)),
        Err(StorageError::NotFound(_)) | Err(StorageError::InvalidHandle(_)) => Err(
            StageError::new(missing_kind, format!("Input {} is missing", handle)),
        ),
        Err(e) => Err(RemoteProcessorError::from(e).into()),
    }
}

#[derive(Debug, Serialize)]
struct ModelRequest<'a> {
    job_id: &'a str,
    attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    stems: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<&'a BTreeMap<Stage, StageOutput>>,
}

#[derive(Debug, Deserialize)]
struct SeparationResponse {
    stems: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TaggingResponse {
    tags: Vec<InstrumentTag>,
}

#[derive(Debug, Deserialize)]
struct TempoKeyResponse {
    bpm: f32,
    key: String,
    confidence: f32,
}

#[derive(Debug, Deserialize)]
struct ReportResponse {
    report: String,
}

/// Runs SEPARATION, TAGGING, TEMPO_KEY or REPORT on the model service.
///
/// Processors run on blocking threads, so requests are driven to completion
/// on the runtime through `Handle::block_on`.
pub struct RemoteModelProcessor {
    stage: Stage,
    client: Client,
    base_url: String,
    runtime: Handle,
}

impl RemoteModelProcessor {
    pub fn new(
        stage: Stage,
        base_url: impl Into<String>,
        request_timeout: Duration,
        runtime: Handle,
    ) -> Result<Self, RemoteProcessorError> {
        if stage == Stage::FingerprintMatch {
            return Err(RemoteProcessorError::UnsupportedStage(stage));
        }
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            stage,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            runtime,
        })
    }

    /// One processor per stage served by the model service.
    pub fn for_all_stages(
        base_url: &str,
        request_timeout: Duration,
        runtime: Handle,
    ) -> Result<Vec<Self>, RemoteProcessorError> {
        Stage::ALL
            .iter()
            .filter(|stage| **stage != Stage::FingerprintMatch)
            .map(|stage| Self::new(*stage, base_url, request_timeout, runtime.clone()))
            .collect()
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1/{}",
            self.base_url,
            self.stage.as_str().to_ascii_lowercase()
        )
    }

    fn build_request<'a>(
        &self,
        ctx: &ProcessorContext,
        input: &'a StageInput,
    ) -> Result<ModelRequest<'a>, StageError> {
        let mut request = ModelRequest {
            job_id: &input.job_id,
            attempt: input.attempt,
            audio: None,
            stems: BTreeMap::new(),
            results: None,
        };
        match self.stage {
            Stage::Separation => {
                request.audio = Some(read_input(
                    ctx,
                    &input.upload,
                    StageErrorKind::MalformedInput,
                )?);
            }
            Stage::Tagging | Stage::TempoKey => {
                let stems = input.stems().ok_or_else(|| {
                    StageError::new(StageErrorKind::Internal, "Separation result is missing")
                })?;
                for (name, handle) in stems {
                    request.stems.insert(
                        name.clone(),
                        read_input(ctx, handle, StageErrorKind::CorruptedStem)?,
                    );
                }
            }
            Stage::Report => request.results = Some(&input.prior),
            Stage::FingerprintMatch => {
                return Err(RemoteProcessorError::UnsupportedStage(self.stage).into())
            }
        }
        Ok(request)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        request: &ModelRequest<'_>,
    ) -> Result<T, RemoteProcessorError> {
        let response = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Model service returned {} for {} of job {}",
                status, self.stage, request.job_id
            );
            return Err(RemoteProcessorError::Api { status, body });
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                RemoteProcessorError::Timeout
            } else {
                RemoteProcessorError::InvalidResponse(e.to_string())
            }
        })
    }

    async fn call(
        &self,
        ctx: &ProcessorContext,
        request: &ModelRequest<'_>,
    ) -> Result<StageOutput, RemoteProcessorError> {
        match self.stage {
            Stage::Separation => {
                let response: SeparationResponse = self.post(request).await?;
                if response.stems.is_empty() {
                    return Err(RemoteProcessorError::InvalidResponse(
                        "no stems returned".to_string(),
                    ));
                }
                let mut stems = BTreeMap::new();
                for (name, encoded) in response.stems {
                    let bytes = STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                        RemoteProcessorError::InvalidResponse(format!("stem {}: {}", name, e))
                    })?;
                    stems.insert(name, ctx.artifacts.put(&bytes)?);
                }
                Ok(StageOutput::Separation { stems })
            }
            Stage::Tagging => {
                let response: TaggingResponse = self.post(request).await?;
                Ok(StageOutput::Tagging {
                    tags: response.tags,
                })
            }
            Stage::TempoKey => {
                let response: TempoKeyResponse = self.post(request).await?;
                if !(response.bpm.is_finite() && response.bpm > 0.0) {
                    return Err(RemoteProcessorError::InvalidResponse(format!(
                        "bpm {}",
                        response.bpm
                    )));
                }
                Ok(StageOutput::TempoKey {
                    bpm: response.bpm,
                    key: response.key,
                    confidence: response.confidence,
                })
            }
            Stage::Report => {
                let response: ReportResponse = self.post(request).await?;
                let report = ctx.artifacts.put(response.report.as_bytes())?;
                Ok(StageOutput::Report { report })
            }
            Stage::FingerprintMatch => Err(RemoteProcessorError::UnsupportedStage(self.stage)),
        }
    }
}

impl StageProcessor for RemoteModelProcessor {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn process(&self, ctx: &ProcessorContext, input: &StageInput) -> Result<StageOutput, StageError> {
        let request = self.build_request(ctx, input)?;
        debug!(
            "Calling model service for {} of job {} (attempt {})",
            self.stage, input.job_id, input.attempt
        );

        let token = ctx.cancellation_token.clone();
        let result = self.runtime.block_on(async {
            tokio::select! {
                _ = token.cancelled() => Err(RemoteProcessorError::Cancelled),
                result = self.call(ctx, &request) => result,
            }
        });
        Ok(result?)
    }
}
