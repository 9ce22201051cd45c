//! `/v2/deploy` (§6.1, §10.6): multipart archive upload streamed to a temp
//! file, handed to `LifecycleOrchestrator::deploy_from_archive`, whose
//! progress/finish events are relayed back over SSE. No object storage is
//! introduced for the upload itself: the temp path is consumed directly
//! and cleaned up by the loader's own `SourceGuard`.

use std::convert::Infallible;
use std::io::Write;

use axum::extract::{Multipart, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use previewctl_types::DeployEvent;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{ApiError, Result};
use crate::state::AppState;

pub async fn deploy(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let mut archive_path = None;
    let mut owner = None;
    let mut repo = None;
    let mut branch = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| ApiError::Validation(e.to_string()))? {
        match field.name().unwrap_or_default() {
            "owner" => owner = Some(field.text().await.map_err(|e| ApiError::Validation(e.to_string()))?),
            "repo" => repo = Some(field.text().await.map_err(|e| ApiError::Validation(e.to_string()))?),
            "branch" => branch = Some(field.text().await.map_err(|e| ApiError::Validation(e.to_string()))?),
            "archive" => {
                let bytes = field.bytes().await.map_err(|e| ApiError::Validation(e.to_string()))?;
                let mut file = tempfile::Builder::new()
                    .suffix(".tar.gz")
                    .tempfile()
                    .map_err(|e| ApiError::Other(e.into()))?;
                file.write_all(&bytes).map_err(|e| ApiError::Other(e.into()))?;
                archive_path = Some(file.into_temp_path().keep().map_err(|e| ApiError::Other(e.into()))?);
            }
            _ => {}
        }
    }

    let archive_path = archive_path.ok_or_else(|| ApiError::Validation("missing `archive` field".to_string()))?;
    let owner = owner.ok_or_else(|| ApiError::Validation("missing `owner` field".to_string()))?;
    let repo = repo.ok_or_else(|| ApiError::Validation("missing `repo` field".to_string()))?;

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<DeployEvent>();
    let orchestrator = state.orchestrator.clone();
    tokio::spawn(async move {
        orchestrator.deploy_from_archive(archive_path, owner, repo, branch, tx).await;
    });

    let events = UnboundedReceiverStream::new(rx).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().event("deploy").data(data))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15))))
}
