use crate::pipeline::orchestrator::{
    get_processing_state, start_processing, PipelineConfig, StartError,
};
use crate::run_context::{list_outputs, list_videos, OutputDescriptor};
use async_stream::stream;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::Stream;
use serde::Serialize;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Shared by every handler.
pub struct AppState {
    pub video_root: PathBuf,
    pub pipeline: PipelineConfig,
}

#[derive(Serialize)]
pub struct VideoInfo {
    pub name: String,
    pub path: String,
}

#[derive(serde::Deserialize)]
pub struct CreateRunRequest {
    pub video_path: String,
}

pub async fn get_videos(State(state): State<Arc<AppState>>) -> Json<Vec<VideoInfo>> {
    let videos = list_videos(&state.video_root);

    let info_list = videos
        .into_iter()
        .map(|video_path| {
            let name = video_path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("unknown")
                .to_string();
            VideoInfo {
                name,
                path: video_path.to_string_lossy().to_string(),
            }
        })
        .collect();

    Json(info_list)
}

pub async fn get_outputs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OutputDescriptor>>, StatusCode> {
    list_outputs(&state.pipeline.output_root)
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to list outputs: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

pub async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRunRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let video_path = PathBuf::from(&payload.video_path);
    match start_processing(video_path, state.pipeline.clone()) {
        Ok(run) => Ok(Json(run.to_status_json())),
        Err(e @ StartError::Busy(_)) => Err((StatusCode::CONFLICT, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

pub async fn get_run(Path(run_id): Path<String>) -> Result<Json<serde_json::Value>, StatusCode> {
    get_processing_state(&run_id)
        .map(|run| Json(run.to_status_json()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// Streams progress until the run ends, then a single `outcome` event.
pub async fn run_events(
    Path(run_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let run = get_processing_state(&run_id).ok_or(StatusCode::NOT_FOUND)?;

    let events = stream! {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        loop {
            ticker.tick().await;
            match run.outcome() {
                Some(outcome) => {
                    let data = serde_json::to_string(&outcome).unwrap_or_default();
                    yield Ok(Event::default().event("outcome").data(data));
                    break;
                }
                None => {
                    yield Ok(Event::default()
                        .event("progress")
                        .data(run.to_status_json().to_string()));
                }
            }
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_context::OUTPUT_RELATIVE_PATH;
    use chrono::{TimeZone, Utc};

    fn app_state(root: &std::path::Path) -> Arc<AppState> {
        Arc::new(AppState {
            video_root: root.join("videos"),
            pipeline: PipelineConfig::new(root.join("models"), root.join("media")),
        })
    }

    #[tokio::test]
    async fn test_videos_and_outputs_are_listed() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("videos")).unwrap();
        std::fs::write(root.path().join("videos/walk.mp4"), b"").unwrap();
        std::fs::create_dir_all(root.path().join("media").join(OUTPUT_RELATIVE_PATH)).unwrap();
        let descriptor = OutputDescriptor::new(
            &root.path().join("media"),
            Utc.timestamp_millis_opt(5_000).unwrap(),
        );
        descriptor.write_sidecar().unwrap();

        let state = app_state(root.path());
        let Json(videos) = get_videos(State(state.clone())).await;
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].name, "walk.mp4");

        let Json(outputs) = get_outputs(State(state)).await.unwrap();
        assert_eq!(outputs, vec![descriptor]);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let result = get_run(Path("no-such-run".to_string())).await;
        assert_eq!(result.err(), Some(StatusCode::NOT_FOUND));

        let events = run_events(Path("no-such-run".to_string())).await;
        assert_eq!(events.err(), Some(StatusCode::NOT_FOUND));
    }
}
