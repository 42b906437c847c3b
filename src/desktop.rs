//! Tauri plugin exposing the batch converter to a webview front end.
//!
//! Register with `tauri::Builder::default().plugin(gifbatch::desktop::init())`.
//! Batch events are emitted app-wide under their kebab-case names.

use crate::batch::{self, BatchEvent, BatchOrchestrator, BatchSummary, EventSink};
use crate::ffmpeg::{ExecutablePaths, TokioProcessRunner};
use crate::probe::{probe, VideoInfo};
use crate::settings::ConversionSettings;
use crate::thumbnail::{extract_thumbnail, Thumbnail, DEFAULT_THUMBNAIL_WIDTH};
use std::path::PathBuf;
use tauri::plugin::{Builder, TauriPlugin};
use tauri::{AppHandle, Emitter, Manager, Runtime, State};
use tracing::warn;

type Orchestrator = BatchOrchestrator<TokioProcessRunner>;

struct TauriSink<R: Runtime> {
    app: AppHandle<R>,
}

impl<R: Runtime> EventSink for TauriSink<R> {
    fn emit(&self, event: BatchEvent) {
        if let Err(e) = self.app.emit(event.name(), &event) {
            warn!(event = event.name(), error = %e, "failed to emit batch event");
        }
    }
}

#[tauri::command]
async fn get_file_size(path: String) -> Result<u64, String> {
    tokio::fs::metadata(&path)
        .await
        .map(|m| m.len())
        .map_err(|e| e.to_string())
}

#[tauri::command]
async fn probe_video(state: State<'_, Orchestrator>, path: String) -> Result<VideoInfo, String> {
    Ok(probe(state.runner(), state.paths(), &PathBuf::from(path)).await)
}

#[tauri::command]
async fn generate_thumbnail(
    state: State<'_, Orchestrator>,
    path: String,
    width: Option<u32>,
) -> Result<Thumbnail, String> {
    extract_thumbnail(
        state.runner(),
        state.paths(),
        &PathBuf::from(path),
        width.unwrap_or(DEFAULT_THUMBNAIL_WIDTH),
    )
    .await
    .map_err(|e| e.to_string())
}

#[tauri::command]
async fn check_dependencies(state: State<'_, Orchestrator>) -> Result<Vec<PathBuf>, String> {
    Ok(state.paths().check(state.runner()).await)
}

/// Outputs that already exist; the front end asks the user before
/// starting the batch with `overwrite: true`.
#[tauri::command]
fn find_conflicts(files: Vec<PathBuf>, settings: ConversionSettings) -> Vec<PathBuf> {
    batch::find_conflicts(&files, &settings)
}

#[tauri::command]
async fn start_batch<R: Runtime>(
    app: AppHandle<R>,
    state: State<'_, Orchestrator>,
    files: Vec<PathBuf>,
    settings: ConversionSettings,
    overwrite: bool,
) -> Result<BatchSummary, String> {
    let sink = TauriSink { app };
    Ok(state
        .run_batch(files, &settings, &sink, move |_| async move { overwrite })
        .await)
}

#[tauri::command]
fn cancel_batch(state: State<'_, Orchestrator>) {
    state.cancel();
}

pub fn init<R: Runtime>() -> TauriPlugin<R> {
    Builder::new("gifbatch")
        .invoke_handler(tauri::generate_handler![
            get_file_size,
            probe_video,
            generate_thumbnail,
            check_dependencies,
            find_conflicts,
            start_batch,
            cancel_batch
        ])
        .setup(|app, _api| {
            let resource_dir = app.path().resource_dir().ok();
            let paths = ExecutablePaths::resolve(resource_dir.as_deref());
            app.manage(Orchestrator::new(TokioProcessRunner, paths));
            Ok(())
        })
        .build()
}
