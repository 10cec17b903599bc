use crate::{auth::auth, models::{DiagnosticsResponse, ErrorResponse, Permissions}, AppState};
use axum::{extract::{State, Extension}, http::StatusCode, Json};
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::info;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Report room, connection and host statistics
pub async fn diagnostics(
    State(state): State<AppState>,
    Extension(permissions): Extension<Permissions>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {

    auth::ensure_permission(&permissions, "diagnostics", "read")?;

    // Aggregate diagnostics from the registry
    let mut n_conn: u32 = 0;
    let mut n_rooms: u32 = 0;
    let mut n_doc_rooms: u32 = 0;
    let mut n_transient_rooms: u32 = 0;
    let mut n_dirty_docs: u32 = 0;
    let mut n_loading_rooms: u32 = 0;
    for (_, room) in state.hub.registry.snapshot() {
        n_rooms += 1;
        n_conn += room.client_count() as u32;
        match room.as_document() {
            Some(doc_room) => {
                n_doc_rooms += 1;
                if !doc_room.is_ready() {
                    n_loading_rooms += 1;
                } else if doc_room.document.dirty() {
                    n_dirty_docs += 1;
                }
            }
            None => n_transient_rooms += 1,
        }
    }

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| {
            Mutex::new(System::new_all())
        });
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0)
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Rooms: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        n_conn,
        n_rooms
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            n_conn,
            n_rooms,
            n_doc_rooms,
            n_transient_rooms,
            n_dirty_docs,
            n_loading_rooms,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
