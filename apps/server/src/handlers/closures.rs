//! Admin endpoints that close time: blocked hours, vacations and the
//! weekly schedule itself.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::NaiveDateTime;
use sqlx::SqlitePool;
use std::sync::Arc;

use super::booking::{date_key, parse_date};
use crate::auth::require_admin;
use crate::db;
use crate::error::{bad_request, conflict, db_error, not_found, ok, ApiResult};
use crate::models::*;
use crate::slots::{self, VacationBlock, WeeklySchedule};
use crate::AppState;

/// Reason recorded on automatic past-slot blocks.
pub const PAST_REASON: &str = "past";

// ── Past-slot sweep ──

/// Block today's unbooked slots that have already started. Returns the
/// times newly blocked. Idempotent.
pub async fn block_past_slots(
    pool: &SqlitePool,
    slot_duration_min: u32,
    now: NaiveDateTime,
) -> Result<Vec<String>, sqlx::Error> {
    let today = now.date();
    let key = date_key(today);

    if slots::is_date_fully_blocked(today, &db::list_vacations(pool).await?) {
        return Ok(Vec::new());
    }
    let schedule = db::load_schedule(pool).await?;
    let all = slots::generate_day_slots(today, &schedule, slot_duration_min);
    let booked = db::booked_times(pool, &key).await?;
    let unbooked = slots::resolve_available_slots(&all, &booked, &[] as &[&str]);

    let mut newly_blocked = Vec::new();
    for time in unbooked
        .into_iter()
        .filter(|t| slots::is_slot_in_past(today, t, now))
    {
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO blocked_hours (date, time, reason) VALUES (?, ?, ?)",
        )
        .bind(&key)
        .bind(&time)
        .bind(PAST_REASON)
        .execute(pool)
        .await?;
        if inserted.rows_affected() > 0 {
            newly_blocked.push(time);
        }
    }

    if !newly_blocked.is_empty() {
        tracing::info!(date = %key, count = newly_blocked.len(), "blocked past slots");
    }
    Ok(newly_blocked)
}

/// POST /api/admin/blocked-hours/past — run the past-slot sweep now.
pub async fn sweep_past_slots(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<PastSweepResponse> {
    require_admin(&headers, &state).await?;

    let now = state.config.shop_now();
    let blocked = block_past_slots(&state.db, state.config.slot_duration_min, now)
        .await
        .map_err(db_error("block_past_slots"))?;

    ok(PastSweepResponse {
        date: date_key(now.date()),
        blocked,
    })
}

// ── Blocked hours ──

/// GET /api/admin/blocked-hours?date=YYYY-MM-DD — by date, or upcoming.
pub async fn list_blocked_hours(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<BlockedHoursQuery>,
) -> ApiResult<Vec<BlockedHour>> {
    require_admin(&headers, &state).await?;

    let rows = match &query.date {
        Some(raw) => {
            let date = date_key(parse_date(raw)?);
            sqlx::query_as::<_, BlockedHour>(
                "SELECT id, date, time, reason, created_at FROM blocked_hours
                 WHERE date = ? ORDER BY time ASC",
            )
            .bind(date)
            .fetch_all(&state.db)
            .await
        }
        None => {
            sqlx::query_as::<_, BlockedHour>(
                "SELECT id, date, time, reason, created_at FROM blocked_hours
                 WHERE date >= ? ORDER BY date ASC, time ASC",
            )
            .bind(date_key(state.config.shop_now().date()))
            .fetch_all(&state.db)
            .await
        }
    }
    .map_err(db_error("list_blocked_hours"))?;

    ok(rows)
}

/// POST /api/admin/blocked-hours — block one slot by hand.
pub async fn create_blocked_hour(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBlockedHourRequest>,
) -> ApiResult<BlockedHour> {
    require_admin(&headers, &state).await?;

    let date = date_key(parse_date(&body.date)?);
    let time = slots::parse_time(&body.time)
        .map(slots::format_time)
        .ok_or_else(|| bad_request("Formato de hora inválido (HH:MM)"))?;
    let reason = body
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("bloqueado manualmente");

    let booked = db::booked_times(&state.db, &date)
        .await
        .map_err(db_error("create_blocked_hour: booked"))?;
    if booked.iter().any(|t| slots::normalize_time(t) == time) {
        return Err(conflict(
            "Hay una reserva en ese horario. Cancélala antes de bloquearlo.",
        ));
    }

    let inserted = sqlx::query("INSERT INTO blocked_hours (date, time, reason) VALUES (?, ?, ?)")
        .bind(&date)
        .bind(&time)
        .bind(reason)
        .execute(&state.db)
        .await;
    let id = match inserted {
        Ok(result) => result.last_insert_rowid(),
        Err(e) if db::is_unique_violation(&e) => {
            return Err(conflict("Ese horario ya está bloqueado"))
        }
        Err(e) => return Err(db_error("create_blocked_hour")(e)),
    };

    let row = sqlx::query_as::<_, BlockedHour>(
        "SELECT id, date, time, reason, created_at FROM blocked_hours WHERE id = ?",
    )
    .bind(id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error("create_blocked_hour: reload"))?;

    tracing::info!(%date, %time, "hour blocked");
    ok(row)
}

/// DELETE /api/admin/blocked-hours/{id}
pub async fn delete_blocked_hour(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<&'static str> {
    require_admin(&headers, &state).await?;

    let deleted = sqlx::query("DELETE FROM blocked_hours WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await
        .map_err(db_error("delete_blocked_hour"))?;
    if deleted.rows_affected() == 0 {
        return Err(not_found("Bloqueo no encontrado"));
    }

    ok("Horario desbloqueado")
}

// ── Vacations ──

/// GET /api/admin/vacations
pub async fn list_vacations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<VacationBlock>> {
    require_admin(&headers, &state).await?;

    let vacations = db::list_vacations(&state.db)
        .await
        .map_err(db_error("list_vacations"))?;
    ok(vacations)
}

/// POST /api/admin/vacations — close an inclusive range of days.
pub async fn create_vacation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateVacationRequest>,
) -> ApiResult<VacationBlock> {
    require_admin(&headers, &state).await?;

    let start_date = parse_date(&body.start_date)?;
    let end_date = parse_date(&body.end_date)?;
    if start_date > end_date {
        return Err(bad_request("La fecha de inicio debe ser anterior o igual a la de fin"));
    }
    let reason = body.reason.unwrap_or_default().trim().to_string();

    let id = sqlx::query("INSERT INTO vacations (start_date, end_date, reason) VALUES (?, ?, ?)")
        .bind(start_date)
        .bind(end_date)
        .bind(&reason)
        .execute(&state.db)
        .await
        .map_err(db_error("create_vacation"))?
        .last_insert_rowid();

    let booked: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM reservations WHERE date BETWEEN ? AND ?")
            .bind(date_key(start_date))
            .bind(date_key(end_date))
            .fetch_one(&state.db)
            .await
            .map_err(db_error("create_vacation: overlap"))?;
    if booked > 0 {
        tracing::warn!(
            id,
            booked,
            "vacation overlaps existing reservations; they are kept"
        );
    }

    ok(VacationBlock {
        id,
        start_date,
        end_date,
        reason,
    })
}

/// DELETE /api/admin/vacations/{id}
pub async fn delete_vacation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<&'static str> {
    require_admin(&headers, &state).await?;

    let deleted = sqlx::query("DELETE FROM vacations WHERE id = ?")
        .bind(id)
        .execute(&state.db)
        .await
        .map_err(db_error("delete_vacation"))?;
    if deleted.rows_affected() == 0 {
        return Err(not_found("Vacaciones no encontradas"));
    }

    ok("Vacaciones eliminadas")
}

// ── Weekly schedule ──

/// GET /api/admin/schedule
pub async fn get_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<ScheduleResponse> {
    require_admin(&headers, &state).await?;

    let days = db::load_schedule(&state.db)
        .await
        .map_err(db_error("load_schedule"))?;
    ok(ScheduleResponse {
        slot_duration_min: state.config.slot_duration_min,
        days,
    })
}

/// PUT /api/admin/schedule — replace the weekly schedule after validation.
pub async fn update_schedule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(schedule): Json<WeeklySchedule>,
) -> ApiResult<ScheduleResponse> {
    let admin = require_admin(&headers, &state).await?;

    schedule
        .validate()
        .map_err(|e| bad_request(format!("Horario inválido: {e}")))?;
    db::save_schedule(&state.db, &schedule)
        .await
        .map_err(db_error("save_schedule"))?;

    tracing::info!(admin = admin.user.id, "weekly schedule updated");
    ok(ScheduleResponse {
        slot_duration_min: state.config.slot_duration_min,
        days: schedule,
    })
}
