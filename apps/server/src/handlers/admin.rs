use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use super::booking::{date_key, parse_date};
use crate::auth::{require_admin, require_owner};
use crate::db::{self, StatusOutcome};
use crate::error::{api_error, bad_request, conflict, db_error, not_found, ok, ApiResult};
use crate::models::*;
use crate::notify;
use crate::AppState;

const SERVICE_SELECT: &str =
    "SELECT id, name, description, price, duration_min, is_active, sort_order FROM services";

// ── Services ──

/// GET /api/admin/services — every service, including inactive ones.
pub async fn list_all_services(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<Service>> {
    require_admin(&headers, &state).await?;

    let sql = format!("{SERVICE_SELECT} ORDER BY sort_order ASC, id ASC");
    let services = sqlx::query_as::<_, Service>(&sql)
        .fetch_all(&state.db)
        .await
        .map_err(db_error("list_all_services"))?;

    ok(services)
}

/// POST /api/admin/services
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateServiceRequest>,
) -> ApiResult<Service> {
    require_admin(&headers, &state).await?;

    let name = body.name.trim();
    if name.is_empty() {
        return Err(bad_request("El nombre es obligatorio"));
    }
    if body.price < 0 || body.duration_min <= 0 {
        return Err(bad_request("Precio o duración inválidos"));
    }

    let id = sqlx::query(
        "INSERT INTO services (name, description, price, duration_min, sort_order)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(body.description.as_deref().unwrap_or("").trim())
    .bind(body.price)
    .bind(body.duration_min)
    .bind(body.sort_order.unwrap_or(0))
    .execute(&state.db)
    .await
    .map_err(db_error("create_service"))?
    .last_insert_rowid();

    let sql = format!("{SERVICE_SELECT} WHERE id = ?");
    let service = sqlx::query_as::<_, Service>(&sql)
        .bind(id)
        .fetch_one(&state.db)
        .await
        .map_err(db_error("create_service: reload"))?;

    tracing::info!(id, name = %service.name, "service created");
    ok(service)
}

/// PUT /api/admin/services/{id} — partial update; absent fields are kept.
pub async fn update_service(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateServiceRequest>,
) -> ApiResult<Service> {
    require_admin(&headers, &state).await?;

    let name = body.name.as_deref().map(str::trim);
    if name.is_some_and(str::is_empty) {
        return Err(bad_request("El nombre es obligatorio"));
    }
    if body.price.is_some_and(|p| p < 0) || body.duration_min.is_some_and(|d| d <= 0) {
        return Err(bad_request("Precio o duración inválidos"));
    }

    let updated = sqlx::query(
        "UPDATE services SET
            name = COALESCE(?, name),
            description = COALESCE(?, description),
            price = COALESCE(?, price),
            duration_min = COALESCE(?, duration_min),
            is_active = COALESCE(?, is_active),
            sort_order = COALESCE(?, sort_order)
         WHERE id = ?",
    )
    .bind(name)
    .bind(body.description.as_deref().map(str::trim))
    .bind(body.price)
    .bind(body.duration_min)
    .bind(body.is_active)
    .bind(body.sort_order)
    .bind(id)
    .execute(&state.db)
    .await
    .map_err(db_error("update_service"))?;
    if updated.rows_affected() == 0 {
        return Err(not_found("Servicio no encontrado"));
    }

    let sql = format!("{SERVICE_SELECT} WHERE id = ?");
    let service = sqlx::query_as::<_, Service>(&sql)
        .bind(id)
        .fetch_one(&state.db)
        .await
        .map_err(db_error("update_service: reload"))?;

    ok(service)
}

// ── Reservations ──

/// GET /api/admin/reservations?date=... | ?from=...&to=... — upcoming by default.
pub async fn list_reservations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ReservationsQuery>,
) -> ApiResult<Vec<Reservation>> {
    require_admin(&headers, &state).await?;

    let order = "ORDER BY r.date ASC, r.time ASC";
    let reservations = if let Some(raw) = &query.date {
        let date = date_key(parse_date(raw)?);
        let sql = format!("{} WHERE r.date = ? {order}", db::RESERVATION_SELECT);
        sqlx::query_as::<_, Reservation>(&sql)
            .bind(date)
            .fetch_all(&state.db)
            .await
    } else if let (Some(from), Some(to)) = (&query.from, &query.to) {
        let (from, to) = (parse_date(from)?, parse_date(to)?);
        if from > to {
            return Err(bad_request("Rango de fechas inválido"));
        }
        let sql = format!(
            "{} WHERE r.date BETWEEN ? AND ? {order}",
            db::RESERVATION_SELECT
        );
        sqlx::query_as::<_, Reservation>(&sql)
            .bind(date_key(from))
            .bind(date_key(to))
            .fetch_all(&state.db)
            .await
    } else {
        let sql = format!("{} WHERE r.date >= ? {order}", db::RESERVATION_SELECT);
        sqlx::query_as::<_, Reservation>(&sql)
            .bind(date_key(state.config.shop_now().date()))
            .fetch_all(&state.db)
            .await
    }
    .map_err(db_error("list_reservations"))?;

    ok(reservations)
}

/// PUT /api/admin/reservations/{id}/status — record the outcome of a visit.
///
/// Moving a reservation to `cancelled` removes it and frees the slot.
pub async fn update_reservation_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<UpdateStatusRequest>,
) -> ApiResult<Option<Reservation>> {
    let admin = require_admin(&headers, &state).await?;

    let outcome = db::update_reservation_status(&state.db, id, body.status)
        .await
        .map_err(db_error("update_reservation_status"))?
        .ok_or_else(|| not_found("Reserva no encontrada"))?;

    match outcome {
        StatusOutcome::Updated { reservation, from } => {
            tracing::info!(id, admin = admin.user.id, ?from, to = ?reservation.status, "status changed");
            if from != reservation.status {
                state
                    .notifier
                    .dispatch(notify::status_changed(&reservation, from));
            }
            ok(Some(reservation))
        }
        StatusOutcome::Cancelled(reservation) => {
            tracing::info!(id, admin = admin.user.id, "reservation cancelled by admin");
            state
                .notifier
                .dispatch(notify::reservation_cancelled(&reservation, false));
            ok(None)
        }
    }
}

/// DELETE /api/admin/reservations/{id} — the shop cancels a reservation.
pub async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<&'static str> {
    let admin = require_admin(&headers, &state).await?;

    let reservation = db::cancel_reservation(&state.db, id)
        .await
        .map_err(db_error("admin cancel_reservation"))?
        .ok_or_else(|| not_found("Reserva no encontrada"))?;

    tracing::info!(id, admin = admin.user.id, "reservation cancelled by admin");
    state
        .notifier
        .dispatch(notify::reservation_cancelled(&reservation, false));

    ok("Reserva cancelada")
}

// ── Clients ──

/// GET /api/admin/clients — most recent visitors first.
pub async fn list_clients(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<Client>> {
    require_admin(&headers, &state).await?;

    let clients = sqlx::query_as::<_, Client>(
        "SELECT phone, name, email, total_appointments, completed, attended_with_notice,
                no_shows, cancelled, is_blocked, last_visit
         FROM clients ORDER BY last_visit DESC, name ASC",
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_error("list_clients"))?;

    ok(clients)
}

/// PUT /api/admin/clients/{phone}/block — block or unblock a contact.
pub async fn set_client_blocked(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(phone): Path<String>,
    Json(body): Json<BlockClientRequest>,
) -> ApiResult<&'static str> {
    let admin = require_admin(&headers, &state).await?;

    let updated = sqlx::query("UPDATE clients SET is_blocked = ? WHERE phone = ?")
        .bind(body.blocked)
        .bind(phone.trim())
        .execute(&state.db)
        .await
        .map_err(db_error("set_client_blocked"))?;
    if updated.rows_affected() == 0 {
        return Err(not_found("Cliente no encontrado"));
    }

    tracing::info!(admin = admin.user.id, blocked = body.blocked, "client block flag changed");
    ok(if body.blocked {
        "Cliente bloqueado"
    } else {
        "Cliente desbloqueado"
    })
}

// ── Admin roles ──

/// GET /api/admin/roles
pub async fn list_admins(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<AdminMember>> {
    require_admin(&headers, &state).await?;

    let members = sqlx::query_as::<_, AdminMember>(
        "SELECT tg_id, role, added_at FROM admin_roles ORDER BY role DESC, added_at ASC",
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_error("list_admins"))?;

    ok(members)
}

/// POST /api/admin/roles — owner grants admin access.
pub async fn add_admin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AddAdminRequest>,
) -> ApiResult<AdminMember> {
    let owner = require_owner(&headers, &state).await?;

    if body.tg_id <= 0 {
        return Err(bad_request("ID de Telegram inválido"));
    }

    let inserted = sqlx::query("INSERT INTO admin_roles (tg_id, role) VALUES (?, 'admin')")
        .bind(body.tg_id)
        .execute(&state.db)
        .await;
    match inserted {
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            return Err(conflict("Ese usuario ya es administrador"))
        }
        Err(e) => return Err(db_error("add_admin")(e)),
    }

    let member = sqlx::query_as::<_, AdminMember>(
        "SELECT tg_id, role, added_at FROM admin_roles WHERE tg_id = ?",
    )
    .bind(body.tg_id)
    .fetch_one(&state.db)
    .await
    .map_err(db_error("add_admin: reload"))?;

    tracing::info!(owner = owner.user.id, tg_id = body.tg_id, "admin added");
    ok(member)
}

/// DELETE /api/admin/roles/{tg_id} — owner revokes admin access.
pub async fn remove_admin(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(tg_id): Path<i64>,
) -> ApiResult<&'static str> {
    let owner = require_owner(&headers, &state).await?;

    let deleted = sqlx::query("DELETE FROM admin_roles WHERE tg_id = ? AND role != 'owner'")
        .bind(tg_id)
        .execute(&state.db)
        .await
        .map_err(db_error("remove_admin"))?;
    if deleted.rows_affected() == 0 {
        return Err(match db::admin_role(&state.db, tg_id).await {
            Ok(Some(AdminRole::Owner)) => {
                api_error(StatusCode::FORBIDDEN, "No se puede quitar al dueño")
            }
            Ok(_) => not_found("Administrador no encontrado"),
            Err(e) => db_error("remove_admin: role")(e),
        });
    }

    tracing::info!(owner = owner.user.id, tg_id, "admin removed");
    ok("Administrador eliminado")
}
