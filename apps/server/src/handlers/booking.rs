use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{Datelike, NaiveDate};
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{self, AdmissionError, CancelError, NewReservation};
use crate::error::{api_error, bad_request, conflict, db_error, not_found, ok, ApiError, ApiResult};
use crate::models::*;
use crate::notify;
use crate::slots::{self, DayAvailability, DayInputs};
use crate::AppState;

const SLOT_TAKEN_MSG: &str = "Ese horario ya fue reservado. Por favor elige otro.";

// ── Helpers (pub(crate) for admin handlers) ──

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| bad_request("Formato de fecha inválido (AAAA-MM-DD)"))
}

pub(crate) fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Load everything the resolver needs for `date` and run it.
pub(crate) async fn day_availability(
    state: &AppState,
    date: NaiveDate,
) -> Result<DayAvailability, ApiError> {
    let key = date_key(date);
    let schedule = db::load_schedule(&state.db)
        .await
        .map_err(db_error("load_schedule"))?;
    let vacations = db::list_vacations(&state.db)
        .await
        .map_err(db_error("list_vacations"))?;
    let booked = db::booked_times(&state.db, &key)
        .await
        .map_err(db_error("booked_times"))?;
    let blocked = db::blocked_times(&state.db, &key)
        .await
        .map_err(db_error("blocked_times"))?;

    Ok(slots::resolve_day(
        date,
        &schedule,
        state.config.slot_duration_min,
        DayInputs {
            vacations: vacations.as_slice(),
            booked: booked.as_slice(),
            blocked: blocked.as_slice(),
        },
        state.config.shop_now(),
    ))
}

// ── Endpoints ──

/// GET /api/services — active services in display order.
pub async fn list_services(State(state): State<Arc<AppState>>) -> ApiResult<Vec<Service>> {
    let services = sqlx::query_as::<_, Service>(
        "SELECT id, name, description, price, duration_min, is_active, sort_order
         FROM services WHERE is_active = 1 ORDER BY sort_order ASC",
    )
    .fetch_all(&state.db)
    .await
    .map_err(db_error("list_services"))?;

    ok(services)
}

/// GET /api/availability?date=YYYY-MM-DD — all and bookable slots of a day.
pub async fn availability(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AvailabilityQuery>,
) -> ApiResult<DayAvailability> {
    let date = parse_date(&query.date)?;
    if date < state.config.shop_now().date() {
        return Err(bad_request("La fecha ya pasó"));
    }
    ok(day_availability(&state, date).await?)
}

/// GET /api/calendar?year=2026&month=3 — per-day summary from today onward.
///
/// Reservations and blocks for the whole month come from one query each.
pub async fn calendar(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CalendarQuery>,
) -> ApiResult<Vec<CalendarDay>> {
    let first = NaiveDate::from_ymd_opt(query.year, query.month, 1)
        .ok_or_else(|| bad_request("Mes inválido"))?;
    let days: Vec<NaiveDate> = first
        .iter_days()
        .take_while(|d| d.month() == query.month)
        .collect();
    let (month_start, month_end) = match (days.first(), days.last()) {
        (Some(s), Some(e)) => (date_key(*s), date_key(*e)),
        _ => return ok(Vec::new()),
    };

    let schedule = db::load_schedule(&state.db)
        .await
        .map_err(db_error("load_schedule"))?;
    let vacations = db::list_vacations(&state.db)
        .await
        .map_err(db_error("list_vacations"))?;
    let booked = times_by_date(&state, "reservations", &month_start, &month_end).await?;
    let blocked = times_by_date(&state, "blocked_hours", &month_start, &month_end).await?;

    let now = state.config.shop_now();
    let calendar_days = days
        .into_iter()
        .filter(|d| *d >= now.date())
        .map(|date| {
            let key = date_key(date);
            let day = slots::resolve_day(
                date,
                &schedule,
                state.config.slot_duration_min,
                DayInputs {
                    vacations: vacations.as_slice(),
                    booked: booked.get(&key).map(Vec::as_slice).unwrap_or(&[]),
                    blocked: blocked.get(&key).map(Vec::as_slice).unwrap_or(&[]),
                },
                now,
            );
            CalendarDay {
                date: key,
                closed: day.closed,
                vacation: day.vacation,
                free: day.available.len(),
            }
        })
        .collect();

    ok(calendar_days)
}

async fn times_by_date(
    state: &AppState,
    table: &'static str,
    from: &str,
    to: &str,
) -> Result<HashMap<String, Vec<String>>, ApiError> {
    let sql = format!("SELECT date, time FROM {table} WHERE date BETWEEN ? AND ?");
    let rows = sqlx::query_as::<_, (String, String)>(&sql)
        .bind(from)
        .bind(to)
        .fetch_all(&state.db)
        .await
        .map_err(db_error("times_by_date"))?;

    let mut by_date: HashMap<String, Vec<String>> = HashMap::new();
    for (date, time) in rows {
        by_date.entry(date).or_default().push(time);
    }
    Ok(by_date)
}

/// POST /api/reservations — book one slot.
///
/// The availability checks below only produce friendlier errors; the
/// unique index decides who gets a contested slot.
pub async fn create_reservation(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateReservationRequest>,
) -> ApiResult<Reservation> {
    let date = parse_date(&body.date)?;
    let time = slots::parse_time(&body.time)
        .map(slots::format_time)
        .ok_or_else(|| bad_request("Formato de hora inválido (HH:MM)"))?;
    let customer_name = body.customer_name.trim();
    let customer_phone = body.customer_phone.trim();
    if customer_name.is_empty() || customer_phone.is_empty() {
        return Err(bad_request("Nombre y teléfono son obligatorios"));
    }
    let customer_email = body
        .customer_email
        .as_deref()
        .map(str::trim)
        .filter(|e| !e.is_empty());

    let now = state.config.shop_now();
    if date < now.date() {
        return Err(bad_request("La fecha ya pasó"));
    }

    let service = sqlx::query_as::<_, Service>(
        "SELECT id, name, description, price, duration_min, is_active, sort_order
         FROM services WHERE id = ? AND is_active = 1",
    )
    .bind(body.service_id)
    .fetch_optional(&state.db)
    .await
    .map_err(db_error("create_reservation: service"))?
    .ok_or_else(|| not_found("Servicio no encontrado"))?;

    if db::is_client_blocked(&state.db, customer_phone)
        .await
        .map_err(db_error("create_reservation: client"))?
    {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "No es posible reservar con este contacto. Comunícate con el local.",
        ));
    }

    let day = day_availability(&state, date).await?;
    if day.vacation {
        return Err(conflict("El local está cerrado ese día"));
    }
    if !day.slots.contains(&time) {
        return Err(bad_request("Ese horario no está en la agenda del día"));
    }
    if slots::is_slot_in_past(date, &time, now) {
        return Err(conflict("Ese horario ya pasó"));
    }
    if !day.available.contains(&time) {
        return Err(conflict(SLOT_TAKEN_MSG));
    }

    let key = date_key(date);
    let admitted = db::admit_reservation(
        &state.db,
        &NewReservation {
            date: &key,
            time: &time,
            customer_name,
            customer_phone,
            customer_email,
            service_id: service.id,
            price: service.price,
        },
    )
    .await;

    let id = match admitted {
        Ok(id) => id,
        Err(AdmissionError::SlotTaken { date, time }) => {
            tracing::info!(%date, %time, "lost booking race");
            return Err(conflict(SLOT_TAKEN_MSG));
        }
        Err(AdmissionError::Database(e)) => return Err(db_error("admit_reservation")(e)),
    };

    let mut conn = state
        .db
        .acquire()
        .await
        .map_err(db_error("create_reservation: acquire"))?;
    let reservation = db::fetch_reservation(&mut conn, id)
        .await
        .map_err(db_error("create_reservation: reload"))?
        .ok_or_else(|| {
            tracing::error!("reservation {} vanished right after insert", id);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Error interno")
        })?;

    tracing::info!(id, date = %reservation.date, time = %reservation.time, "reservation created");
    state
        .notifier
        .dispatch(notify::reservation_created(&reservation));

    ok(reservation)
}

/// DELETE /api/reservations/{id}?phone=... — customer cancels a pending
/// reservation before it starts; the slot is freed.
pub async fn cancel_reservation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<CancelReservationQuery>,
) -> ApiResult<&'static str> {
    let now = state.config.shop_now();
    let reservation = match db::cancel_by_customer(&state.db, id, &query.phone, now).await {
        Ok(reservation) => reservation,
        Err(CancelError::NotFound) => return Err(not_found("Reserva no encontrada")),
        Err(CancelError::Settled(status)) => {
            return Err(conflict(format!(
                "La reserva ya está {} y no se puede cancelar",
                status.label()
            )))
        }
        Err(CancelError::Started) => {
            return Err(conflict("La reserva ya comenzó y no se puede cancelar"))
        }
        Err(CancelError::Database(e)) => return Err(db_error("cancel_reservation")(e)),
    };

    tracing::info!(id, "reservation cancelled by customer");
    state
        .notifier
        .dispatch(notify::reservation_cancelled(&reservation, true));

    ok("Reserva cancelada")
}
