use chrono::{NaiveDate, NaiveDateTime};
use sqlx::{SqliteConnection, SqlitePool};

use crate::clients::{ClientCounters, ReservationEvent};
use crate::models::{AdminRole, Reservation, ReservationStatus};
use crate::slots::{self, TimeBlock, VacationBlock, WeeklySchedule};

// ── Migrations ──

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    // WAL for concurrent readers while a booking writes
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    if !is_applied(pool, "001_init").await? {
        let migration_sql = include_str!("../migrations/001_init.sql");
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(pool).await?;
            }
        }
        mark_applied(pool, "001_init").await?;
    }

    if !is_applied(pool, "002_seed").await? {
        sqlx::query(
            "INSERT INTO services (name, description, price, duration_min, sort_order) VALUES
                ('Corte de pelo', 'Corte clásico o moderno', 15, 40, 1),
                ('Arreglo de barba', 'Perfilado y toalla caliente', 10, 40, 2),
                ('Corte + barba', 'Servicio completo', 22, 40, 3)",
        )
        .execute(pool)
        .await?;
        save_schedule(pool, &WeeklySchedule::default_shop()).await?;
        mark_applied(pool, "002_seed").await?;
    }

    tracing::info!("Database migrations up to date");
    Ok(())
}

async fn is_applied(pool: &SqlitePool, name: &str) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
}

async fn mark_applied(pool: &SqlitePool, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
        .bind(name)
        .execute(pool)
        .await?;
    tracing::info!("Applied migration: {}", name);
    Ok(())
}

// ── Work schedule ──

pub async fn load_schedule(pool: &SqlitePool) -> Result<WeeklySchedule, sqlx::Error> {
    let rows = sqlx::query_as::<_, (i64, String, String)>(
        "SELECT day_of_week, start_time, end_time FROM work_schedule
         ORDER BY day_of_week ASC, position ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut days: Vec<(u8, Vec<TimeBlock>)> = Vec::new();
    for (day, start, end) in rows {
        let Some(block) = TimeBlock::parse(&start, &end) else {
            tracing::warn!(day, %start, %end, "skipping unparsable schedule block");
            continue;
        };
        let day = day as u8;
        match days.last_mut() {
            Some((d, blocks)) if *d == day => blocks.push(block),
            _ => days.push((day, vec![block])),
        }
    }

    let mut schedule = WeeklySchedule::new();
    for (day, blocks) in days {
        schedule.set_day(day, blocks);
    }
    Ok(schedule)
}

/// Replace the stored schedule. Callers validate first.
pub async fn save_schedule(pool: &SqlitePool, schedule: &WeeklySchedule) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM work_schedule").execute(&mut *tx).await?;
    for (day, blocks) in schedule.days() {
        for (position, block) in blocks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO work_schedule (day_of_week, position, start_time, end_time)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(i64::from(day))
            .bind(position as i64)
            .bind(slots::format_time(block.start))
            .bind(slots::format_time(block.end))
            .execute(&mut *tx)
            .await?;
        }
    }
    tx.commit().await
}

// ── Day inputs for the resolver ──

pub async fn booked_times(pool: &SqlitePool, date: &str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT time FROM reservations WHERE date = ?")
        .bind(date)
        .fetch_all(pool)
        .await
}

pub async fn blocked_times(pool: &SqlitePool, date: &str) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT time FROM blocked_hours WHERE date = ?")
        .bind(date)
        .fetch_all(pool)
        .await
}

pub async fn list_vacations(pool: &SqlitePool) -> Result<Vec<VacationBlock>, sqlx::Error> {
    sqlx::query_as::<_, VacationBlock>(
        "SELECT id, start_date, end_date, reason FROM vacations ORDER BY start_date ASC",
    )
    .fetch_all(pool)
    .await
}

// ── Reservations ──

/// Shared SELECT for reservation rows joined with their service name.
pub const RESERVATION_SELECT: &str =
    "SELECT r.id, r.date, r.time, r.customer_name, r.customer_phone, r.customer_email,
            r.service_id, s.name AS service_name, r.price, r.status, r.created_at
     FROM reservations r
     JOIN services s ON s.id = r.service_id";

pub async fn fetch_reservation(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Reservation>, sqlx::Error> {
    let query = format!("{} WHERE r.id = ?", RESERVATION_SELECT);
    sqlx::query_as::<_, Reservation>(&query)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("slot {date} {time} is already taken")]
    SlotTaken { date: String, time: String },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone)]
pub struct NewReservation<'a> {
    pub date: &'a str,
    /// Already normalised to "HH:MM".
    pub time: &'a str,
    pub customer_name: &'a str,
    pub customer_phone: &'a str,
    pub customer_email: Option<&'a str>,
    pub service_id: i64,
    pub price: i64,
}

pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Insert a reservation and count it on the client's aggregate.
///
/// `UNIQUE(date, time)` is the only authority on whether the slot is free:
/// whatever availability the caller read before is advisory.
pub async fn admit_reservation(
    pool: &SqlitePool,
    new: &NewReservation<'_>,
) -> Result<i64, AdmissionError> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO reservations
            (date, time, customer_name, customer_phone, customer_email, service_id, price, status)
         VALUES (?, ?, ?, ?, ?, ?, ?, 'pending')",
    )
    .bind(new.date)
    .bind(new.time)
    .bind(new.customer_name)
    .bind(new.customer_phone)
    .bind(new.customer_email)
    .bind(new.service_id)
    .bind(new.price)
    .execute(&mut *tx)
    .await;

    let id = match inserted {
        Ok(result) => result.last_insert_rowid(),
        Err(e) if is_unique_violation(&e) => {
            return Err(AdmissionError::SlotTaken {
                date: new.date.to_string(),
                time: new.time.to_string(),
            })
        }
        Err(e) => return Err(e.into()),
    };

    sqlx::query(
        "INSERT INTO clients (phone, name, email) VALUES (?, ?, ?)
         ON CONFLICT(phone) DO UPDATE SET
            name = excluded.name,
            email = COALESCE(excluded.email, clients.email)",
    )
    .bind(new.customer_phone)
    .bind(new.customer_name)
    .bind(new.customer_email)
    .execute(&mut *tx)
    .await?;

    record_client_event(&mut tx, new.customer_phone, ReservationEvent::Created).await?;

    tx.commit().await?;
    Ok(id)
}

/// Hard-delete a reservation on the shop's behalf, freeing its slot.
pub async fn cancel_reservation(
    pool: &SqlitePool,
    id: i64,
) -> Result<Option<Reservation>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let Some(reservation) = fetch_reservation(&mut tx, id).await? else {
        return Ok(None);
    };
    delete_reservation(&mut tx, &reservation).await?;
    tx.commit().await?;
    Ok(Some(reservation))
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    /// Unknown id, or the phone does not match.
    #[error("reservation not found")]
    NotFound,
    #[error("reservation is {0:?} and can no longer be cancelled")]
    Settled(ReservationStatus),
    #[error("reservation has already started")]
    Started,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Customer cancellation: only their own pending reservations whose slot
/// has not started yet.
pub async fn cancel_by_customer(
    pool: &SqlitePool,
    id: i64,
    phone: &str,
    now: NaiveDateTime,
) -> Result<Reservation, CancelError> {
    let mut tx = pool.begin().await?;

    let reservation = fetch_reservation(&mut tx, id)
        .await?
        .filter(|r| r.customer_phone == phone.trim())
        .ok_or(CancelError::NotFound)?;
    if reservation.status != ReservationStatus::Pending {
        return Err(CancelError::Settled(reservation.status));
    }
    if has_started(&reservation, now) {
        return Err(CancelError::Started);
    }

    delete_reservation(&mut tx, &reservation).await?;
    tx.commit().await?;
    Ok(reservation)
}

fn has_started(reservation: &Reservation, now: NaiveDateTime) -> bool {
    match NaiveDate::parse_from_str(&reservation.date, "%Y-%m-%d") {
        Ok(date) => date < now.date() || slots::is_slot_in_past(date, &reservation.time, now),
        Err(_) => true,
    }
}

async fn delete_reservation(
    conn: &mut SqliteConnection,
    reservation: &Reservation,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM reservations WHERE id = ?")
        .bind(reservation.id)
        .execute(&mut *conn)
        .await?;

    record_client_event(
        conn,
        &reservation.customer_phone,
        ReservationEvent::Cancelled {
            from: reservation.status,
        },
    )
    .await
}

#[derive(Debug)]
pub enum StatusOutcome {
    Updated {
        reservation: Reservation,
        from: ReservationStatus,
    },
    /// Moving to `cancelled` deletes the row; this is the row as it was.
    Cancelled(Reservation),
}

pub async fn update_reservation_status(
    pool: &SqlitePool,
    id: i64,
    to: ReservationStatus,
) -> Result<Option<StatusOutcome>, sqlx::Error> {
    if to == ReservationStatus::Cancelled {
        return Ok(cancel_reservation(pool, id)
            .await?
            .map(StatusOutcome::Cancelled));
    }

    let mut tx = pool.begin().await?;
    let Some(mut reservation) = fetch_reservation(&mut tx, id).await? else {
        return Ok(None);
    };
    let from = reservation.status;

    sqlx::query("UPDATE reservations SET status = ? WHERE id = ?")
        .bind(to)
        .bind(id)
        .execute(&mut *tx)
        .await?;

    record_client_event(
        &mut tx,
        &reservation.customer_phone,
        ReservationEvent::StatusChanged { from, to },
    )
    .await?;

    // last_visit only moves forward, and only for visits that happened.
    if matches!(
        to,
        ReservationStatus::Completed | ReservationStatus::AttendedWithNotice
    ) {
        sqlx::query(
            "UPDATE clients SET last_visit = MAX(COALESCE(last_visit, ''), ?) WHERE phone = ?",
        )
        .bind(&reservation.date)
        .bind(&reservation.customer_phone)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    reservation.status = to;
    Ok(Some(StatusOutcome::Updated { reservation, from }))
}

// ── Clients ──

async fn record_client_event(
    conn: &mut SqliteConnection,
    phone: &str,
    event: ReservationEvent,
) -> Result<(), sqlx::Error> {
    let current = sqlx::query_as::<_, ClientCounters>(
        "SELECT total_appointments, completed, attended_with_notice, no_shows, cancelled
         FROM clients WHERE phone = ?",
    )
    .bind(phone)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(mut counters) = current else {
        tracing::warn!(phone, ?event, "no client aggregate for reservation event");
        return Ok(());
    };
    counters.apply(event);

    sqlx::query(
        "UPDATE clients SET total_appointments = ?, completed = ?, attended_with_notice = ?,
                no_shows = ?, cancelled = ?
         WHERE phone = ?",
    )
    .bind(counters.total_appointments)
    .bind(counters.completed)
    .bind(counters.attended_with_notice)
    .bind(counters.no_shows)
    .bind(counters.cancelled)
    .bind(phone)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn is_client_blocked(pool: &SqlitePool, phone: &str) -> Result<bool, sqlx::Error> {
    let blocked: Option<bool> =
        sqlx::query_scalar("SELECT is_blocked FROM clients WHERE phone = ?")
            .bind(phone)
            .fetch_optional(pool)
            .await?;
    Ok(blocked.unwrap_or(false))
}

// ── Admin roles ──

/// Make sure the configured owner can always reach the admin panel.
pub async fn ensure_owner(pool: &SqlitePool, tg_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO admin_roles (tg_id, role) VALUES (?, 'owner')
         ON CONFLICT(tg_id) DO UPDATE SET role = 'owner'",
    )
    .bind(tg_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn admin_role(pool: &SqlitePool, tg_id: i64) -> Result<Option<AdminRole>, sqlx::Error> {
    sqlx::query_scalar("SELECT role FROM admin_roles WHERE tg_id = ?")
        .bind(tg_id)
        .fetch_optional(pool)
        .await
}

// ── Test support ──

/// Single-connection in-memory database with migrations applied.
#[cfg(test)]
pub async fn memory_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking<'a>(date: &'a str, time: &'a str, phone: &'a str) -> NewReservation<'a> {
        NewReservation {
            date,
            time,
            customer_name: "Luis",
            customer_phone: phone,
            customer_email: None,
            service_id: 1,
            price: 15,
        }
    }

    /// Shop clock the evening before the 2026-03-02 bookings used below.
    fn day_before() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, 1)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap()
    }

    async fn counters(pool: &SqlitePool, phone: &str) -> ClientCounters {
        sqlx::query_as::<_, ClientCounters>(
            "SELECT total_appointments, completed, attended_with_notice, no_shows, cancelled
             FROM clients WHERE phone = ?",
        )
        .bind(phone)
        .fetch_one(pool)
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();

        let services: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(services, 3);
        assert_eq!(
            load_schedule(&pool).await.unwrap(),
            WeeklySchedule::default_shop()
        );
    }

    #[tokio::test]
    async fn test_schedule_roundtrip() {
        let pool = memory_pool().await;
        let schedule = WeeklySchedule::new()
            .with_day(2, vec![TimeBlock::parse("10:00", "12:00").unwrap()])
            .with_day(
                4,
                vec![
                    TimeBlock::parse("08:00", "09:00").unwrap(),
                    TimeBlock::parse("16:00", "18:30").unwrap(),
                ],
            );
        save_schedule(&pool, &schedule).await.unwrap();
        assert_eq!(load_schedule(&pool).await.unwrap(), schedule);
    }

    #[tokio::test]
    async fn test_second_admission_same_slot_rejected() {
        let pool = memory_pool().await;
        admit_reservation(&pool, &booking("2026-03-02", "09:40", "600111222"))
            .await
            .unwrap();

        let err = admit_reservation(&pool, &booking("2026-03-02", "09:40", "600333444"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::SlotTaken { .. }));

        // Loser's transaction rolled back: no client aggregate for them.
        let losers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM clients WHERE phone = ?")
            .bind("600333444")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(losers, 0);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_one_winner() {
        let dir = tempfile::TempDir::new().unwrap();
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(dir.path().join("race.db"))
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();

        let first = booking("2026-03-02", "09:40", "600111222");
        let second = booking("2026-03-02", "09:40", "600333444");
        let (a, b) = tokio::join!(
            admit_reservation(&pool, &first),
            admit_reservation(&pool, &second)
        );

        let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(loser, Err(AdmissionError::SlotTaken { .. })));
        assert_eq!(booked_times(&pool, "2026-03-02").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_time_other_date_admitted() {
        let pool = memory_pool().await;
        admit_reservation(&pool, &booking("2026-03-02", "09:40", "600111222"))
            .await
            .unwrap();
        assert!(admit_reservation(&pool, &booking("2026-03-03", "09:40", "600111222"))
            .await
            .is_ok());
        assert_eq!(counters(&pool, "600111222").await.total_appointments, 2);
    }

    #[tokio::test]
    async fn test_cancel_frees_slot() {
        let pool = memory_pool().await;
        let id = admit_reservation(&pool, &booking("2026-03-02", "10:20", "600111222"))
            .await
            .unwrap();

        let cancelled = cancel_by_customer(&pool, id, "600111222", day_before())
            .await
            .unwrap();
        assert_eq!(cancelled.time, "10:20");
        assert!(booked_times(&pool, "2026-03-02").await.unwrap().is_empty());

        admit_reservation(&pool, &booking("2026-03-02", "10:20", "600111222"))
            .await
            .unwrap();
        let c = counters(&pool, "600111222").await;
        assert_eq!(c.total_appointments, 2);
        assert_eq!(c.cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_wrong_phone_keeps_reservation() {
        let pool = memory_pool().await;
        let id = admit_reservation(&pool, &booking("2026-03-02", "10:20", "600111222"))
            .await
            .unwrap();
        let err = cancel_by_customer(&pool, id, "699999999", day_before())
            .await
            .unwrap_err();
        assert!(matches!(err, CancelError::NotFound));
        assert_eq!(booked_times(&pool, "2026-03-02").await.unwrap(), vec!["10:20"]);
    }

    #[tokio::test]
    async fn test_customer_cannot_cancel_settled_reservation() {
        let pool = memory_pool().await;
        let id = admit_reservation(&pool, &booking("2026-03-02", "10:20", "600111222"))
            .await
            .unwrap();
        update_reservation_status(&pool, id, ReservationStatus::NoShow)
            .await
            .unwrap();

        let err = cancel_by_customer(&pool, id, "600111222", day_before())
            .await
            .unwrap_err();
        assert!(matches!(err, CancelError::Settled(ReservationStatus::NoShow)));

        let c = counters(&pool, "600111222").await;
        assert_eq!((c.no_shows, c.cancelled), (1, 0));
        assert_eq!(booked_times(&pool, "2026-03-02").await.unwrap(), vec!["10:20"]);
    }

    #[tokio::test]
    async fn test_customer_cannot_cancel_started_reservation() {
        let pool = memory_pool().await;
        let id = admit_reservation(&pool, &booking("2026-03-02", "10:20", "600111222"))
            .await
            .unwrap();

        let same_day = NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let err = cancel_by_customer(&pool, id, "600111222", same_day)
            .await
            .unwrap_err();
        assert!(matches!(err, CancelError::Started));

        let next_day = same_day + chrono::Duration::days(1);
        let err = cancel_by_customer(&pool, id, "600111222", next_day)
            .await
            .unwrap_err();
        assert!(matches!(err, CancelError::Started));

        // Earlier the same morning is still fine.
        let before = same_day - chrono::Duration::hours(2);
        assert!(cancel_by_customer(&pool, id, "600111222", before).await.is_ok());
    }

    #[tokio::test]
    async fn test_status_update_moves_counters() {
        let pool = memory_pool().await;
        let id = admit_reservation(&pool, &booking("2026-03-02", "11:00", "600111222"))
            .await
            .unwrap();

        let outcome = update_reservation_status(&pool, id, ReservationStatus::NoShow)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            outcome,
            StatusOutcome::Updated { from: ReservationStatus::Pending, .. }
        ));
        update_reservation_status(&pool, id, ReservationStatus::Completed)
            .await
            .unwrap();

        let c = counters(&pool, "600111222").await;
        assert_eq!(c.no_shows, 0);
        assert_eq!(c.completed, 1);
    }

    #[tokio::test]
    async fn test_last_visit_tracks_latest_attended_visit() {
        let pool = memory_pool().await;
        let later = admit_reservation(&pool, &booking("2026-03-09", "11:00", "600111222"))
            .await
            .unwrap();
        let earlier = admit_reservation(&pool, &booking("2026-03-02", "11:00", "600111222"))
            .await
            .unwrap();

        let last_visit = || async {
            sqlx::query_scalar::<_, Option<String>>(
                "SELECT last_visit FROM clients WHERE phone = '600111222'",
            )
            .fetch_one(&pool)
            .await
            .unwrap()
        };
        // Booking alone is not a visit.
        assert_eq!(last_visit().await, None);

        update_reservation_status(&pool, later, ReservationStatus::Completed)
            .await
            .unwrap();
        update_reservation_status(&pool, earlier, ReservationStatus::AttendedWithNotice)
            .await
            .unwrap();
        assert_eq!(last_visit().await.as_deref(), Some("2026-03-09"));
    }

    #[tokio::test]
    async fn test_status_cancelled_deletes() {
        let pool = memory_pool().await;
        let id = admit_reservation(&pool, &booking("2026-03-02", "11:00", "600111222"))
            .await
            .unwrap();
        let outcome = update_reservation_status(&pool, id, ReservationStatus::Cancelled)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, StatusOutcome::Cancelled(_)));
        assert!(booked_times(&pool, "2026-03-02").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_unknown_reservation() {
        let pool = memory_pool().await;
        assert!(update_reservation_status(&pool, 999, ReservationStatus::Completed)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ensure_owner_promotes() {
        let pool = memory_pool().await;
        sqlx::query("INSERT INTO admin_roles (tg_id, role) VALUES (42, 'admin')")
            .execute(&pool)
            .await
            .unwrap();
        ensure_owner(&pool, 42).await.unwrap();
        assert_eq!(admin_role(&pool, 42).await.unwrap(), Some(AdminRole::Owner));
        assert_eq!(admin_role(&pool, 7).await.unwrap(), None);
    }
}
