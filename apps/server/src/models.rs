use serde::{Deserialize, Serialize};

use crate::clients::ClientCounters;

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub price: i64,
    pub duration_min: i64,
    pub is_active: bool,
    pub sort_order: i64,
}

/// Lifecycle of a reservation. Cancellation deletes the row, so
/// `Cancelled` only ever appears as a requested transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Completed,
    AttendedWithNotice,
    NoShow,
    Cancelled,
}

impl ReservationStatus {
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "pendiente",
            Self::Completed => "completada",
            Self::AttendedWithNotice => "asistió con aviso",
            Self::NoShow => "no se presentó",
            Self::Cancelled => "cancelada",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Reservation {
    pub id: i64,
    pub date: String,
    pub time: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub service_id: i64,
    pub service_name: String,
    pub price: i64,
    pub status: ReservationStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlockedHour {
    pub id: i64,
    pub date: String,
    pub time: String,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Client {
    pub phone: String,
    pub name: String,
    pub email: Option<String>,
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub counters: ClientCounters,
    pub is_blocked: bool,
    pub last_visit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AdminRole {
    Owner,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AdminMember {
    pub tg_id: i64,
    pub role: AdminRole,
    pub added_at: String,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct CalendarQuery {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Serialize)]
pub struct CalendarDay {
    pub date: String,
    pub closed: bool,
    pub vacation: bool,
    pub free: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateReservationRequest {
    pub service_id: i64,
    pub date: String,
    pub time: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CancelReservationQuery {
    pub phone: String,
}

#[derive(Debug, Deserialize)]
pub struct ReservationsQuery {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: ReservationStatus,
}

#[derive(Debug, Deserialize)]
pub struct BlockedHoursQuery {
    pub date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBlockedHourRequest {
    pub date: String,
    pub time: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PastSweepResponse {
    pub date: String,
    pub blocked: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateVacationRequest {
    pub start_date: String,
    pub end_date: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BlockClientRequest {
    pub blocked: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: i64,
    pub duration_min: i64,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub duration_min: Option<i64>,
    pub is_active: Option<bool>,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AddAdminRequest {
    pub tg_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub slot_duration_min: u32,
    pub days: crate::slots::WeeklySchedule,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Telegram auth ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}
