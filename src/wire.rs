use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, NaiveTime};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M";

/// One request line, tagged by `op`. Dates and times stay as text here and
/// are parsed per field so a bad value is reported by name.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ListAvailable {
        date: String,
        start: String,
        end: String,
    },
    RequestBooking {
        user_id: UserId,
        court_id: CourtId,
        date: String,
        start: String,
        end: String,
    },
    CancelBooking {
        user_id: UserId,
        booking_id: BookingId,
    },
    ListBookings {
        user_id: UserId,
    },
}

/// Serve newline-delimited JSON requests until the peer hangs up.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut resume = false;
    loop {
        let line = match framed.next().await {
            Some(line) => line,
            // After a decode error the stream pauses with one `None`, then reads on.
            None if resume => {
                resume = false;
                continue;
            }
            None => break,
        };
        resume = false;
        let response = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&engine, &line).await,
            // The codec discards up to the next newline; the connection stays usable.
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                resume = true;
                error_response(
                    ErrorKind::InvalidInput,
                    &format!("request line longer than {MAX_LINE_LEN} bytes"),
                )
            }
            Err(e) => return Err(e),
        };
        framed.send(response.to_string()).await?;
    }
    Ok(())
}

/// Decode, execute and encode a single request line.
pub async fn handle_line(engine: &Engine, line: &str) -> Value {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            return error_response(ErrorKind::InvalidInput, &format!("malformed request: {e}"));
        }
    };

    let op = observability::request_label(&req);
    let start = Instant::now();
    let result = dispatch(engine, req).await;
    let elapsed = start.elapsed();

    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(elapsed.as_secs_f64());
    debug!(op, status, "handled in {elapsed:?}");

    match result {
        Ok(body) => body,
        Err(e) => error_response(e.kind(), &e.to_string()),
    }
}

async fn dispatch(engine: &Engine, req: Request) -> Result<Value, EngineError> {
    match req {
        Request::ListAvailable { date, start, end } => {
            let courts = engine
                .list_available_courts(
                    parse_date(&date)?,
                    parse_time("start", &start)?,
                    parse_time("end", &end)?,
                )
                .await?;
            let courts: Vec<Value> = courts
                .into_iter()
                .map(|c| {
                    json!({
                        "court_id": c.court.id,
                        "name": c.court.name,
                        "hourly_rate": c.court.hourly_rate.to_string(),
                        "price": c.price.to_string(),
                    })
                })
                .collect();
            Ok(json!({ "ok": true, "courts": courts }))
        }
        Request::RequestBooking {
            user_id,
            court_id,
            date,
            start,
            end,
        } => {
            let (booking, payment) = engine
                .request_booking(
                    user_id,
                    court_id,
                    parse_date(&date)?,
                    parse_time("start", &start)?,
                    parse_time("end", &end)?,
                )
                .await?;
            Ok(json!({
                "ok": true,
                "booking_id": booking.id,
                "amount": payment.amount.to_string(),
                "transaction_ref": payment.transaction_ref,
            }))
        }
        Request::CancelBooking {
            user_id,
            booking_id,
        } => {
            engine.cancel_booking(user_id, booking_id).await?;
            Ok(json!({ "ok": true }))
        }
        Request::ListBookings { user_id } => {
            let bookings: Vec<Value> = engine
                .list_user_bookings(user_id)
                .await
                .into_iter()
                .map(|s| {
                    json!({
                        "booking_id": s.booking.id,
                        "court_id": s.booking.court_id,
                        "court_name": s.court_name,
                        "date": s.booking.slot.date.format(DATE_FORMAT).to_string(),
                        "start": s.booking.slot.start.format(TIME_FORMAT).to_string(),
                        "end": s.booking.slot.end.format(TIME_FORMAT).to_string(),
                        "state": s.booking.state.as_str(),
                        "amount": s.amount.to_string(),
                        "payment_state": s.payment_state.as_str(),
                        "transaction_ref": s.transaction_ref,
                    })
                })
                .collect();
            Ok(json!({ "ok": true, "bookings": bookings }))
        }
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .map_err(|e| EngineError::InvalidInput(format!("date {s:?}: {e}")))
}

fn parse_time(field: &str, s: &str) -> Result<NaiveTime, EngineError> {
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .map_err(|e| EngineError::InvalidInput(format!("{field} {s:?}: {e}")))
}

pub fn error_response(kind: ErrorKind, message: &str) -> Value {
    json!({
        "ok": false,
        "error": { "kind": kind.as_str(), "message": message },
    })
}
