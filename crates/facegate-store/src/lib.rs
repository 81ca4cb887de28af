//! Facegate repository — SQLite-backed ticket and event store.
//!
//! Two rules keep the concurrent gate honest, and both are enforced here
//! rather than in callers:
//!
//! * every status move is a single conditional `UPDATE ... WHERE status = ?`
//!   (compare-and-set), so `admit` is effectively exactly-once per ticket;
//! * the attendee counter moves only inside the activation transaction,
//!   as an atomic guarded increment, never as a read-modify-write pair.
//!
//! Biometric artifacts are sealed (see [`seal`]) before hitting disk.
//! Every committed write republishes a full snapshot of both tables to
//! `watch` subscribers; consumers get full replaces, not diffs.

pub mod seal;

use chrono::{DateTime, Utc};
use facegate_core::{Event, GateError, Holder, Ticket, TicketClass, TicketStatus};
use facegate_source::Artifact;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

pub use seal::{Seal, SealError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    schedule          TEXT NOT NULL,
    location          TEXT NOT NULL,
    is_free           INTEGER NOT NULL,
    price             REAL NOT NULL,
    max_capacity      INTEGER NOT NULL,
    current_attendees INTEGER NOT NULL DEFAULT 0,
    is_active         INTEGER NOT NULL DEFAULT 1,
    created_at        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS tickets (
    id                 TEXT PRIMARY KEY,
    event_id           TEXT NOT NULL REFERENCES events(id),
    holder_name        TEXT NOT NULL,
    holder_email       TEXT NOT NULL,
    holder_national_id TEXT NOT NULL,
    class              TEXT NOT NULL,
    price              REAL NOT NULL,
    status             TEXT NOT NULL,
    purchased_at       TEXT NOT NULL,
    artifact_kind      TEXT,
    artifact_method    TEXT,
    artifact_blob      BLOB,
    updated_at         TEXT
);
CREATE INDEX IF NOT EXISTS idx_tickets_claim ON tickets (event_id, holder_email);
";

const TICKET_COLUMNS: &str = "id, event_id, holder_name, holder_email, holder_national_id, \
                              class, price, status, purchased_at, artifact_method";
const EVENT_COLUMNS: &str = "id, name, schedule, location, is_free, price, \
                             max_capacity, current_attendees, is_active";

/// Clone-safe handle to the repository. All clones share one connection
/// (and therefore one write serialization point) plus the snapshot
/// channels.
#[derive(Clone)]
pub struct Store {
    conn: tokio_rusqlite::Connection,
    seal: Arc<Seal>,
    tickets_tx: Arc<watch::Sender<Vec<Ticket>>>,
    events_tx: Arc<watch::Sender<Vec<Event>>>,
}

impl Store {
    pub async fn open(path: &Path, seal: Seal) -> Result<Self, GateError> {
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| GateError::ServiceUnavailable(format!("open database: {e}")))?;
        Self::init(conn, seal).await
    }

    /// In-memory store, used by tests.
    pub async fn open_in_memory(seal: Seal) -> Result<Self, GateError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| GateError::ServiceUnavailable(format!("open database: {e}")))?;
        Self::init(conn, seal).await
    }

    async fn init(conn: tokio_rusqlite::Connection, seal: Seal) -> Result<Self, GateError> {
        conn.call(|c| Ok(c.execute_batch(SCHEMA).map_err(sql)))
            .await
            .map_err(infra)??;

        let (tickets_tx, _) = watch::channel(Vec::new());
        let (events_tx, _) = watch::channel(Vec::new());
        Ok(Self {
            conn,
            seal: Arc::new(seal),
            tickets_tx: Arc::new(tickets_tx),
            events_tx: Arc::new(events_tx),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T, GateError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, GateError> + Send + 'static,
    {
        self.conn.call(move |c| Ok(f(c))).await.map_err(infra)?
    }

    // --- events ---

    pub async fn insert_event(&self, event: &Event) -> Result<(), GateError> {
        let event = event.clone();
        self.call(move |c| {
            c.execute(
                "INSERT INTO events (id, name, schedule, location, is_free, price, \
                 max_capacity, current_attendees, is_active, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    event.id,
                    event.name,
                    event.schedule.to_rfc3339(),
                    event.location,
                    event.is_free,
                    event.price,
                    event.max_capacity,
                    event.current_attendees,
                    event.is_active,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(sql)?;
            Ok(())
        })
        .await?;
        self.publish().await;
        Ok(())
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Event, GateError> {
        let id = event_id.to_owned();
        self.call(move |c| {
            c.query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                params![id],
                event_from_row,
            )
            .optional()
            .map_err(sql)?
            .ok_or_else(|| GateError::EventNotFound(id))
        })
        .await
    }

    pub async fn list_events(&self, active_only: bool) -> Result<Vec<Event>, GateError> {
        self.call(move |c| {
            let sql_text = if active_only {
                format!("SELECT {EVENT_COLUMNS} FROM events WHERE is_active = 1 ORDER BY schedule")
            } else {
                format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY schedule")
            };
            let mut stmt = c.prepare(&sql_text).map_err(sql)?;
            let rows = stmt.query_map([], event_from_row).map_err(sql)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql)
        })
        .await
    }

    /// Current `(attendees, capacity)` for an event.
    pub async fn capacity(&self, event_id: &str) -> Result<(u32, u32), GateError> {
        let id = event_id.to_owned();
        self.call(move |c| {
            c.query_row(
                "SELECT current_attendees, max_capacity FROM events WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(sql)?
            .ok_or_else(|| GateError::EventNotFound(id))
        })
        .await
    }

    // --- tickets ---

    /// Insert a new ticket. At most one live (non-used, non-expired)
    /// ticket may exist per (event, holder email); the guard is part of
    /// the INSERT itself so concurrent registrations cannot both pass.
    pub async fn create_ticket(&self, ticket: &Ticket) -> Result<(), GateError> {
        let t = ticket.clone();
        self.call(move |c| {
            let email = t.holder.email.to_lowercase();
            let inserted = c
                .execute(
                    "INSERT INTO tickets (id, event_id, holder_name, holder_email, \
                     holder_national_id, class, price, status, purchased_at) \
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9 \
                     WHERE NOT EXISTS (SELECT 1 FROM tickets \
                       WHERE event_id = ?2 AND holder_email = ?4 \
                       AND status NOT IN ('used', 'expired'))",
                    params![
                        t.id,
                        t.event_id,
                        t.holder.name,
                        email,
                        t.holder.national_id,
                        t.class.as_str(),
                        t.price,
                        t.status.as_str(),
                        t.purchased_at.to_rfc3339(),
                    ],
                )
                .map_err(sql)?;
            if inserted == 0 {
                return Err(GateError::AmbiguousClaim(
                    "holder already has a live ticket for this event".into(),
                ));
            }
            Ok(())
        })
        .await?;
        self.publish().await;
        Ok(())
    }

    pub async fn get_ticket(&self, ticket_id: &str) -> Result<Ticket, GateError> {
        let id = ticket_id.to_owned();
        self.call(move |c| {
            c.query_row(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id],
                ticket_from_row,
            )
            .optional()
            .map_err(sql)?
            .ok_or(GateError::ClaimNotFound)
        })
        .await
    }

    /// All tickets registered under the claimed holder email for one
    /// event, regardless of status. The orchestrator partitions them.
    pub async fn tickets_for_claim(
        &self,
        event_id: &str,
        email: &str,
    ) -> Result<Vec<Ticket>, GateError> {
        let event_id = event_id.to_owned();
        let email = email.to_lowercase();
        self.call(move |c| {
            let mut stmt = c
                .prepare(&format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets \
                     WHERE event_id = ?1 AND holder_email = ?2 ORDER BY purchased_at"
                ))
                .map_err(sql)?;
            let rows = stmt
                .query_map(params![event_id, email], ticket_from_row)
                .map_err(sql)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql)
        })
        .await
    }

    pub async fn list_tickets(&self, event_id: &str) -> Result<Vec<Ticket>, GateError> {
        let event_id = event_id.to_owned();
        self.call(move |c| {
            let mut stmt = c
                .prepare(&format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets \
                     WHERE event_id = ?1 ORDER BY purchased_at"
                ))
                .map_err(sql)?;
            let rows = stmt.query_map(params![event_id], ticket_from_row).map_err(sql)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql)
        })
        .await
    }

    /// `PendingPayment -> PaidPendingFace` as a compare-and-set.
    pub async fn confirm_payment(&self, ticket_id: &str) -> Result<Ticket, GateError> {
        let id = ticket_id.to_owned();
        self.call(move |c| {
            let changed = c
                .execute(
                    "UPDATE tickets SET status = 'paid_pending_face', updated_at = ?2 \
                     WHERE id = ?1 AND status = 'pending_payment'",
                    params![id, Utc::now().to_rfc3339()],
                )
                .map_err(sql)?;
            if changed == 0 {
                let status = read_status(c, &id)?.ok_or(GateError::ClaimNotFound)?;
                // Reproduce the precise machine error for the caller.
                status.confirm_payment()?;
                return Err(GateError::ServiceUnavailable(
                    "payment confirmation write conflict".into(),
                ));
            }
            Ok(())
        })
        .await?;
        self.publish().await;
        self.get_ticket(ticket_id).await
    }

    /// `Active -> Used` as a compare-and-set. Exactly one concurrent
    /// caller wins; losers observe [`GateError::AlreadyUsed`].
    pub async fn admit(&self, ticket_id: &str) -> Result<(), GateError> {
        let id = ticket_id.to_owned();
        self.call(move |c| {
            let changed = c
                .execute(
                    "UPDATE tickets SET status = 'used', updated_at = ?2 \
                     WHERE id = ?1 AND status = 'active'",
                    params![id, Utc::now().to_rfc3339()],
                )
                .map_err(sql)?;
            if changed == 0 {
                let status = read_status(c, &id)?.ok_or(GateError::ClaimNotFound)?;
                status.admit()?;
                return Err(GateError::ServiceUnavailable("admission write conflict".into()));
            }
            Ok(())
        })
        .await?;
        self.publish().await;
        Ok(())
    }

    /// Administrative expiry from any non-terminal state.
    pub async fn expire(&self, ticket_id: &str) -> Result<Ticket, GateError> {
        let id = ticket_id.to_owned();
        self.call(move |c| {
            let changed = c
                .execute(
                    "UPDATE tickets SET status = 'expired', updated_at = ?2 \
                     WHERE id = ?1 AND status IN ('pending_payment', 'paid_pending_face', 'active')",
                    params![id, Utc::now().to_rfc3339()],
                )
                .map_err(sql)?;
            if changed == 0 {
                let status = read_status(c, &id)?.ok_or(GateError::ClaimNotFound)?;
                status.expire()?;
                return Err(GateError::ServiceUnavailable("expiry write conflict".into()));
            }
            Ok(())
        })
        .await?;
        self.publish().await;
        self.get_ticket(ticket_id).await
    }

    /// Bind the biometric artifact, activate the ticket, and count the
    /// admission — one transaction, all or nothing.
    ///
    /// With strict enforcement the increment is guarded by
    /// `current_attendees < max_capacity`, so the counter can never pass
    /// capacity no matter how many activations race. Returns the event's
    /// `(attendees, capacity)` after the commit.
    pub async fn activate_and_count(
        &self,
        ticket_id: &str,
        event_id: &str,
        artifact: &Artifact,
        method: &str,
        strict: bool,
    ) -> Result<(u32, u32), GateError> {
        let payload = serde_json::to_vec(artifact)
            .map_err(|e| GateError::ServiceUnavailable(format!("artifact encode: {e}")))?;
        let blob = self
            .seal
            .seal(&payload)
            .map_err(|e| GateError::ServiceUnavailable(format!("artifact seal: {e}")))?;
        let kind = artifact.kind().to_owned();
        let method = method.to_owned();
        let ticket_id_owned = ticket_id.to_owned();
        let event_id_owned = event_id.to_owned();

        let counts = self
            .call(move |c| {
                let tx = c
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(sql)?;

                let activated = tx
                    .execute(
                        "UPDATE tickets SET status = 'active', artifact_kind = ?2, \
                         artifact_method = ?3, artifact_blob = ?4, updated_at = ?5 \
                         WHERE id = ?1 AND status = 'paid_pending_face' \
                         AND artifact_blob IS NULL",
                        params![
                            ticket_id_owned,
                            kind,
                            method,
                            blob,
                            Utc::now().to_rfc3339()
                        ],
                    )
                    .map_err(sql)?;
                if activated == 0 {
                    let status =
                        read_status_tx(&tx, &ticket_id_owned)?.ok_or(GateError::ClaimNotFound)?;
                    status.enroll()?;
                    return Err(GateError::InvalidTransition {
                        from: status,
                        attempted: "enroll",
                    });
                }

                let counted = if strict {
                    tx.execute(
                        "UPDATE events SET current_attendees = current_attendees + 1 \
                         WHERE id = ?1 AND current_attendees < max_capacity",
                        params![event_id_owned],
                    )
                    .map_err(sql)?
                } else {
                    tx.execute(
                        "UPDATE events SET current_attendees = current_attendees + 1 \
                         WHERE id = ?1",
                        params![event_id_owned],
                    )
                    .map_err(sql)?
                };
                if counted == 0 {
                    let exists: Option<i64> = tx
                        .query_row(
                            "SELECT 1 FROM events WHERE id = ?1",
                            params![event_id_owned],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(sql)?;
                    // The transaction rolls back on drop; the ticket
                    // activation above is undone with it.
                    return match exists {
                        Some(_) => Err(GateError::CapacityExceeded),
                        None => Err(GateError::EventNotFound(event_id_owned)),
                    };
                }

                let counts: (u32, u32) = tx
                    .query_row(
                        "SELECT current_attendees, max_capacity FROM events WHERE id = ?1",
                        params![event_id_owned],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .map_err(sql)?;

                tx.commit().map_err(sql)?;
                Ok(counts)
            })
            .await?;
        self.publish().await;
        Ok(counts)
    }

    /// Unseal and decode the bound artifact, if any.
    pub async fn fetch_artifact(&self, ticket_id: &str) -> Result<Option<Artifact>, GateError> {
        let id = ticket_id.to_owned();
        let blob: Option<Vec<u8>> = self
            .call(move |c| {
                c.query_row(
                    "SELECT artifact_blob FROM tickets WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql)?
                .ok_or(GateError::ClaimNotFound)
            })
            .await?;

        let Some(blob) = blob else {
            return Ok(None);
        };
        let payload = self
            .seal
            .open(&blob)
            .map_err(|e| GateError::ServiceUnavailable(format!("artifact unseal: {e}")))?;
        let artifact = serde_json::from_slice(&payload)
            .map_err(|e| GateError::ServiceUnavailable(format!("artifact decode: {e}")))?;
        Ok(Some(artifact))
    }

    // --- subscriptions ---

    /// Full-snapshot feed of all tickets; a fresh snapshot is published
    /// after every committed write.
    pub fn subscribe_tickets(&self) -> watch::Receiver<Vec<Ticket>> {
        self.tickets_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> watch::Receiver<Vec<Event>> {
        self.events_tx.subscribe()
    }

    /// Republish full snapshots. A failed snapshot read is logged, not
    /// propagated: the write this follows has already committed.
    async fn publish(&self) {
        let snapshot = self
            .call(|c| {
                let mut stmt = c
                    .prepare(&format!("SELECT {TICKET_COLUMNS} FROM tickets ORDER BY purchased_at"))
                    .map_err(sql)?;
                let tickets = stmt
                    .query_map([], ticket_from_row)
                    .map_err(sql)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(sql)?;
                let mut stmt = c
                    .prepare(&format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY schedule"))
                    .map_err(sql)?;
                let events = stmt
                    .query_map([], event_from_row)
                    .map_err(sql)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(sql)?;
                Ok((tickets, events))
            })
            .await;

        match snapshot {
            Ok((tickets, events)) => {
                self.tickets_tx.send_replace(tickets);
                self.events_tx.send_replace(events);
            }
            Err(e) => tracing::warn!(error = %e, "snapshot publish failed"),
        }
    }
}

fn sql(e: rusqlite::Error) -> GateError {
    GateError::ServiceUnavailable(format!("storage: {e}"))
}

fn infra(e: tokio_rusqlite::Error) -> GateError {
    GateError::ServiceUnavailable(format!("storage: {e}"))
}

fn read_status(c: &rusqlite::Connection, ticket_id: &str) -> Result<Option<TicketStatus>, GateError> {
    let status: Option<String> = c
        .query_row(
            "SELECT status FROM tickets WHERE id = ?1",
            params![ticket_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql)?;
    status.map(|s| parse_status(&s)).transpose()
}

fn read_status_tx(
    tx: &rusqlite::Transaction<'_>,
    ticket_id: &str,
) -> Result<Option<TicketStatus>, GateError> {
    let status: Option<String> = tx
        .query_row(
            "SELECT status FROM tickets WHERE id = ?1",
            params![ticket_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql)?;
    status.map(|s| parse_status(&s)).transpose()
}

fn parse_status(s: &str) -> Result<TicketStatus, GateError> {
    TicketStatus::from_str(s)
        .ok_or_else(|| GateError::ServiceUnavailable(format!("storage: corrupt status {s:?}")))
}

fn bad_column(idx: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unrecognized value {value:?}").into(),
    )
}

fn parse_rfc3339(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| bad_column(idx, s))
}

fn ticket_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ticket> {
    let class: String = row.get(5)?;
    let status: String = row.get(7)?;
    let purchased_at: String = row.get(8)?;
    Ok(Ticket {
        id: row.get(0)?,
        event_id: row.get(1)?,
        holder: Holder {
            name: row.get(2)?,
            email: row.get(3)?,
            national_id: row.get(4)?,
        },
        class: TicketClass::from_str(&class).ok_or_else(|| bad_column(5, &class))?,
        price: row.get(6)?,
        status: TicketStatus::from_str(&status).ok_or_else(|| bad_column(7, &status))?,
        purchased_at: parse_rfc3339(8, &purchased_at)?,
        artifact_method: row.get(9)?,
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Event> {
    let schedule: String = row.get(2)?;
    Ok(Event {
        id: row.get(0)?,
        name: row.get(1)?,
        schedule: parse_rfc3339(2, &schedule)?,
        location: row.get(3)?,
        is_free: row.get(4)?,
        price: row.get(5)?,
        max_capacity: row.get(6)?,
        current_attendees: row.get(7)?,
        is_active: row.get(8)?,
    })
}
