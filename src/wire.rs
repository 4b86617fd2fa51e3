use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{stream, Sink, SinkExt};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::auth::CalendarAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(CalendarFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

/// Query handler for one connection. Owns that connection's LISTEN subscriptions.
pub struct CalendarHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<CalendarQueryParser>,
    listening: Mutex<Vec<(String, broadcast::Receiver<Event>)>>,
}

impl CalendarHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(CalendarQueryParser),
            listening: Mutex::new(Vec::new()),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Run one command, recording latency and outcome.
    async fn execute(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertClient { id, name, email } => {
                engine.create_client(id, name, email).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteClient { id } => {
                engine.delete_client(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectClients => {
                let clients = engine.list_clients().await;
                let schema = Arc::new(client_schema());
                let rows: Vec<PgWireResult<_>> = clients
                    .into_iter()
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.name)?;
                        encoder.encode_field(&c.email)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::InsertBooking { id, draft, start, end } => {
                engine
                    .create_booking(id, draft, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::BatchInsertBookings { bookings } => {
                let count = bookings.len();
                let batch: Vec<_> = bookings
                    .into_iter()
                    .map(|(id, draft, start, end)| (id, draft, Span { start, end }))
                    .collect();
                engine.batch_create_bookings(batch).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::UpdateBooking { id, draft, start, end, status } => {
                engine
                    .update_booking(id, draft, Span { start, end }, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RescheduleBooking { id, start, end } => {
                engine
                    .reschedule_booking(id, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SetBookingStatus { id, status } => {
                match status {
                    BookingStatus::Completed => engine.complete_booking(id).await,
                    _ => engine.cancel_booking(id).await,
                }
                .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteBooking { id } => {
                engine.delete_booking(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(vec![booking_rows(vec![booking])])
            }
            Command::SelectBookings { filter } => {
                Ok(vec![booking_rows(engine.list_bookings(&filter).await)])
            }
            Command::SelectOverlaps { filter } => {
                Ok(vec![booking_rows(engine.overlapping_bookings(&filter).await)])
            }
            Command::SelectUpcoming { count } => {
                let now = crate::engine::now_ms();
                Ok(vec![booking_rows(engine.upcoming_bookings(now, count).await)])
            }
            Command::SelectAvailability { start, end, exclude_id } => {
                let available = engine
                    .is_available(Span { start, end }, exclude_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&start)?;
                encoder.encode_field(&end)?;
                encoder.encode_field(&available)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { channel } => {
                validate_channel(&channel)?;
                let mut listening = self.lock_listening();
                if !listening.iter().any(|(name, _)| *name == channel) {
                    let rx = engine.notify.subscribe(&channel);
                    listening.push((channel, rx));
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.lock_listening().retain(|(name, _)| *name != channel);
                engine.notify.prune();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.lock_listening().clear();
                engine.notify.prune();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    fn lock_listening(&self) -> std::sync::MutexGuard<'_, Vec<(String, broadcast::Receiver<Event>)>> {
        self.listening.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drain every event queued on this connection's channels.
    fn pending_notifications(&self) -> Vec<NotificationResponse> {
        let mut out = Vec::new();
        for (channel, rx) in self.lock_listening().iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(event) => out.push(NotificationResponse::new(
                        0,
                        channel.clone(),
                        notify::payload(&event),
                    )),
                    Err(TryRecvError::Lagged(skipped)) => {
                        tracing::warn!("listener on {channel} lagged, {skipped} notifications dropped");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
        out
    }

    /// Push queued notifications to the client ahead of the next response.
    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for notification in self.pending_notifications() {
            client
                .send(PgWireBackendMessage::NotificationResponse(notification))
                .await?;
        }
        Ok(())
    }
}

fn validate_channel(channel: &str) -> PgWireResult<()> {
    let valid = channel == notify::CALENDAR_CHANNEL
        || ["booking_", "client_"].iter().any(|prefix| {
            channel
                .strip_prefix(prefix)
                .is_some_and(|id| ulid::Ulid::from_string(id).is_ok())
        });
    if valid {
        Ok(())
    } else {
        Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "42000".into(),
            format!(
                "invalid channel: {channel} (expected calendar, booking_{{id}} or client_{{id}})"
            ),
        ))))
    }
}

fn varchar(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn client_schema() -> Vec<FieldInfo> {
    vec![varchar("id"), varchar("name"), varchar("email")]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        varchar("id"),
        varchar("client_id"),
        varchar("client_name"),
        varchar("client_email"),
        varchar("title"),
        varchar("description"),
        int8("start"),
        int8("end"),
        int8("duration_minutes"),
        varchar("location"),
        varchar("meeting_url"),
        varchar("notes"),
        varchar("status"),
        int8("created_at"),
        int8("updated_at"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        int8("start"),
        int8("end"),
        FieldInfo::new("is_available".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn booking_rows(bookings: Vec<BookingInfo>) -> Response {
    let schema = Arc::new(booking_schema());
    let rows: Vec<PgWireResult<_>> = bookings
        .into_iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.client_id.map(|c| c.to_string()))?;
            encoder.encode_field(&b.client_name)?;
            encoder.encode_field(&b.client_email)?;
            encoder.encode_field(&b.title)?;
            encoder.encode_field(&b.description)?;
            encoder.encode_field(&b.start)?;
            encoder.encode_field(&b.end)?;
            encoder.encode_field(&b.duration_minutes())?;
            encoder.encode_field(&b.location)?;
            encoder.encode_field(&b.meeting_url)?;
            encoder.encode_field(&b.notes)?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            encoder.encode_field(&b.created_at)?;
            encoder.encode_field(&b.updated_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

/// Result columns for a statement, keyed on the table after `FROM`.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    let table = upper
        .split_once(" FROM ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c| c == '"' || c == ';'))
        .unwrap_or_default();
    match table {
        "AVAILABILITY" => availability_schema(),
        "CLIENTS" => client_schema(),
        "BOOKINGS" | "BOOKING_OVERLAPS" | "UPCOMING_BOOKINGS" => booking_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CalendarHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let responses = self.execute(&engine, cmd).await;
        self.flush_notifications(client).await?;
        responses
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CalendarQueryParser;

#[async_trait]
impl QueryParser for CalendarQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CalendarHandler {
    type Statement = String;
    type QueryParser = CalendarQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let responses = self.execute(&engine, cmd).await;
        self.flush_notifications(client).await?;
        responses?.into_iter().next().ok_or_else(|| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "XX000".into(),
                "command produced no response".into(),
            )))
        })
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Single left-to-right pass, so text inside a bound value is never rescanned.
/// Placeholders with no matching parameter are left as written.
fn bind_params<P: AsRef<[u8]>>(sql: &str, params: &[Option<P>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
        let param = sql[start..end]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| params.get(idx));
        if let Some(param) = param {
            out.push_str(&sql[copied..i]);
            match param {
                Some(value) => {
                    let text = String::from_utf8_lossy(value.as_ref());
                    out.push('\'');
                    out.push_str(&text.replace('\'', "''"));
                    out.push('\'');
                }
                None => out.push_str("NULL"),
            }
            copied = end;
        }
        i = end.max(i + 1);
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CalendarFactory {
    handler: Arc<CalendarHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CalendarAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CalendarFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = CalendarAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CalendarHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CalendarFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::Conflict(_) => "23P01",
        EngineError::InvalidSpan(_) => "22007",
        EngineError::InvalidState { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::WalError(_) => "58030",
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
