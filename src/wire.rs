use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
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
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;
use ulid::Ulid;

use crate::auth::SlotkeeperAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

const CHANNEL_PREFIX: &str = "provider_";

/// Query handler for one client connection. LISTEN subscriptions live here,
/// so the factory builds a fresh handler per socket.
pub struct SlotkeeperHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotkeeperQueryParser>,
    listeners: Mutex<HashMap<String, broadcast::Receiver<Event>>>,
}

impl SlotkeeperHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotkeeperQueryParser),
            listeners: Mutex::new(HashMap::new()),
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

    /// Parse and execute one statement, recording RED metrics.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertProvider { id, name } => {
                engine.create_provider(id, name).await.map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteProvider { id } => {
                engine.delete_provider(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertSchedule {
                provider_id,
                schedule,
            } => {
                engine
                    .set_schedule(provider_id, schedule)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::InsertService {
                id,
                provider_id,
                name,
                duration_minutes,
                price,
            } => {
                engine
                    .upsert_service(id, provider_id, name, duration_minutes, price)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag()])
            }
            Command::DeleteService { id } => {
                engine.remove_service(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertAppointment(req) => {
                // A replayed idempotency key answers with the original booking,
                // so the client learns the id that actually exists.
                let stored = engine.create_appointment(req).await.map_err(engine_err)?;
                Ok(vec![appointment_rows(vec![stored])])
            }
            Command::UpdateAppointmentStatus { id, status } => {
                engine
                    .set_appointment_status(id, status)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RescheduleAppointment { id, start } => {
                engine
                    .reschedule_appointment(id, start)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectFreeSlots {
                provider_id,
                date,
                duration,
            } => {
                let free = engine
                    .list_free_slots(provider_id, date, duration)
                    .await
                    .map_err(engine_err)?;
                let starts: Vec<String> = free.free_starts.iter().map(|m| format_hhmm(*m)).collect();
                Ok(vec![rows(free_slots_schema(), [free], |enc, free| {
                    enc.encode_field(&free.closed)?;
                    enc.encode_field(&free.has_availability())?;
                    enc.encode_field(&starts.join(","))
                })])
            }
            Command::SelectDisabledHours {
                provider_id,
                date,
                duration,
            } => {
                let mask = engine
                    .disabled_mask(provider_id, date, duration)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(disabled_hours_schema(), [mask], |enc, mask| {
                    enc.encode_field(&mask.closed)?;
                    enc.encode_field(&mask.has_available_time)?;
                    enc.encode_field(&mask.disabled_hours.join(","))
                })])
            }
            Command::SelectIntervalFree {
                provider_id,
                start,
                duration_minutes,
            } => {
                let free = engine
                    .is_interval_free(provider_id, start, duration_minutes)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![rows(interval_free_schema(), [free], |enc, free| {
                    enc.encode_field(&free)
                })])
            }
            Command::SelectProviders => {
                let providers = engine.list_providers().await;
                Ok(vec![rows(providers_schema(), providers, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.name)?;
                    enc.encode_field(&p.has_schedule)?;
                    enc.encode_field(&(p.service_count as i64))
                })])
            }
            Command::SelectServices { provider_id } => {
                let services = engine.list_services(provider_id).await.map_err(engine_err)?;
                Ok(vec![rows(services_schema(), services, |enc, s| {
                    enc.encode_field(&s.id.to_string())?;
                    enc.encode_field(&s.provider_id.to_string())?;
                    enc.encode_field(&s.name)?;
                    enc.encode_field(&i64::from(s.duration_minutes))?;
                    enc.encode_field(&s.price)
                })])
            }
            Command::SelectSchedule { provider_id } => {
                let schedule = engine.load_schedule(provider_id).await.map_err(engine_err)?;
                Ok(vec![rows(schedules_schema(), schedule, |enc, s| {
                    enc.encode_field(&provider_id.to_string())?;
                    enc.encode_field(&sql::schedule_to_json(&s))
                })])
            }
            Command::SelectAppointment { id } => {
                let appointment = engine.get_appointment(id).await.map_err(engine_err)?;
                Ok(vec![appointment_rows(vec![appointment])])
            }
            Command::SelectAppointments { provider_id, date } => {
                let appointments = engine
                    .list_appointments(provider_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![appointment_rows(appointments)])
            }
            Command::SelectSummary { provider_id } => {
                let summary = engine
                    .appointment_summary(provider_id)
                    .await
                    .map_err(engine_err)?;
                let by_service = serde_json::to_string(&summary.by_service)
                    .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                Ok(vec![rows(summary_schema(), [summary], |enc, s| {
                    enc.encode_field(&(s.total as i64))?;
                    enc.encode_field(&(s.pending as i64))?;
                    enc.encode_field(&(s.confirmed as i64))?;
                    enc.encode_field(&(s.cancelled as i64))?;
                    enc.encode_field(&by_service)
                })])
            }
            Command::Listen { channel } => {
                let provider_id = channel_provider(&channel)?;
                let rx = engine.notify.subscribe(provider_id);
                self.listeners().insert(channel, rx);
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                self.listeners().remove(&channel);
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
            Command::UnlistenAll => {
                self.listeners().clear();
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    fn listeners(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Receiver<Event>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take every event queued on this connection's channels as (channel, payload).
    /// Channels whose provider was deleted are dropped once drained.
    fn drain_notifications(&self) -> Vec<(String, String)> {
        let mut pending = Vec::new();
        self.listeners().retain(|channel, rx| loop {
            match rx.try_recv() {
                Ok(event) => pending.push((channel.clone(), notification_payload(&event))),
                Err(TryRecvError::Empty) => break true,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(channel = %channel, skipped, "listener lagged, notifications dropped");
                }
                Err(TryRecvError::Closed) => break false,
            }
        });
        pending
    }

    async fn flush_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for (channel, payload) in self.drain_notifications() {
            let msg = NotificationResponse::new(std::process::id() as i32, channel, payload);
            client
                .send(PgWireBackendMessage::NotificationResponse(msg))
                .await?;
        }
        Ok(())
    }
}

fn channel_provider(channel: &str) -> PgWireResult<Ulid> {
    let id = channel.strip_prefix(CHANNEL_PREFIX).ok_or_else(|| {
        user_error(
            "42000",
            format!("invalid channel: {channel} (expected {CHANNEL_PREFIX}{{id}})"),
        )
    })?;
    Ulid::from_string(id).map_err(|e| user_error("42000", format!("bad ULID in channel: {e}")))
}

fn notification_payload(event: &Event) -> String {
    serde_json::to_string(event).unwrap_or_else(|_| event.kind().to_string())
}

fn insert_tag() -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(1))
}

/// One row per item, encoded in schema order.
fn rows<T>(
    schema: Vec<FieldInfo>,
    items: impl IntoIterator<Item = T>,
    mut encode: impl FnMut(&mut DataRowEncoder, T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<DataRow>> = items
        .into_iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

fn appointment_rows(appointments: Vec<Appointment>) -> Response {
    rows(appointments_schema(), appointments, |enc, a| {
        enc.encode_field(&a.id.to_string())?;
        enc.encode_field(&a.provider_id.to_string())?;
        enc.encode_field(&a.service_id.map(|id| id.to_string()))?;
        enc.encode_field(&a.service_name)?;
        enc.encode_field(&a.start)?;
        enc.encode_field(&a.span().end)?;
        enc.encode_field(&a.status.as_str().to_string())?;
        enc.encode_field(&a.customer_name)?;
        enc.encode_field(&a.customer_phone)
    })
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn free_slots_schema() -> Vec<FieldInfo> {
    vec![
        field("closed", Type::BOOL),
        field("has_availability", Type::BOOL),
        field("free_starts", Type::VARCHAR),
    ]
}

fn disabled_hours_schema() -> Vec<FieldInfo> {
    vec![
        field("closed", Type::BOOL),
        field("has_available_time", Type::BOOL),
        field("disabled_hours", Type::VARCHAR),
    ]
}

fn interval_free_schema() -> Vec<FieldInfo> {
    vec![field("free", Type::BOOL)]
}

fn providers_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("has_schedule", Type::BOOL),
        field("service_count", Type::INT8),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("provider_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("duration", Type::INT8),
        field("price", Type::INT8),
    ]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        field("provider_id", Type::VARCHAR),
        field("schedule", Type::VARCHAR),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("provider_id", Type::VARCHAR),
        field("service_id", Type::VARCHAR),
        field("service_name", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("status", Type::VARCHAR),
        field("customer_name", Type::VARCHAR),
        field("customer_phone", Type::VARCHAR),
    ]
}

fn summary_schema() -> Vec<FieldInfo> {
    vec![
        field("total", Type::INT8),
        field("pending", Type::INT8),
        field("confirmed", Type::INT8),
        field("cancelled", Type::INT8),
        field("by_service", Type::VARCHAR),
    ]
}

/// Result columns of a statement, judged from its FROM or INTO table so that
/// statements with unbound `$n` parameters can be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    let marker = match words.next() {
        Some(w) if w.eq_ignore_ascii_case("SELECT") => "FROM",
        Some(w) if w.eq_ignore_ascii_case("INSERT") => "INTO",
        _ => return vec![],
    };
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case(marker))
        .nth(1)
        .map(|t| {
            let t = t.split('(').next().unwrap_or(t);
            t.trim_end_matches(';').trim_matches('"').to_lowercase()
        });
    if marker == "INTO" {
        // Only bookings answer an INSERT with a row.
        return match table.as_deref() {
            Some("appointments") => appointments_schema(),
            _ => vec![],
        };
    }
    match table.as_deref() {
        Some("free_slots") => free_slots_schema(),
        Some("disabled_hours") => disabled_hours_schema(),
        Some("interval_free") => interval_free_schema(),
        Some("providers") => providers_schema(),
        Some("services") => services_schema(),
        Some("schedules") => schedules_schema(),
        Some("appointments") => appointments_schema(),
        Some("summary") => summary_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotkeeperHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let result = self.run(&engine, query).await;
        self.flush_notifications(client).await?;
        result
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotkeeperQueryParser;

#[async_trait]
impl QueryParser for SlotkeeperQueryParser {
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
impl ExtendedQueryHandler for SlotkeeperHandler {
    type Statement = String;
    type QueryParser = SlotkeeperQueryParser;

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
        let result = self.run(&engine, &sql).await;
        self.flush_notifications(client).await?;
        result?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("P0001", "statement produced no response".into()))
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
            if let Ok(n) = sql[start..i].parse::<usize>() {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
/// Highest index first so `$1` never eats the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotkeeperFactory {
    handler: Arc<SlotkeeperHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SlotkeeperAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotkeeperFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotkeeperAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotkeeperHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotkeeperFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls_acceptor: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = SlotkeeperFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls_acceptor, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error. Clients retry on `40001`.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotConflict { .. } => "23P01",
        EngineError::NotFound(_) | EngineError::NoSchedule(_) => "P0002",
        EngineError::InvalidInput(_) | EngineError::InvalidSchedule(_) => "22023",
        EngineError::TransientStore(_) => "40001",
        EngineError::AlreadyExists(_)
        | EngineError::Unavailable { .. }
        | EngineError::InvalidTransition { .. }
        | EngineError::LimitExceeded(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if e.is_retryable() {
        warn!("store commit failed, client may retry: {e}");
    }
    user_error(engine_sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(_) => "22023",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_index() {
        assert_eq!(count_params("SELECT * FROM providers"), 0);
        assert_eq!(
            count_params("SELECT * FROM free_slots WHERE provider_id = $1 AND date = $2 AND service_id = $3"),
            3
        );
        assert_eq!(count_params("UPDATE appointments SET start = $2 WHERE id = $1"), 2);
    }

    #[test]
    fn schema_follows_from_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(
            names("select * from free_slots where provider_id = $1"),
            ["closed", "has_availability", "free_starts"]
        );
        assert_eq!(names("SELECT * FROM summary WHERE provider_id = $1;")[0], "total");
        assert!(names("INSERT INTO providers (id) VALUES ($1)").is_empty());
        assert_eq!(
            names("INSERT INTO appointments(id, provider_id, service_id, start) VALUES ($1, $2, $3, $4)")[0],
            "id"
        );
        assert!(names("SELECT 1").is_empty());
    }

    #[test]
    fn channel_parsing() {
        let id = Ulid::new();
        assert_eq!(channel_provider(&format!("provider_{id}")).unwrap(), id);
        assert!(channel_provider(&format!("resource_{id}")).is_err());
        assert!(channel_provider("provider_nope").is_err());
    }

    #[test]
    fn sqlstate_mapping() {
        let id = Ulid::new();
        let span = Span::new(0, 60_000);
        assert_eq!(engine_sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::NoSchedule(id)), "P0002");
        assert_eq!(engine_sqlstate(&EngineError::InvalidInput("x".into())), "22023");
        assert_eq!(engine_sqlstate(&EngineError::TransientStore("io".into())), "40001");
        assert_eq!(
            engine_sqlstate(&EngineError::Unavailable {
                requested: span,
                reason: crate::engine::UnavailableReason::DayClosed,
            }),
            "P0001"
        );
        assert_eq!(engine_sqlstate(&EngineError::LimitExceeded("too many")), "P0001");
    }
}
