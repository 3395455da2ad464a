use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use ulid::Ulid;

use crate::auth::TallyAuthSource;
use crate::engine::Engine;
use crate::observability;
use crate::sql::{self, Command};

pub struct TallyHandler {
    engine: Arc<Engine>,
    query_parser: Arc<TallyQueryParser>,
}

impl TallyHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(TallyQueryParser),
        }
    }

    async fn run(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertMember { id, name } => {
                engine.register_member(id, name).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertSubscription { id, member_id, plan, starts_on, ends_on } => {
                engine
                    .activate_subscription(id, member_id, plan, starts_on, ends_on)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::CloseSubscription { id } => {
                engine.close_subscription(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertEntitlements { rows } => {
                let count = rows.len();
                engine.grant_entitlements(rows).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(count))])
            }
            Command::InsertResource { id, name, capacity, benefit } => {
                engine
                    .create_resource(id, name, capacity, benefit)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateResource { id, name, capacity } => {
                engine.update_resource(id, name, capacity).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::RetireResource { id } => {
                engine.retire_resource(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertSlot { id, resource_id, weekday, start, end } => {
                engine
                    .add_slot(id, resource_id, weekday, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::RetireSlot { id } => {
                engine.retire_slot(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::InsertReservation { id, member_id, resource_id, slot_id, date, returning } => {
                let receipt = engine
                    .create_reservation(id, member_id, resource_id, slot_id, date)
                    .await
                    .map_err(engine_err)?;
                if !returning {
                    return Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))]);
                }
                let schema = Arc::new(receipt_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&receipt.reservation_id.to_string())?;
                encoder.encode_field(&receipt.resource_name)?;
                encoder.encode_field(&receipt.date.to_string())?;
                encoder.encode_field(&receipt.start.to_string())?;
                encoder.encode_field(&receipt.end.to_string())?;
                encoder.encode_field(&receipt.remaining_credits.map(|c| c as i32))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::CancelReservation { id, actor, reason } => {
                engine.cancel_reservation(id, actor, reason).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::MarkAttended { id, actor } => {
                engine.mark_attended(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::MarkNoShow { id, actor } => {
                engine.mark_no_show(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectAvailability { resource_id, date } => {
                let slots = engine
                    .list_available_slots(resource_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.slot_id.to_string())?;
                        encoder.encode_field(&s.start.to_string())?;
                        encoder.encode_field(&s.end.to_string())?;
                        encoder.encode_field(&(s.booked_count as i32))?;
                        encoder.encode_field(&(s.available_spots as i32))?;
                        encoder.encode_field(&bool_text(s.is_full))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectMemberReservations { member_id, status, max_rows } => {
                let summaries = engine
                    .member_reservations(member_id, status, max_rows)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = summaries
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.resource_id.to_string())?;
                        encoder.encode_field(&r.resource_name)?;
                        encoder.encode_field(&r.slot_id.to_string())?;
                        encoder.encode_field(&r.date.to_string())?;
                        encoder.encode_field(&r.start.to_string())?;
                        encoder.encode_field(&r.end.to_string())?;
                        encoder.encode_field(&r.status.label().to_string())?;
                        encoder.encode_field(&r.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectCalendar { resource_ids, from, to } => {
                let entries = engine
                    .reservations_in_range(resource_ids, from, to)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(calendar_schema());
                let rows: Vec<PgWireResult<_>> = entries
                    .into_iter()
                    .map(|e| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&e.reservation_id.to_string())?;
                        encoder.encode_field(&e.member_id.to_string())?;
                        encoder.encode_field(&e.member_name)?;
                        encoder.encode_field(&e.resource_id.to_string())?;
                        encoder.encode_field(&e.resource_name)?;
                        encoder.encode_field(&e.slot_id.to_string())?;
                        encoder.encode_field(&e.date.to_string())?;
                        encoder.encode_field(&e.start.to_string())?;
                        encoder.encode_field(&e.end.to_string())?;
                        encoder.encode_field(&e.status.label().to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectLedger { member_id } => {
                let balances = engine.ledger_balances(member_id).await.map_err(engine_err)?;
                let schema = Arc::new(ledger_schema());
                let rows: Vec<PgWireResult<_>> = balances
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.entry_id.to_string())?;
                        encoder.encode_field(&b.benefit)?;
                        encoder.encode_field(&(b.allocated as i32))?;
                        encoder.encode_field(&(b.used as i32))?;
                        encoder.encode_field(&(b.remaining as i32))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectResources => {
                let resources = engine.list_resources().await;
                let schema = Arc::new(resources_schema());
                let rows: Vec<PgWireResult<_>> = resources
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.name)?;
                        encoder.encode_field(&(r.max_capacity as i32))?;
                        encoder.encode_field(&bool_text(r.is_active))?;
                        encoder.encode_field(&r.linked_benefit)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { channel } => {
                let resource_id_str = channel.strip_prefix("reservations_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected reservations_{{id}})"),
                    )))
                })?;
                let _resource_id = Ulid::from_string(resource_id_str).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("bad ULID in channel: {e}"),
                    )))
                })?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
        }
    }
}

/// Postgres text convention for booleans.
fn bool_text(v: bool) -> String {
    if v { "t" } else { "f" }.to_string()
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int4_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT4, FieldFormat::Text)
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        text_field("reservation_id"),
        text_field("resource_name"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        int4_field("remaining_credits"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("slot_id"),
        text_field("start"),
        text_field("end"),
        int4_field("booked_count"),
        int4_field("available_spots"),
        FieldInfo::new("is_full".into(), None, None, Type::BOOL, FieldFormat::Text),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("resource_id"),
        text_field("resource_name"),
        text_field("slot_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
        FieldInfo::new("created_at".into(), None, None, Type::INT8, FieldFormat::Text),
    ]
}

fn calendar_schema() -> Vec<FieldInfo> {
    vec![
        text_field("reservation_id"),
        text_field("member_id"),
        text_field("member_name"),
        text_field("resource_id"),
        text_field("resource_name"),
        text_field("slot_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
    ]
}

fn ledger_schema() -> Vec<FieldInfo> {
    vec![
        text_field("entry_id"),
        text_field("benefit"),
        int4_field("allocated"),
        int4_field("used"),
        int4_field("remaining"),
    ]
}

fn resources_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        int4_field("max_capacity"),
        FieldInfo::new("is_active".into(), None, None, Type::BOOL, FieldFormat::Text),
        text_field("linked_benefit"),
    ]
}

/// Result schema for Describe, inferred from the statement text alone.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if upper.contains("RETURNING") && upper.contains("RESERVATIONS") {
        receipt_schema()
    } else if upper.contains("SELECT") && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("SELECT") && upper.contains("CALENDAR") {
        calendar_schema()
    } else if upper.contains("SELECT") && upper.contains("LEDGER") {
        ledger_schema()
    } else if upper.contains("SELECT") && upper.contains("RESERVATIONS") {
        reservations_schema()
    } else if upper.contains("SELECT") && upper.contains("RESOURCES") {
        resources_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for TallyHandler {
    async fn do_query<C>(&self, _client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct TallyQueryParser;

#[async_trait]
impl QueryParser for TallyQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for TallyHandler {
    type Statement = String;
    type QueryParser = TallyQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
        Ok(responses.remove(0))
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
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
                && n > max
            {
                max = n;
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct TallyFactory {
    handler: Arc<TallyHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<TallyAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl TallyFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = TallyAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(TallyHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for TallyFactory {
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

/// Run one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(TallyFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory)
        .await
        .map_err(io::Error::other)
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
