use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::StartupHandler;
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
use tracing::debug;

use crate::auth::{Roles, RoomBookStartupHandler};
use crate::engine::{Availability, Engine, EngineError, SchedulingError, Verdict};
use crate::limits::MAX_PARAMS;
use crate::model::*;
use crate::observability::{self, command_label};
use crate::sql::{self, Command, DateArg, SqlError};

pub struct RoomBookHandler {
    engine: Arc<Engine>,
    roles: Roles,
    query_parser: Arc<RoomBookQueryParser>,
}

impl RoomBookHandler {
    pub fn new(engine: Arc<Engine>, roles: Roles) -> Self {
        Self {
            engine,
            roles,
            query_parser: Arc::new(RoomBookQueryParser),
        }
    }

    /// The authenticated login name decides who is asking.
    fn principal<C: ClientInfo>(&self, client: &C) -> PgWireResult<Principal> {
        let user = client
            .metadata()
            .get("user")
            .filter(|u| !u.is_empty())
            .ok_or_else(|| user_error("28000", "no user in startup message".into()))?;
        Ok(self.roles.principal(user))
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, principal: &Principal, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();

        let result = self.execute_command(principal, cmd).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, principal: &Principal, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertRoom {
                id,
                name,
                capacity,
                equipment,
            } => {
                let room = Room {
                    id,
                    name,
                    capacity,
                    equipment,
                };
                engine.create_room(principal, room).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteRoom { id } => {
                engine.delete_room(principal, id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertReservation {
                id,
                room_id,
                start,
                end,
            } => {
                engine
                    .create_reservation(principal, id, room_id, start, end)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteReservation { id } => {
                engine
                    .delete_reservation(principal, id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectRooms { id } => {
                let rooms = match id {
                    Some(id) => vec![engine.get_room(id).await.map_err(engine_err)?],
                    None => engine.list_rooms().await,
                };
                rooms_response(&rooms)
            }
            Command::SelectReservations { room_id } => {
                let reservations = engine
                    .list_reservations(room_id)
                    .await
                    .map_err(engine_err)?;
                reservations_response(&reservations)
            }
            Command::SelectAvailability { room_id, date } => {
                let availability = match date {
                    DateArg::Instant(ms) => engine.availability(room_id, ms).await,
                    DateArg::Day(day) => engine.availability_on(room_id, day).await,
                }
                .map_err(engine_err)?;
                availability_response(&availability)
            }
            Command::SelectReservationCheck {
                room_id,
                start,
                end,
            } => {
                let verdict = engine
                    .check_reservation(room_id, start, end)
                    .await
                    .map_err(engine_err)?;
                check_response(verdict)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn rooms_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("capacity", Type::INT8),
        text_field("equipment", Type::VARCHAR),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("room_id", Type::VARCHAR),
        text_field("user", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("room_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("message", Type::VARCHAR),
    ]
}

fn check_schema() -> Vec<FieldInfo> {
    vec![
        text_field("accepted", Type::BOOL),
        text_field("reason", Type::VARCHAR),
    ]
}

/// Result columns for a statement, judged from the table it reads.
fn result_schema(sql: &str) -> PgWireResult<Vec<FieldInfo>> {
    let schema = match sql::parse_sql(&placeholders_as_literals(sql)?) {
        Ok(Command::SelectRooms { .. }) => rooms_schema(),
        Ok(Command::SelectReservations { .. }) => reservations_schema(),
        Ok(Command::SelectAvailability { .. }) => availability_schema(),
        Ok(Command::SelectReservationCheck { .. }) => check_schema(),
        _ => vec![],
    };
    Ok(schema)
}

fn rooms_response(rooms: &[Room]) -> PgWireResult<Response> {
    let schema = Arc::new(rooms_schema());
    let rows: Vec<PgWireResult<_>> = rooms
        .iter()
        .map(|room| {
            let equipment = serde_json::to_string(&room.equipment)
                .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room.id.to_string())?;
            encoder.encode_field(&room.name)?;
            encoder.encode_field(&i64::from(room.capacity))?;
            encoder.encode_field(&equipment)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn reservations_response(reservations: &[Reservation]) -> PgWireResult<Response> {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = reservations
        .iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.room_id.to_string())?;
            encoder.encode_field(&r.user)?;
            encoder.encode_field(&r.span.start)?;
            encoder.encode_field(&r.span.end)?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

/// One row per free interval. `message` is only set on the all-day row.
fn availability_response(availability: &Availability) -> PgWireResult<Response> {
    let schema = Arc::new(availability_schema());
    let room_id = availability.room_id.to_string();
    let rows: Vec<PgWireResult<_>> = availability
        .available_times
        .iter()
        .map(|slot| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&room_id)?;
            encoder.encode_field(&slot.start)?;
            encoder.encode_field(&slot.end)?;
            encoder.encode_field(&availability.message)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn check_response(verdict: Verdict) -> PgWireResult<Response> {
    let schema = Arc::new(check_schema());
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&verdict.accepted)?;
    encoder.encode_field(&verdict.reason.map(|r| r.as_str()))?;
    let rows = vec![Ok(encoder.take_row())];
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

#[async_trait]
impl SimpleQueryHandler for RoomBookHandler {
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
        let principal = self.principal(client)?;
        Ok(vec![self.run(&principal, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RoomBookQueryParser;

#[async_trait]
impl QueryParser for RoomBookQueryParser {
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
        Ok(vec![Type::VARCHAR; count_params(stmt)?])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        result_schema(stmt)
    }
}

#[async_trait]
impl ExtendedQueryHandler for RoomBookHandler {
    type Statement = String;
    type QueryParser = RoomBookQueryParser;

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
        let principal = self.principal(client)?;
        let sql = substitute_params(portal)?;
        self.run(&principal, &sql).await
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
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)?];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement)?,
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
        )?))
    }
}

/// Highest `$N` placeholder in the SQL string. Indexes past `MAX_PARAMS`
/// are refused before anything is sized by them.
fn count_params(sql: &str) -> PgWireResult<usize> {
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
            let digits = &sql[start..i];
            if digits.is_empty() {
                continue;
            }
            match digits.parse::<usize>() {
                Ok(n) if n <= MAX_PARAMS => max = max.max(n),
                _ => return Err(too_many_params(digits)),
            }
        } else {
            i += 1;
        }
    }
    Ok(max)
}

fn too_many_params(index: &str) -> PgWireError {
    user_error(
        "42601",
        format!("placeholder ${index} exceeds the limit of {MAX_PARAMS} parameters"),
    )
}

/// Splice bound text-format parameters into the statement as quoted literals.
/// Numeric columns accept quoted numbers, so every value is quoted.
fn substitute_params(portal: &Portal<String>) -> PgWireResult<String> {
    let bound = portal.parameters.len();
    if bound > MAX_PARAMS {
        return Err(too_many_params(&bound.to_string()));
    }
    let values: Vec<String> = portal
        .parameters
        .iter()
        .map(|param| match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        })
        .collect();
    Ok(replace_placeholders(&portal.statement.statement, &values))
}

/// Describe runs before any values are bound. Twenty-six zeros read as both
/// the nil ULID and the integer 0, so every filter still parses.
fn placeholders_as_literals(sql: &str) -> PgWireResult<String> {
    let zeros = vec![format!("'{}'", "0".repeat(26)); count_params(sql)?];
    Ok(replace_placeholders(sql, &zeros))
}

/// Highest index first so `$1` never eats the prefix of `$10`.
fn replace_placeholders(sql: &str, values: &[String]) -> String {
    let mut result = sql.to_string();
    for (i, value) in values.iter().enumerate().rev() {
        result = result.replace(&format!("${}", i + 1), value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RoomBookFactory {
    handler: Arc<RoomBookHandler>,
    auth_handler: Arc<RoomBookStartupHandler>,
    noop: Arc<NoopHandler>,
}

impl RoomBookFactory {
    pub fn new(engine: Arc<Engine>, roles: Roles, auth: RoomBookStartupHandler) -> Self {
        Self {
            handler: Arc::new(RoomBookHandler::new(engine, roles)),
            auth_handler: Arc::new(auth),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RoomBookFactory {
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

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<RoomBookFactory>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::Scheduling(SchedulingError::Conflict { .. }) => "23P01",
        EngineError::Duplicate(_) | EngineError::AlreadyExists(_) => "23505",
        EngineError::Forbidden(_) => "42501",
        EngineError::NotFound(_) => "P0002",
        EngineError::Scheduling(SchedulingError::InvalidInput(_))
        | EngineError::Scheduling(SchedulingError::TimeRangeInvalid { .. }) => "22023",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Scheduling(SchedulingError::Upstream(_)) | EngineError::WalError(_) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = sqlstate(&e);
    debug!(code, error = %e, "statement failed");
    user_error(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    #[test]
    fn counts_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM rooms").unwrap(), 0);
        assert_eq!(count_params("DELETE FROM rooms WHERE id = $1").unwrap(), 1);
        assert_eq!(
            count_params(r#"INSERT INTO reservations (id, room_id, start, "end") VALUES ($1, $2, $4, $3)"#)
                .unwrap(),
            4
        );
        assert_eq!(count_params("SELECT $ FROM x").unwrap(), 0);
    }

    fn code_of(err: PgWireError) -> String {
        match err {
            PgWireError::UserError(info) => info.code,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_placeholder_index_refused() {
        let at_limit = format!("DELETE FROM rooms WHERE id = ${MAX_PARAMS}");
        assert_eq!(count_params(&at_limit).unwrap(), MAX_PARAMS);

        for sql in [
            format!("DELETE FROM rooms WHERE id = ${}", MAX_PARAMS + 1),
            "SELECT * FROM reservations WHERE room_id = $3000000000".to_string(),
            "SELECT * FROM rooms WHERE id = $99999999999999999999999999".to_string(),
        ] {
            assert_eq!(code_of(count_params(&sql).unwrap_err()), "42601", "{sql}");
            assert_eq!(code_of(result_schema(&sql).unwrap_err()), "42601", "{sql}");
        }
    }

    #[test]
    fn placeholders_replaced_without_prefix_clash() {
        let values: Vec<String> = (1..=10).map(|i| format!("'v{i}'")).collect();
        let sql = replace_placeholders("$1 $10 $2", &values);
        assert_eq!(sql, "'v1' 'v10' 'v2'");
    }

    #[test]
    fn schema_follows_table() {
        let names = |fields: Vec<FieldInfo>| -> Vec<String> {
            fields.iter().map(|f| f.name().to_string()).collect()
        };
        let schema = |sql: &str| result_schema(sql).unwrap();
        assert_eq!(names(schema("SELECT * FROM rooms")), ["id", "name", "capacity", "equipment"]);
        assert_eq!(
            names(schema("SELECT * FROM availability WHERE room_id = $1 AND date = $2")),
            ["room_id", "start", "end", "message"]
        );
        assert_eq!(
            names(schema(
                r#"SELECT * FROM reservation_check WHERE room_id = $1 AND start = $2 AND "end" = $3"#
            )),
            ["accepted", "reason"]
        );
        assert!(schema("DELETE FROM rooms WHERE id = $1").is_empty());
    }

    #[test]
    fn sqlstate_mapping() {
        let id = Ulid::new();
        let conflict = EngineError::Scheduling(SchedulingError::Conflict {
            room_id: id,
            with: vec![],
        });
        assert_eq!(sqlstate(&conflict), "23P01");
        assert_eq!(sqlstate(&EngineError::Duplicate(id)), "23505");
        assert_eq!(sqlstate(&EngineError::Forbidden("x")), "42501");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        let range = EngineError::Scheduling(SchedulingError::TimeRangeInvalid {
            start: 2,
            end: 1,
            now: 0,
        });
        assert_eq!(sqlstate(&range), "22023");
        assert_eq!(sqlstate(&EngineError::LimitExceeded("x")), "54000");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "XX000");
    }
}
