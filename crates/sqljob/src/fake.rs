//! A fake job server for tests, which speaks the wire protocol over an
//! in-memory duplex stream and answers a small, fixed set of statements.

use crate::spawn::{Spawner, Transport};
use crate::{CompletionCache, JobConnection, JobContext, SqlRunner};
use serde_json::{json, Value};
use sqljob_protocol::JobOptions;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

/// Returns the job name and a timestamp which is fixed per job.
pub const JOB_NAME_SQL: &str = "values (job_name, current_timestamp)";
/// As JOB_NAME_SQL, but answered only after a delay.
pub const SLOW_JOB_NAME_SQL: &str = "/* slow */ values (job_name, current_timestamp)";
pub const OTHER_SQL: &str = "values 'other'";
/// Twenty-five rows of a single column "N".
pub const NUMBERS_SQL: &str = "select * from sample.numbers";
/// As NUMBERS_SQL, but answered only after a delay.
pub const SLOW_NUMBERS_SQL: &str = "/* slow */ select * from sample.numbers";
/// Rows of NUMBERS_SQL up to its first parameter.
pub const PREPARED_NUMBERS_SQL: &str = "select * from sample.numbers where n <= ?";
/// As NUMBERS_SQL, but further rows are never returned.
pub const STALLED_SQL: &str = "select * from sample.stalled_numbers";
/// CL command upon which the job server exits without answering.
pub const EXIT_CL: &str = "ENDJOB JOB(*) OPTION(*IMMED)";

pub const VERSION: &str = "1.4.2";
pub const TRACE_DATA: &str = "<html><body>trace</body></html>";

/// Options which the fake job server refuses to connect.
pub fn refused_options() -> JobOptions {
    JobOptions {
        extra: [("fail".to_string(), json!(true))].into(),
        ..Default::default()
    }
}

#[derive(Clone, Default)]
pub struct FakeSpawner {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    jobs: AtomicU64,
    requests: Mutex<Vec<Value>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a JobContext having its own QueryRegistry.
    pub fn context(&self) -> JobContext {
        JobContext::new(Arc::new(self.clone()))
    }

    pub fn job(&self, options: JobOptions) -> JobConnection {
        JobConnection::new(options, self.context())
    }

    /// All requests received by job servers of this spawner, in order.
    pub fn requests(&self) -> Vec<Value> {
        self.shared.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Spawner for FakeSpawner {
    async fn spawn(&self) -> anyhow::Result<Transport> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);
        let n = self.shared.jobs.fetch_add(1, Ordering::SeqCst) + 1;

        tokio::spawn(serve(
            self.shared.clone(),
            format!("{n:06}/QUSER/QZDASOINIT"),
            server,
        ));

        Ok(Transport {
            reader: Box::new(reader),
            writer: Box::new(writer),
            guard: None,
        })
    }
}

/// PipeSpawner hands out a single Transport, whose job server is
/// played by the test through the returned PipeServer.
pub struct PipeSpawner {
    transport: Mutex<Option<Transport>>,
}

pub struct PipeServer {
    /// Requests written by the job.
    pub requests: tokio::io::BufReader<tokio::io::DuplexStream>,
    /// Output of the job server, read by the job.
    pub responses: tokio::io::DuplexStream,
}

impl PipeSpawner {
    pub fn new() -> (Self, PipeServer) {
        let (writer, requests) = tokio::io::duplex(64 * 1024);
        let (reader, responses) = tokio::io::duplex(64 * 1024);

        let spawner = Self {
            transport: Mutex::new(Some(Transport {
                reader: Box::new(reader),
                writer: Box::new(writer),
                guard: None,
            })),
        };
        let server = PipeServer {
            requests: tokio::io::BufReader::new(requests),
            responses,
        };
        (spawner, server)
    }
}

#[async_trait::async_trait]
impl Spawner for PipeSpawner {
    async fn spawn(&self) -> anyhow::Result<Transport> {
        match self.transport.lock().unwrap().take() {
            Some(transport) => Ok(transport),
            None => anyhow::bail!("job server was already spawned"),
        }
    }
}

impl PipeServer {
    pub async fn next_request(&mut self) -> Value {
        let mut line = String::new();
        self.requests.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    pub async fn respond(&mut self, response: Value) {
        let mut line = serde_json::to_vec(&response).unwrap();
        line.push(b'\n');
        self.responses.write_all(&line).await.unwrap();
    }

    /// Answer the connect request of a job.
    pub async fn accept(&mut self) {
        let request = self.next_request().await;
        assert_eq!(request["type"], json!("connect"));
        self.respond(json!({"id": request["id"], "success": true, "job": "000001/QUSER/QZDASOINIT"}))
            .await;
    }
}

enum Reply {
    Now(Value),
    After(Duration, Value),
    Never,
    Exit,
}

struct Cursor {
    rows: Vec<Value>,
    terse: bool,
    stalled: bool,
}

struct Server {
    job: String,
    timestamp: String,
    cursors: HashMap<String, Cursor>,
}

async fn serve(shared: Arc<Shared>, job: String, stream: tokio::io::DuplexStream) {
    let (reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();

    tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_vec(&response).unwrap();
            line.push(b'\n');
            if writer.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut server = Server {
        job,
        timestamp: "2026-01-01-12.00.00.000000".to_string(),
        cursors: HashMap::new(),
    };
    let mut lines = tokio::io::BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let request: Value = serde_json::from_str(&line).unwrap();
        shared.requests.lock().unwrap().push(request.clone());

        match server.handle(&request) {
            Reply::Now(response) => {
                let _ = tx.send(response);
            }
            Reply::After(delay, response) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(response);
                });
            }
            Reply::Never => (),
            Reply::Exit => break,
        }
    }
}

impl Server {
    fn handle(&mut self, request: &Value) -> Reply {
        let id = request["id"].as_str().unwrap_or_default().to_string();
        let terse = request["terse"].as_bool().unwrap_or_default();
        let rows = request["rows"].as_u64().unwrap_or(100) as usize;

        match request["type"].as_str().unwrap_or_default() {
            "connect" => {
                if request["props"].as_str().unwrap_or_default().contains("fail=true") {
                    Reply::Now(failure(&id, "connection refused by job server"))
                } else {
                    Reply::Now(json!({"id": id, "success": true, "job": self.job}))
                }
            }
            "sql" | "prepare_sql_execute" => {
                let sql = request["sql"].as_str().unwrap_or_default();
                self.statement(id, sql, &request["parameters"], terse, rows)
            }
            "sqlmore" => {
                let cont_id = request["cont_id"].as_str().unwrap_or_default();
                match self.cursors.get(cont_id).map(|cursor| cursor.stalled) {
                    None => Reply::Now(failure(&id, "Invalid continuation id")),
                    Some(true) => Reply::Never,
                    Some(false) => {
                        let Cursor { rows: rest, terse, .. } = self.cursors.remove(cont_id).unwrap();
                        Reply::Now(self.page(&id, cont_id, rest, terse, rows))
                    }
                }
            }
            "sqlclose" => {
                let cont_id = request["cont_id"].as_str().unwrap_or_default();
                match self.cursors.remove(cont_id) {
                    Some(_) => Reply::Now(json!({"id": id, "success": true})),
                    None => Reply::Now(failure(&id, "Invalid continuation id")),
                }
            }
            "cl" => {
                let cmd = request["cmd"].as_str().unwrap_or_default();
                if cmd == EXIT_CL {
                    Reply::Exit
                } else if cmd.contains("(FAIL)") {
                    let mut response = failure(&id, "[CPF2110] Library FAIL not found.");
                    response["is_done"] = json!(true);
                    Reply::Now(response)
                } else {
                    Reply::Now(json!({
                        "id": id,
                        "success": true,
                        "is_done": true,
                        "has_results": true,
                        "data": [{"MESSAGE_ID": "CPC2101", "MESSAGE_TEXT": "Library list changed."}],
                    }))
                }
            }
            "getversion" => Reply::Now(json!({
                "id": id,
                "success": true,
                "build_date": "2026-01-01",
                "version": VERSION,
            })),
            "gettracedata" => Reply::Now(json!({"id": id, "success": true, "tracedata": TRACE_DATA})),
            "setconfig" => Reply::Now(json!({
                "id": id,
                "success": true,
                "tracedest": request["tracedest"],
                "tracelevel": request["tracelevel"],
            })),
            "exit" => Reply::Exit,
            other => Reply::Now(failure(&id, &format!("unknown request type {other:?}"))),
        }
    }

    fn statement(&mut self, id: String, sql: &str, parameters: &Value, terse: bool, rows: usize) -> Reply {
        if let Some(sql) = sql.strip_prefix("/* slow */ ") {
            return match self.statement(id, sql, parameters, terse, rows) {
                Reply::Now(response) => Reply::After(Duration::from_millis(20), response),
                reply => reply,
            };
        }
        let numbers = |limit: u64| -> Vec<Value> { (1..=limit).map(|n| json!({"N": n})).collect() };
        let upper = sql.to_uppercase();

        let result = match sql {
            JOB_NAME_SQL => vec![json!({"00001": self.job, "00002": self.timestamp})],
            OTHER_SQL => vec![json!({"00001": "other"})],
            NUMBERS_SQL | STALLED_SQL => numbers(25),
            PREPARED_NUMBERS_SQL => numbers(parameters[0].as_u64().unwrap_or(25)),
            "hang" => return Reply::Never,
            _ if upper.starts_with("CREATE ") || upper.starts_with("CALL QSYS2.CANCEL_SQL") => {
                Vec::new()
            }
            _ if upper.starts_with("SET SYSIBMADM.SELFCODES") && upper.contains("*WARNING") => {
                let mut response = failure(&id, "[SQL0171] Argument 1 of function VALIDATE_SELF not valid.");
                response["sql_state"] = json!("42815");
                response["sql_rc"] = json!(-171);
                return Reply::Now(response);
            }
            _ if upper.starts_with("SET ") => Vec::new(),
            // Statements of other jobs have already stopped.
            _ if upper.starts_with("SELECT V_SQL_STMT_STATUS") => vec![json!({"STATUS": null})],
            _ => {
                let token = upper.split_whitespace().next().unwrap_or_default();
                let mut response = failure(&id, &format!("[SQL0104] Token {token} was not valid."));
                response["sql_state"] = json!("42601");
                response["sql_rc"] = json!(-104);
                return Reply::Now(response);
            }
        };

        if sql == STALLED_SQL {
            let response = self.page(&id, &id, result, terse, rows);
            if let Some(cursor) = self.cursors.get_mut(&id) {
                cursor.stalled = true;
            }
            return Reply::Now(response);
        }
        Reply::Now(self.page(&id, &id, result, terse, rows))
    }

    // Build a page of up to `take` rows, retaining a cursor
    // under `cont_id` if rows remain.
    fn page(&mut self, id: &str, cont_id: &str, mut rows: Vec<Value>, terse: bool, take: usize) -> Value {
        let rest = rows.split_off(take.min(rows.len()));
        let is_done = rest.is_empty();

        let columns: Vec<Value> = rows
            .first()
            .and_then(Value::as_object)
            .map(|row| {
                row.keys()
                    .map(|name| json!({"name": name, "type": "VARCHAR", "display_size": 32, "label": name}))
                    .collect()
            })
            .unwrap_or_default();

        let data: Vec<Value> = rows
            .into_iter()
            .map(|row| match (terse, row) {
                (true, Value::Object(row)) => Value::Array(row.into_iter().map(|(_, v)| v).collect()),
                (_, row) => row,
            })
            .collect();

        if !is_done {
            self.cursors.insert(
                cont_id.to_string(),
                Cursor {
                    rows: rest,
                    terse,
                    stalled: false,
                },
            );
        }

        json!({
            "id": id,
            "success": true,
            "metadata": {"column_count": columns.len(), "columns": columns, "job": self.job},
            "is_done": is_done,
            "has_results": !data.is_empty(),
            "update_count": -1,
            "data": data,
        })
    }
}

fn failure(id: &str, error: &str) -> Value {
    json!({"id": id, "success": false, "error": error})
}

/// FakeRunner is a SqlRunner which records its statements. Status polls
/// report the statement as active a fixed number of times.
#[derive(Default)]
pub struct FakeRunner {
    statements: Mutex<Vec<String>>,
    active_polls: AtomicU32,
    fail: bool,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_for(polls: u32) -> Self {
        Self {
            active_polls: AtomicU32::new(polls),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl SqlRunner for FakeRunner {
    async fn run_sql(&self, statement: &str) -> anyhow::Result<Vec<Value>> {
        self.statements.lock().unwrap().push(statement.to_string());

        if self.fail {
            anyhow::bail!("admin connection is unavailable");
        } else if statement.starts_with("CALL ") || statement.starts_with("SET ") {
            Ok(Vec::new())
        } else if statement.starts_with("SELECT V_SQL_STMT_STATUS") {
            let active = self
                .active_polls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            let status = if active { "ACTIVE" } else { "IDLE" };
            Ok(vec![json!({ "STATUS": status })])
        } else {
            Ok(vec![json!({ "00001": statement })])
        }
    }
}

/// RecordingCache is a CompletionCache which records its invalidations.
#[derive(Default)]
pub struct RecordingCache {
    invalidated: Mutex<Vec<(String, String)>>,
}

impl RecordingCache {
    pub fn invalidated(&self) -> Vec<(String, String)> {
        self.invalidated.lock().unwrap().clone()
    }
}

impl CompletionCache for RecordingCache {
    fn invalidate(&self, schema: &str, object: &str) {
        self.invalidated
            .lock()
            .unwrap()
            .push((schema.to_string(), object.to_string()));
    }
}
