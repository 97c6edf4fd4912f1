//! Purpose: End-to-end tests for the HTTP/JSON server.
//! Exports: None (integration test module).
//! Role: Validate table routes, transaction routes, auth, and error envelopes across TCP.
//! Invariants: Uses loopback-only server with temp table directory.
//! Invariants: Bounded waits avoid test flakiness.
//! Invariants: Server processes are cleaned up on drop.

use serde_json::{Value, json};
use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    child: Child,
    base_url: String,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(table_dir: &std::path::Path) -> TestResult<Self> {
        Self::start_with_token(table_dir, None)
    }

    fn start_with_token(table_dir: &std::path::Path, token: Option<&str>) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");
            let base_url = format!("http://{bind}");

            let mut command = Command::new(env!("CARGO_BIN_EXE_tabula"));
            command
                .arg("--dir")
                .arg(table_dir)
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .stdout(Stdio::null())
                .stderr(Stdio::piped());
            if let Some(token) = token {
                command.arg("--token").arg(token);
            }
            let mut child = command.spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url,
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn expect_error(result: Result<ureq::Response, ureq::Error>, status: u16) -> TestResult<Value> {
    match result {
        Ok(resp) => Err(format!("expected {status}, got {}", resp.status()).into()),
        Err(ureq::Error::Status(code, resp)) => {
            assert_eq!(code, status);
            Ok(resp.into_json()?)
        }
        Err(err) => Err(err.into()),
    }
}

fn create_users(server: &TestServer) -> TestResult<()> {
    let created: Value = ureq::post(&server.url("/create_table"))
        .send_json(json!({
            "table_name": "users",
            "schema": {"id": "int", "name": "str", "email": "str"}
        }))?
        .into_json()?;
    assert_eq!(created["table"]["name"], "users");
    assert_eq!(created["table"]["schema"]["id"], "int");
    Ok(())
}

#[test]
fn crud_round_trip_over_http() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    create_users(&server)?;

    for (id, name) in [(1, "Alice"), (2, "Bob")] {
        ureq::post(&server.url("/insert/users"))
            .send_json(json!({"id": id, "name": name, "email": format!("{name}@x.io")}))?;
    }

    let updated: Value = ureq::put(&server.url("/update/users"))
        .send_json(json!({"conditions": {"id": 2}, "updates": {"name": "Robert"}}))?
        .into_json()?;
    assert_eq!(updated["updated"], 1);

    let deleted: Value = ureq::delete(&server.url("/delete/users"))
        .send_json(json!({"conditions": {"id": 1}}))?
        .into_json()?;
    assert_eq!(deleted["deleted"], 1);

    let selected: Value = ureq::get(&server.url("/select/users"))
        .query("id", "2")
        .call()?
        .into_json()?;
    assert_eq!(selected["count"], 1);
    assert_eq!(selected["rows"][0]["name"], "Robert");

    let tables: Value = ureq::get(&server.url("/tables")).call()?.into_json()?;
    assert_eq!(tables["tables"], json!(["users"]));
    Ok(())
}

#[test]
fn bare_delete_body_only_removes_matching_rows() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    create_users(&server)?;

    for (id, name) in [(1, "Alice"), (2, "Bob")] {
        ureq::post(&server.url("/insert/users"))
            .send_json(json!({"id": id, "name": name, "email": format!("{name}@x.io")}))?;
    }

    let deleted: Value = ureq::delete(&server.url("/delete/users"))
        .send_json(json!({"id": 1}))?
        .into_json()?;
    assert_eq!(deleted["deleted"], 1);

    let selected: Value = ureq::get(&server.url("/select/users")).call()?.into_json()?;
    assert_eq!(selected["count"], 1);
    assert_eq!(selected["rows"][0]["id"], 2);
    Ok(())
}

#[test]
fn serve_starts_past_a_corrupt_table_file() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    std::fs::write(temp_dir.path().join("broken.tabula"), b"{\"rows\": [")?;
    std::fs::write(temp_dir.path().join("kept.tabula"), br#"{"rows": [{"id": 1}]}"#)?;
    let server = TestServer::start(temp_dir.path())?;

    let tables: Value = ureq::get(&server.url("/tables")).call()?.into_json()?;
    assert_eq!(tables["tables"], json!(["kept"]));
    let selected: Value = ureq::get(&server.url("/select/kept")).call()?.into_json()?;
    assert_eq!(selected["count"], 1);
    Ok(())
}

#[test]
fn rollback_over_http_discards_working_copy() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    create_users(&server)?;
    ureq::post(&server.url("/insert/users")).send_json(json!({"id": 1}))?;

    let begun: Value = ureq::post(&server.url("/begin/users")).call()?.into_json()?;
    assert_eq!(begun["table"]["in_transaction"], true);
    ureq::post(&server.url("/insert/users")).send_json(json!({"id": 3, "name": "Charlie"}))?;

    let during: Value = ureq::get(&server.url("/select/users")).call()?.into_json()?;
    assert_eq!(during["count"], 2);

    let err = expect_error(ureq::post(&server.url("/begin/users")).call(), 409)?;
    assert_eq!(err["error"]["kind"], "TransactionAlreadyOpen");

    ureq::post(&server.url("/rollback/users")).call()?;
    let after: Value = ureq::get(&server.url("/select/users")).call()?.into_json()?;
    assert_eq!(after["count"], 1);
    assert_eq!(after["rows"][0]["id"], 1);

    let err = expect_error(ureq::post(&server.url("/commit/users")).call(), 409)?;
    assert_eq!(err["error"]["kind"], "NoOpenTransaction");
    Ok(())
}

#[test]
fn commit_over_http_survives_restart() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    {
        let server = TestServer::start(temp_dir.path())?;
        create_users(&server)?;
        ureq::post(&server.url("/begin/users")).call()?;
        ureq::post(&server.url("/insert/users")).send_json(json!({"id": 7}))?;
        ureq::post(&server.url("/commit/users")).call()?;
    }

    let server = TestServer::start(temp_dir.path())?;
    let selected: Value = ureq::get(&server.url("/select/users"))
        .query("id", "7")
        .call()?
        .into_json()?;
    assert_eq!(selected["count"], 1);
    Ok(())
}

#[test]
fn engine_errors_map_to_statuses() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    create_users(&server)?;

    let err = expect_error(
        ureq::post(&server.url("/insert/users")).send_json(json!({"id": "one"})),
        422,
    )?;
    assert_eq!(err["error"]["kind"], "SchemaViolation");
    assert_eq!(err["error"]["violation"]["field"], "id");

    let err = expect_error(
        ureq::post(&server.url("/create_table")).send_json(json!({"table_name": "users"})),
        409,
    )?;
    assert_eq!(err["error"]["kind"], "TableAlreadyExists");

    let err = expect_error(ureq::get(&server.url("/select/ghosts")).call(), 404)?;
    assert_eq!(err["error"]["kind"], "TableNotFound");

    let err = expect_error(
        ureq::post(&server.url("/create_table")).send_json(json!({"table_name": "../evil"})),
        400,
    )?;
    assert_eq!(err["error"]["kind"], "Usage");

    ureq::post(&server.url("/insert/users?key=id")).send_json(json!({"id": 1}))?;
    let err = expect_error(
        ureq::post(&server.url("/insert/users?key=id")).send_json(json!({"id": 1})),
        409,
    )?;
    assert_eq!(err["error"]["kind"], "DuplicateKey");
    Ok(())
}

#[test]
fn backup_and_drop_routes() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start(temp_dir.path())?;
    create_users(&server)?;

    let backup: Value = ureq::post(&server.url("/backup/users")).call()?.into_json()?;
    let path = backup["backup"]["path"].as_str().ok_or("backup path")?;
    assert!(std::path::Path::new(path).exists());

    ureq::delete(&server.url("/drop/users")).call()?;
    assert!(!temp_dir.path().join("users.tabula").exists());
    let tables: Value = ureq::get(&server.url("/tables")).call()?.into_json()?;
    assert_eq!(tables["tables"], json!([]));
    Ok(())
}

#[test]
fn token_is_required_when_configured() -> TestResult<()> {
    let temp_dir = tempfile::tempdir()?;
    let server = TestServer::start_with_token(temp_dir.path(), Some("s3cret"))?;

    let err = expect_error(ureq::get(&server.url("/tables")).call(), 401)?;
    assert_eq!(err["error"]["kind"], "Permission");
    let err = expect_error(
        ureq::get(&server.url("/tables"))
            .set("Authorization", "Bearer wrong")
            .call(),
        401,
    )?;
    assert_eq!(err["error"]["message"], "invalid bearer token");

    let tables: Value = ureq::get(&server.url("/tables"))
        .set("Authorization", "Bearer s3cret")
        .call()?
        .into_json()?;
    assert_eq!(tables["tables"], json!([]));
    Ok(())
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    // healthz skips auth, so it works for token-protected servers too
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}
