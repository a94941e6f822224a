//! Docker backend against a scripted engine on a Unix socket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dockerdb_common::config::ExecOptions;
use dockerdb_common::error::DockerDbError;
use dockerdb_common::types::ContainerId;
use dockerdb_runtime::backend::docker::DockerRuntime;
use dockerdb_runtime::backend::{ContainerRuntime, ContainerSpec};
use dockerdb_runtime::exec::run_exec;
use dockerdb_runtime::frames::{self, StreamKind};

struct Request {
    method: String,
    path: String,
    query: String,
    body: Vec<u8>,
}

type Handler = dyn Fn(&Request, &mut UnixStream) + Send + Sync;

struct Engine {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    log: Arc<Mutex<Vec<(String, String)>>>,
}

impl Engine {
    fn runtime(&self) -> DockerRuntime {
        DockerRuntime::new(self.socket.clone()).unwrap()
    }

    /// `METHOD /path` of every request, in arrival order.
    fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(line, _)| line.clone()).collect()
    }

    fn query_of(&self, line: &str) -> String {
        self.log
            .lock()
            .unwrap()
            .iter()
            .find(|(l, _)| l == line)
            .map(|(_, query)| query.clone())
            .unwrap()
    }
}

/// Serves every connection on its own thread, answering requests until the
/// client hangs up.
fn spawn_engine(handler: impl Fn(&Request, &mut UnixStream) + Send + Sync + 'static) -> Engine {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("docker.sock");
    let listener = UnixListener::bind(&socket).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler: Arc<Handler> = Arc::new(handler);

    let accept_log = Arc::clone(&log);
    let _ = std::thread::spawn(move || {
        for conn in listener.incoming() {
            let Ok(mut conn) = conn else { break };
            let log = Arc::clone(&accept_log);
            let handler = Arc::clone(&handler);
            let _ = std::thread::spawn(move || {
                while let Some(request) = read_request(&mut conn) {
                    log.lock().unwrap().push((
                        format!("{} {}", request.method, request.path),
                        request.query.clone(),
                    ));
                    handler(&request, &mut conn);
                }
            });
        }
    });

    Engine {
        _dir: dir,
        socket,
        log,
    }
}

fn read_request(conn: &mut UnixStream) -> Option<Request> {
    let mut head = Vec::new();
    let mut byte = [0_u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if conn.read(&mut byte).ok()? == 0 {
            return None;
        }
        head.push(byte[0]);
    }
    let text = String::from_utf8(head).ok()?;
    let mut lines = text.split("\r\n");
    let mut first = lines.next()?.split_whitespace();
    let method = first.next()?.to_string();
    let target = first.next()?;
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    let length = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0_u8; length];
    conn.read_exact(&mut body).ok()?;
    Some(Request {
        method,
        path: path.to_string(),
        query: query.to_string(),
        body,
    })
}

fn respond(conn: &mut UnixStream, status: u16, body: &str) {
    let _ = write!(
        conn,
        "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    let _ = conn.flush();
}

fn mongo_spec() -> ContainerSpec {
    ContainerSpec {
        name: "tmp_1_mongo_0".into(),
        image: "mongo:6.0".into(),
        ..ContainerSpec::default()
    }
}

#[test]
fn missing_image_is_pulled_before_retrying_create() {
    let pulled = AtomicBool::new(false);
    let engine = spawn_engine(move |req, conn| match req.path.as_str() {
        "/v1.41/containers/create" if pulled.load(Ordering::SeqCst) => {
            respond(conn, 201, r#"{"Id":"c1","Warnings":[]}"#);
        }
        "/v1.41/containers/create" => {
            respond(conn, 404, r#"{"message":"No such image: mongo:6.0"}"#);
        }
        "/v1.41/images/create" => {
            pulled.store(true, Ordering::SeqCst);
            respond(conn, 200, "{\"status\":\"Pulling\"}\n{\"status\":\"Done\"}\n");
        }
        "/v1.41/containers/c1/start" => respond(conn, 204, ""),
        _ => respond(conn, 500, r#"{"message":"unexpected"}"#),
    });

    let id = engine.runtime().run_container(&mongo_spec()).unwrap();

    assert_eq!(id.as_str(), "c1");
    assert_eq!(
        engine.requests(),
        vec![
            "POST /v1.41/containers/create",
            "POST /v1.41/images/create",
            "POST /v1.41/containers/create",
            "POST /v1.41/containers/c1/start",
        ]
    );
    assert!(engine.query_of("POST /v1.41/containers/create").contains("name=tmp_1_mongo_0"));
    let pull = engine.query_of("POST /v1.41/images/create");
    assert!(pull.contains("fromImage=mongo"));
    assert!(pull.contains("tag=6.0"));
}

#[test]
fn pull_error_in_progress_stream_fails_the_run() {
    let engine = spawn_engine(|req, conn| {
        if req.path == "/v1.41/containers/create" {
            respond(conn, 404, r#"{"message":"No such image"}"#);
        } else {
            respond(conn, 200, "{\"error\":\"manifest unknown\"}\n");
        }
    });

    let err = engine
        .runtime()
        .run_container(&ContainerSpec {
            name: "x".into(),
            image: "mongo:nope".into(),
            ..ContainerSpec::default()
        })
        .unwrap_err();
    assert!(err.to_string().contains("manifest unknown"));
}

#[test]
fn container_that_fails_to_start_is_removed() {
    let engine = spawn_engine(|req, conn| match (req.method.as_str(), req.path.as_str()) {
        ("POST", "/v1.41/containers/create") => {
            respond(conn, 201, r#"{"Id":"c1","Warnings":[]}"#);
        }
        ("POST", "/v1.41/containers/c1/start") => {
            respond(conn, 500, r#"{"message":"port is already allocated"}"#);
        }
        ("DELETE", "/v1.41/containers/c1") => respond(conn, 204, ""),
        _ => respond(conn, 500, r#"{"message":"unexpected"}"#),
    });

    let err = engine.runtime().run_container(&mongo_spec()).unwrap_err();

    match err {
        DockerDbError::Runtime { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "port is already allocated");
        }
        other => panic!("unexpected error {other}"),
    }
    assert_eq!(
        engine.requests(),
        vec![
            "POST /v1.41/containers/create",
            "POST /v1.41/containers/c1/start",
            "DELETE /v1.41/containers/c1",
        ]
    );
    let delete = engine.query_of("DELETE /v1.41/containers/c1");
    assert!(delete.contains("force=true"));
    assert!(delete.contains("v=true"));
}

#[test]
fn inspect_strips_name_and_collects_networks() {
    let engine = spawn_engine(|_, conn| {
        respond(
            conn,
            200,
            r#"{"Id":"c1","Name":"/tmp_1_mongo_0","State":{"Running":true},
               "Config":{"Labels":{"dockerdb.kind":"mongo"}},
               "NetworkSettings":{"IPAddress":"","Networks":{"dockerdb":{"IPAddress":"172.18.0.2"}}}}"#,
        );
    });

    let details = engine.runtime().inspect_container(&ContainerId::new("c1")).unwrap();
    assert_eq!(details.name, "tmp_1_mongo_0");
    assert!(details.running);
    assert_eq!(details.network_address().unwrap(), "172.18.0.2");
    assert_eq!(details.labels["dockerdb.kind"], "mongo");
    assert_eq!(engine.requests(), vec!["GET /v1.41/containers/c1/json"]);
}

#[test]
fn listing_filters_by_label_and_strips_names() {
    let engine = spawn_engine(|_, conn| {
        respond(
            conn,
            200,
            r#"[{"Id":"c1","Names":["/tmp_1_mongo_0"],"Image":"mongo:6.0","State":"running",
                 "Labels":{"dockerdb.session":"1"}}]"#,
        );
    });

    let listed = engine.runtime().list_containers("dockerdb.session").unwrap();

    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "tmp_1_mongo_0");
    assert_eq!(listed[0].state, "running");
    assert_eq!(listed[0].labels["dockerdb.session"], "1");
    let query = engine.query_of("GET /v1.41/containers/json");
    assert!(query.contains("all=true"));
    assert!(query.contains("dockerdb.session"));
}

#[test]
fn removing_missing_container_is_not_found() {
    let engine = spawn_engine(|_, conn| {
        respond(conn, 404, r#"{"message":"No such container: c9"}"#);
    });

    let err = engine.runtime().remove_container(&ContainerId::new("c9")).unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(engine.requests(), vec!["DELETE /v1.41/containers/c9"]);
}

#[test]
fn runtime_errors_carry_status_and_message() {
    let engine = spawn_engine(|_, conn| {
        respond(conn, 409, r#"{"message":"container c1 is not running"}"#);
    });

    let err = engine
        .runtime()
        .exec_create(&ContainerId::new("c1"), &["true".to_string()], true)
        .unwrap_err();
    match err {
        DockerDbError::Runtime { status, message } => {
            assert_eq!(status, 409);
            assert_eq!(message, "container c1 is not running");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn network_is_created_when_missing() {
    let created = AtomicBool::new(false);
    let engine = spawn_engine(move |req, conn| {
        if req.method == "POST" {
            let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
            assert_eq!(body["Name"], "dockerdb");
            created.store(true, Ordering::SeqCst);
            respond(conn, 201, r#"{"Id":"n1","Warning":""}"#);
        } else if created.load(Ordering::SeqCst) {
            respond(conn, 200, r#"{"Name":"dockerdb","Id":"n1"}"#);
        } else {
            respond(conn, 404, r#"{"message":"network dockerdb not found"}"#);
        }
    });

    let id = engine.runtime().ensure_network("dockerdb").unwrap();
    assert_eq!(id.as_str(), "n1");
    assert_eq!(
        engine.requests(),
        vec![
            "GET /v1.41/networks/dockerdb",
            "POST /v1.41/networks/create",
            "GET /v1.41/networks/dockerdb",
        ]
    );
}

#[test]
fn existing_network_is_reused() {
    let engine = spawn_engine(|_, conn| {
        respond(conn, 200, r#"{"Name":"dockerdb","Id":"n7"}"#);
    });

    let id = engine.runtime().ensure_network("dockerdb").unwrap();
    assert_eq!(id.as_str(), "n7");
    assert_eq!(engine.requests(), vec!["GET /v1.41/networks/dockerdb"]);
}

#[test]
fn exec_streams_input_and_reports_exit_code() {
    let engine = spawn_engine(|req, conn| match req.path.as_str() {
        "/v1.41/containers/c1/exec" => {
            let body: serde_json::Value = serde_json::from_slice(&req.body).unwrap();
            assert_eq!(body["AttachStdin"], true);
            assert_eq!(body["Tty"], false);
            respond(conn, 201, r#"{"Id":"e1"}"#);
        }
        "/v1.41/exec/e1/start" => {
            let _ = conn.write_all(
                b"HTTP/1.1 101 UPGRADED\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n",
            );
            let mut stdin = Vec::new();
            let _ = conn.read_to_end(&mut stdin).unwrap();
            let reply = format!("restored {} bytes", stdin.len());
            let _ = conn.write_all(&frames::encode(StreamKind::Stderr, reply.as_bytes()));
            let _ = conn.shutdown(std::net::Shutdown::Both);
        }
        "/v1.41/exec/e1/json" => {
            respond(conn, 200, r#"{"Running":false,"ExitCode":7,"ID":"e1"}"#);
        }
        _ => respond(conn, 500, r#"{"message":"unexpected"}"#),
    });

    let input = vec![b'x'; 20_000];
    let out = run_exec(
        &engine.runtime(),
        &ContainerId::new("c1"),
        &["mongorestore".to_string(), "--archive".to_string()],
        &mut input.as_slice(),
        &ExecOptions::default(),
    )
    .unwrap();

    assert_eq!(out.exit_code, 7);
    assert_eq!(out.text(), "restored 20000 bytes");
}

#[test]
fn refused_exec_start_reports_the_engine_message() {
    let engine = spawn_engine(|req, conn| {
        if req.path == "/v1.41/exec/e1/start" {
            respond(conn, 409, r#"{"message":"container is paused"}"#);
        }
    });

    let err = engine
        .runtime()
        .exec_start(&dockerdb_common::types::ExecId::new("e1"))
        .err()
        .unwrap();
    match err {
        DockerDbError::Runtime { status, message } => {
            assert_eq!(status, 409);
            assert_eq!(message, "container is paused");
        }
        other => panic!("unexpected error {other}"),
    }
}
