use anyhow::Result;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use remote_config::api::{ApiConfig, ApiHandle, ApiServer, DEFAULT_MAX_CONNECTIONS};
use remote_config::runtime::pool::PoolConfig;
use remote_config::{
    Code, Config, DispatchSettings, Dispatcher, EngineConfig, InMemoryRecordStore,
    MemoryRecordCache, ParamSpec, RecordCache, RecordStore, ScriptEngines, TestCase,
};

const TEST_SECRET: &str = "unit-secret";

fn seed(store: &InMemoryRecordStore) -> Result<()> {
    store.put_config(&Config {
        config_id: "100000".to_string(),
        released_code: "release".to_string(),
        gray_release_code: "gray".to_string(),
        percentage: 50,
        status: "valid".to_string(),
        secret: "config-secret".to_string(),
        ..Config::default()
    })?;
    store.put_config(&Config {
        config_id: "200000".to_string(),
        released_code: "release".to_string(),
        status: "invalid".to_string(),
        ..Config::default()
    })?;
    store.put_code(&Code {
        code_id: "release".to_string(),
        lang: "starlark".to_string(),
        params: vec![ParamSpec {
            name: "version_code".to_string(),
            kind: "int".to_string(),
        }],
        content: "if p[\"version_code\"] > 100:\n    return \"release\"\nreturn \"legacy\""
            .to_string(),
        ..Code::default()
    })?;
    store.put_code(&Code {
        code_id: "gray".to_string(),
        lang: "javascript".to_string(),
        params: vec![ParamSpec {
            name: "version_code".to_string(),
            kind: "int".to_string(),
        }],
        content: "return 'grayrelease';".to_string(),
        ..Code::default()
    })?;
    store.put_test_case(&TestCase {
        test_id: "t1".to_string(),
        input: r#"{"version_code": 1024}"#.to_string(),
        output: "\"release\"".to_string(),
        code_id: "release".to_string(),
    })?;
    Ok(())
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

struct TestApi {
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(allow_origins: Vec<String>) -> Result<Self> {
        Self::with_limit(allow_origins, DEFAULT_MAX_CONNECTIONS)
    }

    fn with_limit(allow_origins: Vec<String>, max_connections: usize) -> Result<Self> {
        let store = Arc::new(InMemoryRecordStore::new());
        seed(&store)?;
        let records: Arc<dyn RecordCache> = Arc::new(MemoryRecordCache::new());
        let engines = Arc::new(ScriptEngines::new(&EngineConfig {
            pool: PoolConfig {
                size: 2,
                timeout: Duration::from_millis(200),
                confine: false,
            },
            ..EngineConfig::default()
        })?);
        let dispatcher = Arc::new(Dispatcher::new(
            store,
            Some(records),
            engines,
            DispatchSettings {
                test_secret: Some(TEST_SECRET.to_string()),
                ..DispatchSettings::default()
            },
        ));

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            allow_origins,
            max_connections,
        };
        let api_handle = ApiServer::new(api_config, dispatcher).spawn()?;

        Ok(Self {
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn send(
        &self,
        method: &str,
        path: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> Result<(String, String)> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
        for (name, value) in headers {
            request.push_str(&format!("{name}: {value}\r\n"));
        }
        request.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn post_config(&self, config_id: &str, body: &Value) -> Result<(String, Value)> {
        let path = format!("/config/{config_id}");
        let (headers, body) = self.send("POST", &path, &[], &body.to_string())?;
        Ok((headers, serde_json::from_str(&body)?))
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

fn config_request(device_id: &str, version_code: Value) -> Value {
    json!({
        "meta": {"version": 12, "platform": "iphone", "device_id": device_id},
        "cached": true,
        "params": {"version_code": version_code}
    })
}

#[test]
fn health_reports_pools() -> Result<()> {
    let api = TestApi::new(Vec::new())?;
    let (headers, body) = api.send("GET", "/health", &[], "")?;
    assert!(headers.contains("200 OK"));
    let body: Value = serde_json::from_str(&body)?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["pools"]["starlark"]["size"], 2);
    Ok(())
}

#[test]
fn config_endpoint_serves_stable_and_gray() -> Result<()> {
    let api = TestApi::new(Vec::new())?;

    let (headers, body) = api.post_config("100000", &config_request("1", json!(1024)))?;
    assert!(headers.contains("200 OK"), "{headers}");
    assert_eq!(body, json!({"result": "release", "code_id": "release"}));

    let (headers, body) = api.post_config("100000", &config_request("3", json!(1024)))?;
    assert!(headers.contains("200 OK"), "{headers}");
    assert_eq!(body, json!({"result": "grayrelease", "code_id": "gray"}));
    Ok(())
}

#[test]
fn config_endpoint_maps_failures_to_statuses() -> Result<()> {
    let api = TestApi::new(Vec::new())?;

    let (headers, body) = api.post_config("100000", &config_request("1", json!("1024")))?;
    assert!(headers.contains("400 Bad Request"), "{headers}");
    assert!(body["message"].as_str().unwrap_or("").contains("version_code"));

    let (headers, _) = api.post_config("200000", &config_request("1", json!(1)))?;
    assert!(headers.contains("403 Forbidden"), "{headers}");

    let (headers, _) = api.post_config("999999", &config_request("1", json!(1)))?;
    assert!(headers.contains("400 Bad Request"), "{headers}");

    let (headers, _) = api.send("POST", "/config/100000", &[], "{not json")?;
    assert!(headers.contains("400 Bad Request"), "{headers}");

    let (headers, _) = api.send("POST", "/config/bad%2Fid", &[], "{}")?;
    assert!(headers.contains("400 Bad Request"), "{headers}");

    let (headers, _) = api.send("GET", "/config/100000", &[], "")?;
    assert!(headers.contains("405 Method Not Allowed"), "{headers}");

    let (headers, _) = api.send("GET", "/nowhere", &[], "")?;
    assert!(headers.contains("404 Not Found"), "{headers}");
    Ok(())
}

#[test]
fn test_endpoint_checks_secret_header() -> Result<()> {
    let api = TestApi::new(Vec::new())?;

    let (headers, _) = api.send("GET", "/test/t1", &[], "")?;
    assert!(headers.contains("400 Bad Request"), "{headers}");

    let (headers, _) = api.send("GET", "/test/t1", &[("Secret", "wrong")], "")?;
    assert!(headers.contains("403 Forbidden"), "{headers}");

    let (headers, body) = api.send("GET", "/test/t1", &[("Secret", TEST_SECRET)], "")?;
    assert!(headers.contains("200 OK"), "{headers}");
    let body: Value = serde_json::from_str(&body)?;
    assert_eq!(body["succeed"], true);
    assert!(body["duration"].is_u64());
    Ok(())
}

#[test]
fn playground_runs_both_languages() -> Result<()> {
    let api = TestApi::new(Vec::new())?;

    let payload = json!({"code": "return p[\"n\"] * 3", "params": {"n": 4}}).to_string();
    let (headers, body) = api.send("POST", "/playground/starlark", &[], &payload)?;
    assert!(headers.contains("200 OK"), "{headers}");
    assert_eq!(serde_json::from_str::<Value>(&body)?, json!({"result": "12"}));

    let payload = json!({"code": "while (true) {}", "params": {}}).to_string();
    let (headers, body) = api.send("POST", "/playground/js", &[], &payload)?;
    assert!(headers.contains("400 Bad Request"), "{headers}");
    assert!(body.contains("execution timeout"), "{body}");

    let (headers, _) = api.send("POST", "/playground/cobol", &[], &payload)?;
    assert!(headers.contains("400 Bad Request"), "{headers}");
    Ok(())
}

#[test]
fn report_endpoint_counts_errors() -> Result<()> {
    let api = TestApi::new(Vec::new())?;
    let payload = json!({"err_time": 1_700_000_000, "message": "client crash"}).to_string();

    let (headers, _) = api.send("POST", "/report/100000/release", &[], &payload)?;
    assert!(headers.contains("400 Bad Request"), "{headers}");

    let (headers, body) = api.send(
        "POST",
        "/report/100000/release",
        &[("Secret", "config-secret")],
        &payload,
    )?;
    assert!(headers.contains("200 OK"), "{headers}");
    let body: Value = serde_json::from_str(&body)?;
    assert_eq!(body["error_count"], 1);
    assert_eq!(body["is_broken"], false);
    Ok(())
}

#[test]
fn cors_headers_follow_allowed_origins() -> Result<()> {
    let api = TestApi::new(vec!["https://console.example".to_string()])?;

    let console = [("Origin", "https://console.example")];
    let (headers, _) = api.send("GET", "/health", &console, "")?;
    assert!(headers.contains("Access-Control-Allow-Origin: https://console.example"));

    let (headers, _) = api.send("GET", "/health", &[("Origin", "https://evil.example")], "")?;
    assert!(!headers.contains("Access-Control-Allow-Origin"));

    let (headers, _) = api.send("OPTIONS", "/config/100000", &console, "")?;
    assert!(headers.contains("204 No Content"), "{headers}");
    Ok(())
}

#[test]
fn connections_over_the_limit_are_refused() -> Result<()> {
    let api = TestApi::with_limit(Vec::new(), 1)?;

    // an idle connection holds the only slot until it closes
    let idle = TcpStream::connect(api.handle().addr)?;
    std::thread::sleep(Duration::from_millis(200));

    let (headers, body) = api.send("GET", "/health", &[], "")?;
    assert!(headers.contains("503 Service Unavailable"), "{headers}");
    assert!(body.contains("server busy"));

    drop(idle);
    std::thread::sleep(Duration::from_millis(200));
    let (headers, _) = api.send("GET", "/health", &[], "")?;
    assert!(headers.contains("200 OK"), "{headers}");
    Ok(())
}
