//! Endpoint handlers: browser-open, git credential, SSH/GPG agent
//! forwarding, health, and the callback channel HTTP surface.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::process::{Command, Stdio};

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Html;
use axum::Json;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ClawkerError;
use crate::session::{CallbackChannel, RawRequest as ChannelRawRequest};

use super::router::{ok_json, ApiError, AppState, ValidJson};

fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn success_page() -> String {
    "<html><body><h1>Authentication complete</h1><p>You may close this window.</p></body></html>"
        .to_string()
}

fn error_page(message: &str) -> String {
    format!(
        "<html><body><h1>Authentication error</h1><p>{}</p></body></html>",
        html_escape(message)
    )
}

/// Shared by the dynamic per-port listener and the fixed `/cb/{id}/...`
/// path: captures the request and renders the HTML reply. Duplicate
/// captures and unknown-but-previously-valid sessions both render success;
/// only genuine errors (unknown session id, internal fault) render error.
pub async fn handle_browser_callback(
    callback: &CallbackChannel,
    session_id: &str,
    method: &str,
    path: &str,
    query: String,
    headers: HeaderMap,
    body: Vec<u8>,
) -> Html<String> {
    let raw = ChannelRawRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers: headers_to_pairs(&headers),
        body,
    };
    match callback.capture(session_id, raw).await {
        Ok(_already_received_or_not) => Html(success_page()),
        Err(ClawkerError::NotFound(_)) => Html(error_page("unknown callback session")),
        Err(e) => Html(error_page(&e.to_string())),
    }
}

// ---------------------------------------------------------------------
// POST /open/url
// ---------------------------------------------------------------------

#[derive(Deserialize)]
pub struct OpenUrlRequest {
    url: String,
}

pub async fn open_url(
    ValidJson(req): ValidJson<OpenUrlRequest>,
) -> Result<Json<Value>, ApiError> {
    let parsed = url::Url::parse(&req.url)
        .map_err(|_| ClawkerError::validation(format!("invalid URL: {}", req.url)))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ClawkerError::validation(format!(
            "unsupported scheme {:?}; only http and https are allowed",
            parsed.scheme()
        ))
        .into());
    }
    tokio::task::spawn_blocking(move || open::that(req.url))
        .await
        .map_err(|e| ClawkerError::dependency(format!("spawning browser opener: {e}")))?
        .map_err(|e| ClawkerError::dependency(format!("opening browser: {e}")))?;
    Ok(ok_json(json!({})))
}

// ---------------------------------------------------------------------
// POST /git/credential
// ---------------------------------------------------------------------

#[derive(Deserialize)]
pub struct GitCredentialRequest {
    action: String,
    #[serde(flatten)]
    fields: std::collections::BTreeMap<String, String>,
}

pub async fn git_credential(
    ValidJson(req): ValidJson<GitCredentialRequest>,
) -> Result<Json<Value>, ApiError> {
    let subcommand = match req.action.as_str() {
        "get" => "fill",
        "store" => "approve",
        "erase" => "reject",
        other => {
            return Err(ClawkerError::validation(format!("unknown action {other:?}")).into())
        }
    };

    let mut input = String::new();
    for (key, value) in &req.fields {
        input.push_str(key);
        input.push('=');
        input.push_str(value);
        input.push('\n');
    }

    let output = tokio::task::spawn_blocking(move || {
        run_git_credential(subcommand, &input)
    })
    .await
    .map_err(|e| ClawkerError::dependency(format!("running git credential: {e}")))??;

    let mut response = json!({});
    if subcommand == "fill" {
        for line in output.lines() {
            if let Some((key, value)) = line.split_once('=') {
                response[key] = json!(value);
            }
        }
    }
    Ok(ok_json(response))
}

fn run_git_credential(subcommand: &str, input: &str) -> Result<String, ClawkerError> {
    let mut child = Command::new("git")
        .arg("credential")
        .arg(subcommand)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ClawkerError::dependency(format!("spawning git credential: {e}")))?;

    child
        .stdin
        .take()
        .expect("stdin piped")
        .write_all(input.as_bytes())
        .map_err(|e| ClawkerError::dependency(format!("writing to git credential: {e}")))?;

    let output = child
        .wait_with_output()
        .map_err(|e| ClawkerError::dependency(format!("waiting on git credential: {e}")))?;

    if !output.status.success() {
        return Err(ClawkerError::dependency(format!(
            "git credential {subcommand} exited with {}",
            output.status
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

// ---------------------------------------------------------------------
// POST /ssh/agent
// ---------------------------------------------------------------------

#[derive(Deserialize)]
pub struct SshAgentRequest {
    data: String,
}

pub async fn ssh_agent(ValidJson(req): ValidJson<SshAgentRequest>) -> Result<Json<Value>, ApiError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.data)
        .map_err(|_| ClawkerError::validation("data is not valid base64"))?;

    let socket_path = std::env::var("SSH_AUTH_SOCK")
        .map_err(|_| ClawkerError::dependency("SSH_AUTH_SOCK is not set"))?;

    let response = tokio::task::spawn_blocking(move || ssh_agent_round_trip(&socket_path, &bytes))
        .await
        .map_err(|e| ClawkerError::dependency(format!("ssh-agent round trip: {e}")))??;

    Ok(ok_json(json!({
        "data": base64::engine::general_purpose::STANDARD.encode(response),
    })))
}

fn ssh_agent_round_trip(socket_path: &str, request: &[u8]) -> Result<Vec<u8>, ClawkerError> {
    let mut stream = UnixStream::connect(socket_path)
        .map_err(|e| ClawkerError::dependency(format!("dialing SSH_AUTH_SOCK: {e}")))?;
    stream
        .write_all(request)
        .map_err(|e| ClawkerError::dependency(format!("writing to ssh-agent: {e}")))?;

    // SSH agent wire format: 4-byte BE length prefix, then the payload.
    let mut len_buf = [0u8; 4];
    std::io::Read::read_exact(&mut stream, &mut len_buf)
        .map_err(|e| ClawkerError::dependency(format!("reading ssh-agent response: {e}")))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    std::io::Read::read_exact(&mut stream, &mut body)
        .map_err(|e| ClawkerError::dependency(format!("reading ssh-agent response body: {e}")))?;

    let mut full = len_buf.to_vec();
    full.extend_from_slice(&body);
    Ok(full)
}

// ---------------------------------------------------------------------
// POST /gpg/agent
// ---------------------------------------------------------------------

const MAX_ASSUAN_MESSAGE: usize = 64 * 1024;

#[derive(Deserialize)]
pub struct GpgAgentRequest {
    data: String,
}

pub async fn gpg_agent(ValidJson(req): ValidJson<GpgAgentRequest>) -> Result<Json<Value>, ApiError> {
    if req.data.len() > MAX_ASSUAN_MESSAGE {
        return Err(ClawkerError::validation("Assuan message exceeds 64 KiB").into());
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&req.data)
        .map_err(|_| ClawkerError::validation("data is not valid base64"))?;

    let response = tokio::task::spawn_blocking(move || gpg_agent_round_trip(&bytes))
        .await
        .map_err(|e| ClawkerError::dependency(format!("gpg-agent round trip: {e}")))??;

    Ok(ok_json(json!({
        "data": base64::engine::general_purpose::STANDARD.encode(response),
    })))
}

fn gpg_agent_socket_path() -> Result<String, ClawkerError> {
    let output = Command::new("gpgconf")
        .arg("--list-dir")
        .arg("agent-extra-socket")
        .output()
        .map_err(|e| ClawkerError::dependency(format!("running gpgconf: {e}")))?;
    if !output.status.success() {
        return Err(ClawkerError::dependency("gpgconf --list-dir failed"));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Writes the Assuan message then reads lines until one begins with `OK`
/// or `ERR`, which terminates an Assuan response.
fn gpg_agent_round_trip(request: &[u8]) -> Result<Vec<u8>, ClawkerError> {
    let socket_path = gpg_agent_socket_path()?;
    let mut stream = UnixStream::connect(&socket_path)
        .map_err(|e| ClawkerError::dependency(format!("dialing GPG agent socket: {e}")))?;
    stream
        .write_all(request)
        .map_err(|e| ClawkerError::dependency(format!("writing to gpg-agent: {e}")))?;

    let reader_stream = stream
        .try_clone()
        .map_err(|e| ClawkerError::dependency(format!("cloning GPG agent socket: {e}")))?;
    let mut reader = BufReader::new(reader_stream);
    let mut response = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .map_err(|e| ClawkerError::dependency(format!("reading gpg-agent response: {e}")))?;
        if n == 0 {
            break;
        }
        response.push_str_bytes(&line);
        if line.starts_with("OK") || line.starts_with("ERR") {
            break;
        }
    }
    Ok(response)
}

trait PushStr {
    fn push_str_bytes(&mut self, s: &str);
}

impl PushStr for Vec<u8> {
    fn push_str_bytes(&mut self, s: &str) {
        self.extend_from_slice(s.as_bytes());
    }
}

// ---------------------------------------------------------------------
// Callback channel HTTP surface
// ---------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RegisterCallbackRequest {
    port: u32,
    #[serde(default)]
    path: String,
    #[serde(default)]
    timeout_seconds: u64,
}

pub async fn register_callback(
    State(state): State<AppState>,
    ValidJson(req): ValidJson<RegisterCallbackRequest>,
) -> Result<Json<Value>, ApiError> {
    let ttl = std::time::Duration::from_secs(req.timeout_seconds);
    let session = state.callback.register(req.port, &req.path, ttl).await?;

    if let Err(e) = state
        .listeners
        .register(session.id.clone(), req.port)
        .await
    {
        // Roll back the session so a failed listener bind doesn't leave an
        // orphaned callback session behind.
        state.callback.delete(&session.id).await;
        return Err(e.into());
    }

    Ok(ok_json(json!({ "session_id": session.id })))
}

pub async fn callback_data(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let data = state.callback.get_data(&session_id).await?;
    match data {
        Some(captured) => Ok(ok_json(json!({
            "received": true,
            "callback": {
                "method": captured.method,
                "path": captured.path,
                "query": captured.query,
                "received_at": captured.received_at,
            },
        }))),
        None => Ok(ok_json(json!({ "received": false }))),
    }
}

pub async fn delete_callback(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    state.callback.delete(&session_id).await;
    state.listeners.unregister_for_session(&session_id).await;
    ok_json(json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    // `git_credential`/`ssh_agent` tests mutate process-global state (PATH,
    // SSH_AUTH_SOCK); serialize them so they don't race each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    /// Writes a fake `git` onto a fresh PATH-only directory that answers
    /// `credential fill` with a canned line-based response, ignoring stdin.
    fn stub_git_credential_fill(dir: &std::path::Path, output: &str) {
        let script_path = dir.join("git");
        std::fs::write(
            &script_path,
            format!("#!/bin/sh\ncat >/dev/null\nprintf '%s' \"{output}\"\n"),
        )
        .unwrap();
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn s6_git_credential_get_returns_filled_fields() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        stub_git_credential_fill(
            dir.path(),
            "protocol=https\nhost=example.com\nusername=u\npassword=p\n",
        );
        let original_path = std::env::var("PATH").unwrap_or_default();
        std::env::set_var("PATH", format!("{}:{}", dir.path().display(), original_path));

        let mut fields = std::collections::BTreeMap::new();
        fields.insert("protocol".to_string(), "https".to_string());
        fields.insert("host".to_string(), "example.com".to_string());
        let result = git_credential(ValidJson(GitCredentialRequest {
            action: "get".to_string(),
            fields,
        }))
        .await;

        std::env::set_var("PATH", original_path);

        let Json(body) = result.unwrap();
        assert_eq!(
            body,
            json!({
                "success": true,
                "protocol": "https",
                "host": "example.com",
                "username": "u",
                "password": "p",
            })
        );
    }

    #[tokio::test]
    async fn git_credential_rejects_unknown_action() {
        let result = git_credential(ValidJson(GitCredentialRequest {
            action: "wipe".to_string(),
            fields: std::collections::BTreeMap::new(),
        }))
        .await;
        assert!(matches!(result, Err(ApiError(ClawkerError::Validation(_)))));
    }

    #[tokio::test]
    async fn open_url_rejects_non_http_scheme() {
        let result = open_url(ValidJson(OpenUrlRequest {
            url: "file:///etc/passwd".to_string(),
        }))
        .await;
        assert!(matches!(result, Err(ApiError(ClawkerError::Validation(_)))));
    }

    #[tokio::test]
    async fn open_url_rejects_unparseable_url() {
        let result = open_url(ValidJson(OpenUrlRequest {
            url: "not a url".to_string(),
        }))
        .await;
        assert!(matches!(result, Err(ApiError(ClawkerError::Validation(_)))));
    }

    #[tokio::test]
    async fn gpg_agent_rejects_oversize_message() {
        let oversize = "a".repeat(MAX_ASSUAN_MESSAGE + 1);
        let result = gpg_agent(ValidJson(GpgAgentRequest { data: oversize })).await;
        assert!(matches!(result, Err(ApiError(ClawkerError::Validation(_)))));
    }

    #[tokio::test]
    async fn ssh_agent_rejects_invalid_base64() {
        let result = ssh_agent(ValidJson(SshAgentRequest {
            data: "not-base64!!".to_string(),
        }))
        .await;
        assert!(matches!(result, Err(ApiError(ClawkerError::Validation(_)))));
    }

    #[tokio::test]
    async fn ssh_agent_reports_dependency_error_without_auth_sock() {
        let _guard = ENV_LOCK.lock().unwrap();
        let original = std::env::var("SSH_AUTH_SOCK").ok();
        std::env::remove_var("SSH_AUTH_SOCK");

        let result = ssh_agent(ValidJson(SshAgentRequest {
            data: base64::engine::general_purpose::STANDARD.encode(b"hello"),
        }))
        .await;

        if let Some(value) = original {
            std::env::set_var("SSH_AUTH_SOCK", value);
        }

        assert!(matches!(result, Err(ApiError(ClawkerError::Dependency(_)))));
    }
}
