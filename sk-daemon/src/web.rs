//! HTTP interface
//!
//! A small hand-rolled HTTP/1.1 server on the Web task. Mutating endpoints
//! require HTTP Basic auth (realm "Wedzarnia"); `GET /status` and the
//! read-only listings are public. Boundary discipline: handlers never
//! mutate controller state directly, they enqueue commands for the control
//! task; reads copy a coherent snapshot under one lock.
//!
//! The Web task is deliberately not a hardware-watchdog client, and the
//! firmware-upload handler widens the watchdog and pets it per chunk so a
//! slow transfer cannot reboot the device mid-flash.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use sk_core::constants::{flash as flash_cfg, tasks as task_cfg, web as web_cfg};
use sk_core::{Controller, RemoteProfiles};
use sk_protocol::{validate_flash_path, Command, MAX_BODY_SIZE};

use crate::tasks::{TaskId, Watchdogs};

/// Read timeout per request
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Header block cap
const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Firmware image cap for `/update`
const MAX_FIRMWARE_SIZE: usize = 4 * 1024 * 1024;

pub struct WebContext {
    pub ctl: Arc<Controller>,
    pub wdt: Arc<Watchdogs>,
    pub remote: Arc<dyn RemoteProfiles>,
}

/// Entry point for the Web task thread: a current-thread runtime drives
/// the whole server.
pub fn web_task(
    ctl: Arc<Controller>,
    wdt: Arc<Watchdogs>,
    remote: Arc<dyn RemoteProfiles>,
    listen_addr: String,
    shutdown: Arc<AtomicBool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!("Web task failed to build runtime: {e}");
            return;
        }
    };
    let ctx = Arc::new(WebContext { ctl, wdt, remote });
    if let Err(e) = runtime.block_on(run_server(ctx, &listen_addr, shutdown)) {
        warn!("Web server exited with error: {e}");
    }
}

async fn run_server(
    ctx: Arc<WebContext>,
    listen_addr: &str,
    shutdown: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Web server listening on {}", listener.local_addr()?);

    loop {
        let now = ctx.ctl.uptime.now_ms();
        ctx.wdt.touch(TaskId::Web, now);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Connection from {peer}");
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(ctx, stream).await {
                                debug!("Connection error: {e}");
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {e}"),
                }
            }
            _ = tokio::time::sleep(Duration::from_millis(task_cfg::WEB_PERIOD_MS)) => {}
        }
    }
    info!("Web server stopped");
    Ok(())
}

// ============================================================================
// Request plumbing
// ============================================================================

struct Request {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    authorized: bool,
    content_length: usize,
}

impl Request {
    fn param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

async fn handle_connection(ctx: Arc<WebContext>, mut stream: TcpStream) -> anyhow::Result<()> {
    // Read the header block, bounded
    let mut buf = Vec::with_capacity(1024);
    let header_end = loop {
        let mut chunk = [0u8; 1024];
        let n = timeout(READ_TIMEOUT, stream.read(&mut chunk)).await??;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_SIZE {
            write_response(&mut stream, 431, "text/plain", b"headers too large").await?;
            return Ok(());
        }
    };

    let header_text = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut body = buf.split_off(header_end + 4);

    let Some(request) = parse_request(&ctx, &header_text) else {
        write_response(&mut stream, 400, "text/plain", b"bad request").await?;
        return Ok(());
    };

    // Firmware upload streams its body through the hasher; everything else
    // buffers a bounded body.
    if request.method == "POST" && request.path == "/update" {
        return handle_update(&ctx, &request, body, &mut stream).await;
    }

    if request.content_length > MAX_BODY_SIZE {
        write_response(&mut stream, 413, "text/plain", b"body too large").await?;
        return Ok(());
    }
    while body.len() < request.content_length {
        let mut chunk = vec![0u8; request.content_length - body.len()];
        let n = timeout(READ_TIMEOUT, stream.read(&mut chunk)).await??;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let (status, content_type, payload) = route(&ctx, &request, &body);
    if status == 401 {
        write_unauthorized(&mut stream).await?;
    } else {
        write_response(&mut stream, status, content_type, &payload).await?;
    }
    Ok(())
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request(ctx: &WebContext, header_text: &str) -> Option<Request> {
    let mut lines = header_text.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;

    let (path, query_str) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };
    let query = parse_query(query_str);

    let mut authorized = false;
    let mut content_length = 0usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "authorization" => authorized = check_basic_auth(ctx, value),
            "content-length" => content_length = value.parse().unwrap_or(0),
            _ => {}
        }
    }

    Some(Request {
        method,
        path: path.to_string(),
        query,
        authorized,
        content_length,
    })
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    _ => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn check_basic_auth(ctx: &WebContext, header_value: &str) -> bool {
    let Some(encoded) = header_value.strip_prefix("Basic ") else {
        return false;
    };
    let Some(decoded) = base64_decode(encoded.trim()) else {
        return false;
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, pass)) = text.split_once(':') else {
        return false;
    };
    let (expected_user, expected_pass) = ctx.ctl.nvs.lock().auth();
    user == expected_user && pass == expected_pass
}

/// Minimal base64 decoder for the Basic auth header
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    fn value(c: u8) -> Option<u32> {
        match c {
            b'A'..=b'Z' => Some((c - b'A') as u32),
            b'a'..=b'z' => Some((c - b'a' + 26) as u32),
            b'0'..=b'9' => Some((c - b'0' + 52) as u32),
            b'+' => Some(62),
            b'/' => Some(63),
            _ => None,
        }
    }
    let input = input.trim_end_matches('=');
    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for c in input.bytes() {
        acc = (acc << 6) | value(c)?;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}

async fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> anyhow::Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Not Found",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "",
    };
    let header = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

async fn write_unauthorized(stream: &mut TcpStream) -> anyhow::Result<()> {
    let body = b"authentication required";
    let header = format!(
        "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"{}\"\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        web_cfg::AUTH_REALM,
        body.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

// ============================================================================
// Routing
// ============================================================================

type RouteResult = (u16, &'static str, Vec<u8>);

fn json_ok(value: serde_json::Value) -> RouteResult {
    (200, "application/json", value.to_string().into_bytes())
}

fn json_err(status: u16, message: &str) -> RouteResult {
    (
        status,
        "application/json",
        serde_json::json!({ "error": message }).to_string().into_bytes(),
    )
}

fn push(ctx: &WebContext, command: Command) -> RouteResult {
    match ctx.ctl.push_command(command) {
        Ok(()) => json_ok(serde_json::json!({ "ok": true })),
        Err(e) => json_err(400, &e),
    }
}

fn route(ctx: &WebContext, req: &Request, body: &[u8]) -> RouteResult {
    match (req.method.as_str(), req.path.as_str()) {
        // --- public reads -------------------------------------------------
        ("GET", "/status") => status_snapshot(ctx),
        ("GET", "/api/profiles") => list_profiles(ctx),
        ("GET", "/api/github_profiles") => match ctx.remote.list() {
            Ok(names) => json_ok(serde_json::json!({ "profiles": names })),
            Err(e) => json_err(503, &e.to_string()),
        },
        ("GET", "/profile/get") => profile_get(ctx, req),
        ("GET", "/flash/info") => flash_info(ctx),
        ("GET", "/files/list") => files_list(ctx, req),
        ("GET", "/files/read") => files_read(ctx, req),
        ("GET", "/diag") => diagnostics(ctx),

        // --- mutating (auth required) ------------------------------------
        _ if !req.authorized => (401, "text/plain", Vec::new()),

        ("GET", "/profile/select") => profile_select(ctx, req),
        ("GET", "/auto/start") => push(ctx, Command::StartAuto),
        ("GET", "/auto/stop") => push(ctx, Command::Stop),
        ("GET", "/auto/next_step") => push(ctx, Command::NextStep),
        ("GET", "/auto/resume") => push(ctx, Command::Resume),
        ("GET", "/mode/manual") => push(ctx, Command::StartManual),
        ("GET", "/timer/reset") => push(ctx, Command::ResetTimer),
        ("GET", "/manual/set") => match req.param("value").and_then(|v| v.parse().ok()) {
            Some(celsius) => push(ctx, Command::SetManualSetpoint { celsius }),
            None => json_err(400, "missing value"),
        },
        ("GET", "/manual/power") => match req.param("value").and_then(|v| v.parse().ok()) {
            Some(mode) => push(ctx, Command::SetManualPower { mode }),
            None => json_err(400, "missing value"),
        },
        ("GET", "/manual/smoke") => match req.param("value").and_then(|v| v.parse().ok()) {
            Some(pwm) => push(ctx, Command::SetManualSmoke { pwm }),
            None => json_err(400, "missing value"),
        },
        ("GET", "/manual/fan") => {
            let mode = req.param("mode").and_then(|v| v.parse().ok());
            let on_s: u64 = req.param("on").and_then(|v| v.parse().ok()).unwrap_or(10);
            let off_s: u64 = req.param("off").and_then(|v| v.parse().ok()).unwrap_or(60);
            match mode {
                Some(mode) => push(
                    ctx,
                    Command::SetManualFan {
                        mode,
                        on_ms: on_s * 1000,
                        off_ms: off_s * 1000,
                    },
                ),
                None => json_err(400, "missing mode"),
            }
        }
        ("POST", "/flash/format") => flash_format(ctx, req),
        ("POST", "/files/write") => files_write(ctx, req, body),
        ("POST", "/files/delete") => files_delete(ctx, req),
        ("POST", "/wifi/save") => wifi_save(ctx, req, body),
        ("POST", "/auth/save") => auth_save(ctx, req, body),

        _ => (404, "text/plain", b"not found".to_vec()),
    }
}

fn status_snapshot(ctx: &WebContext) -> RouteResult {
    let now = ctx.ctl.uptime.now_ms();
    match ctx.ctl.lock_state() {
        Ok(st) => {
            let snap = st.snapshot(now);
            drop(st);
            match serde_json::to_vec(&snap) {
                Ok(body) => (200, "application/json", body),
                Err(e) => json_err(500, &e.to_string()),
            }
        }
        Err(e) => json_err(503, &e.to_string()),
    }
}

fn with_flash<F>(ctx: &WebContext, f: F) -> RouteResult
where
    F: FnOnce(&mut sk_core::FlashFs) -> RouteResult,
{
    let Some(flash) = &ctx.ctl.flash else {
        return json_err(503, "flash unavailable");
    };
    match flash.try_lock_for(std::time::Duration::from_secs(1)) {
        Some(mut fs) => f(&mut fs),
        None => json_err(503, "flash busy"),
    }
}

fn list_profiles(ctx: &WebContext) -> RouteResult {
    with_flash(ctx, |fs| {
        let names: Vec<String> = fs
            .list("/profiles/")
            .into_iter()
            .filter_map(|f| f.name.strip_prefix("/profiles/").map(str::to_string))
            .collect();
        json_ok(serde_json::json!({ "profiles": names }))
    })
}

fn profile_path(req: &Request) -> Option<String> {
    let name = req.param("name")?;
    match req.param("source") {
        Some("github") => Some(format!("github:{name}")),
        _ => Some(format!("/profiles/{name}")),
    }
}

fn profile_get(ctx: &WebContext, req: &Request) -> RouteResult {
    let Some(path) = profile_path(req) else {
        return json_err(400, "missing name");
    };
    let text = if let Some(name) = path.strip_prefix("github:") {
        match ctx.remote.fetch(name) {
            Ok(t) => t,
            Err(e) => return json_err(503, &e.to_string()),
        }
    } else {
        let read = with_flash(ctx, |fs| match fs.file_read(
            &path,
            flash_cfg::MAX_FILE_SECTORS * flash_cfg::SECTOR_SIZE as usize,
        ) {
            Ok(bytes) => (200, "text/plain", bytes),
            Err(e) => json_err(404, &e.to_string()),
        });
        if read.0 != 200 {
            return read;
        }
        String::from_utf8_lossy(&read.2).into_owned()
    };

    let steps = sk_core::parse_profile(&text);
    match sk_core::profile_as_json(&steps) {
        Ok(json) => (
            200,
            "application/json",
            serde_json::json!({ "name": req.param("name"), "steps": serde_json::from_str::<serde_json::Value>(&json).unwrap_or_default() })
                .to_string()
                .into_bytes(),
        ),
        Err(e) => json_err(500, &e.to_string()),
    }
}

fn profile_select(ctx: &WebContext, req: &Request) -> RouteResult {
    match profile_path(req) {
        Some(path) => push(ctx, Command::SelectProfile { path }),
        None => json_err(400, "missing name"),
    }
}

fn flash_info(ctx: &WebContext) -> RouteResult {
    with_flash(ctx, |fs| match serde_json::to_vec(&fs.info()) {
        Ok(body) => (200, "application/json", body),
        Err(e) => json_err(500, &e.to_string()),
    })
}

fn flash_format(ctx: &WebContext, req: &Request) -> RouteResult {
    with_flash(ctx, |fs| {
        let result = if req.param("full") == Some("1") {
            fs.erase_chip()
        } else {
            fs.format()
        };
        match result {
            Ok(()) => json_ok(serde_json::json!({ "ok": true })),
            Err(e) => json_err(500, &e.to_string()),
        }
    })
}

fn files_list(ctx: &WebContext, req: &Request) -> RouteResult {
    let prefix = req.param("prefix").unwrap_or("/").to_string();
    with_flash(ctx, |fs| {
        match serde_json::to_vec(&fs.list(&prefix)) {
            Ok(body) => (200, "application/json", body),
            Err(e) => json_err(500, &e.to_string()),
        }
    })
}

fn files_read(ctx: &WebContext, req: &Request) -> RouteResult {
    let Some(name) = req.param("name").map(str::to_string) else {
        return json_err(400, "missing name");
    };
    with_flash(ctx, |fs| {
        match fs.file_read(&name, flash_cfg::MAX_FILE_SECTORS * flash_cfg::SECTOR_SIZE as usize) {
            Ok(bytes) => (200, "application/octet-stream", bytes),
            Err(e) => json_err(404, &e.to_string()),
        }
    })
}

fn files_write(ctx: &WebContext, req: &Request, body: &[u8]) -> RouteResult {
    let Some(name) = req.param("name").map(str::to_string) else {
        return json_err(400, "missing name");
    };
    if let Err(e) = validate_flash_path(&name) {
        return json_err(400, &e);
    }
    let body = body.to_vec();
    with_flash(ctx, move |fs| match fs.file_write(&name, &body) {
        Ok(()) => json_ok(serde_json::json!({ "ok": true })),
        Err(e) => json_err(500, &e.to_string()),
    })
}

fn files_delete(ctx: &WebContext, req: &Request) -> RouteResult {
    let Some(name) = req.param("name").map(str::to_string) else {
        return json_err(400, "missing name");
    };
    if let Err(e) = validate_flash_path(&name) {
        return json_err(400, &e);
    }
    with_flash(ctx, move |fs| match fs.file_delete(&name) {
        Ok(()) => json_ok(serde_json::json!({ "ok": true })),
        Err(e) => json_err(404, &e.to_string()),
    })
}

fn diagnostics(ctx: &WebContext) -> RouteResult {
    let now = ctx.ctl.uptime.now_ms();
    json_ok(serde_json::json!({
        "uptimeMs": now,
        "watchdogs": ctx.wdt.status_report(now),
        "shuttingDown": ctx.ctl.outputs.is_shutting_down(),
        "flashAvailable": ctx.ctl.flash_available(),
    }))
}

fn form_params(body: &[u8]) -> Vec<(String, String)> {
    parse_query(&String::from_utf8_lossy(body))
}

fn wifi_save(ctx: &WebContext, req: &Request, body: &[u8]) -> RouteResult {
    let params = form_params(body);
    let find = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .or_else(|| req.param(key).map(str::to_string))
    };
    let (Some(ssid), Some(pass)) = (find("ssid"), find("pass")) else {
        return json_err(400, "missing ssid/pass");
    };
    let mut nvs = ctx.ctl.nvs.lock();
    nvs.data.wifi_ssid = Some(ssid);
    nvs.data.wifi_pass = Some(pass);
    match nvs.save() {
        Ok(()) => json_ok(serde_json::json!({ "ok": true })),
        Err(e) => json_err(500, &e.to_string()),
    }
}

fn auth_save(ctx: &WebContext, req: &Request, body: &[u8]) -> RouteResult {
    let params = form_params(body);
    let find = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .or_else(|| req.param(key).map(str::to_string))
    };
    let (Some(user), Some(pass)) = (find("user"), find("pass")) else {
        return json_err(400, "missing user/pass");
    };
    if user.is_empty() || pass.is_empty() {
        return json_err(400, "empty credentials");
    }
    let mut nvs = ctx.ctl.nvs.lock();
    nvs.data.auth_user = Some(user);
    nvs.data.auth_pass = Some(pass);
    match nvs.save() {
        Ok(()) => json_ok(serde_json::json!({ "ok": true })),
        Err(e) => json_err(500, &e.to_string()),
    }
}

// ============================================================================
// Firmware upload
// ============================================================================

/// OTA upload: the hardware watchdog is widened for the duration and pet
/// per chunk, because the transfer can legally block the Web task for many
/// seconds. The handler reports the image digest; it never reboots.
async fn handle_update(
    ctx: &WebContext,
    req: &Request,
    mut body: Vec<u8>,
    stream: &mut TcpStream,
) -> anyhow::Result<()> {
    if !req.authorized {
        return write_unauthorized(stream).await;
    }
    if req.content_length == 0 || req.content_length > MAX_FIRMWARE_SIZE {
        write_response(stream, 400, "text/plain", b"bad firmware size").await?;
        return Ok(());
    }

    ctx.wdt.hw_widen(task_cfg::HW_WDT_UPLOAD_TIMEOUT_MS);
    let result = async {
        let mut hasher = Sha256::new();
        hasher.update(&body);
        let mut received = body.len();
        body.clear();

        let mut chunk = vec![0u8; 4096];
        while received < req.content_length {
            let n = timeout(READ_TIMEOUT, stream.read(&mut chunk)).await??;
            if n == 0 {
                anyhow::bail!("connection closed mid-upload at {received} bytes");
            }
            hasher.update(&chunk[..n]);
            received += n;
            // Pet the widened watchdog from inside the transfer loop
            ctx.wdt.hw_pet(TaskId::Web, ctx.ctl.uptime.now_ms());
        }
        Ok::<_, anyhow::Error>((received, hasher.finalize()))
    }
    .await;
    ctx.wdt.hw_restore();

    match result {
        Ok((size, digest)) => {
            info!(size, "Firmware upload received");
            let body = serde_json::json!({
                "ok": true,
                "size": size,
                "sha256": format!("{digest:x}"),
            })
            .to_string();
            write_response(stream, 200, "application/json", body.as_bytes()).await
        }
        Err(e) => {
            warn!("Firmware upload failed: {e}");
            let body = serde_json::json!({ "ok": false, "error": e.to_string() }).to_string();
            write_response(stream, 500, "application/json", body.as_bytes()).await
        }
    }
}
