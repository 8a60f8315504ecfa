use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::Result;
use http::StatusCode;
use tracing::{debug, warn};

use crate::logging::AccessLogBuilder;

use super::AppContext;
use super::error::ProxyError;
use super::http::{ReadLimits, read_message};
use super::net::Connection;
use super::request::Request;
use super::response::{Response, fetch, fetch_message};

/// Drive one client connection through the full pipeline: intake,
/// parse, blocklist gate, header rewrite, cache or direct fetch,
/// relay, close.
pub async fn handle_client(mut conn: Connection, app: AppContext) -> Result<()> {
    let start = Instant::now();
    let peer_ip = conn.peer_ip();
    let keep_alive = app.settings.keep_alive;
    let limits = ReadLimits {
        keep_alive,
        max_header_bytes: app.settings.max_header_bytes,
        max_body_bytes: app.settings.max_body_bytes,
    };

    let message = match read_message(&mut conn, &limits).await {
        Ok(message) => message,
        Err(err) if err.is_silent_close() => {
            debug!(peer = %peer_ip, error = %err, "closing connection without a response");
            conn.shutdown().await;
            return Ok(());
        }
        Err(err) => {
            // Anything that goes wrong while the request is still being
            // read is surfaced as a 400, transport failures included.
            let log = AccessLogBuilder::new(peer_ip).cache("none");
            return respond_error(conn, StatusCode::BAD_REQUEST, &err, keep_alive, start, log)
                .await;
        }
    };

    let mut request = match Request::parse(message) {
        Ok(request) => request,
        Err(err) => {
            let log = AccessLogBuilder::new(peer_ip).cache("none");
            return respond_error(conn, err.status(), &err, keep_alive, start, log).await;
        }
    };
    let log_host = request.host.clone().unwrap_or_default();
    let log_path = request.path.clone();
    let access_log = move |cache: &'static str| {
        AccessLogBuilder::new(peer_ip)
            .method("GET")
            .host(log_host.clone())
            .path(log_path.clone())
            .cache(cache)
    };

    if let Some(host) = request.host.clone() {
        match app.blocklist.check(&host).await {
            Ok(false) => {}
            Ok(true) => {
                let err = ProxyError::BlockedHost(host);
                return respond_error(
                    conn,
                    err.status(),
                    &err,
                    keep_alive,
                    start,
                    access_log("blocked"),
                )
                .await;
            }
            Err(err) => {
                return respond_error(conn, err.status(), &err, keep_alive, start, access_log("none"))
                    .await;
            }
        }
    }

    request.rewrite_for_upstream(peer_ip);
    let key = request.cache_key();

    let (outcome, cache_disposition) = if key.is_empty() {
        (
            fetch(&mut request, keep_alive, &limits).await,
            "bypass",
        )
    } else {
        let resolved = AtomicBool::new(false);
        let fetched = app
            .cache
            .get(&key, |mut writer| {
                let request = &mut request;
                let resolved = &resolved;
                let limits = &limits;
                async move {
                    resolved.store(true, Ordering::Relaxed);
                    let mut message = fetch_message(request, keep_alive, limits).await?;
                    let bytes = message.to_bytes()?;
                    writer.fill(&bytes).await?;
                    Ok(writer)
                }
            })
            .await;
        let disposition = if resolved.load(Ordering::Relaxed) {
            "miss"
        } else {
            "hit"
        };
        let response = fetched.and_then(|bytes| {
            Response::from_bytes(bytes)
                .map_err(|err| ProxyError::FetchFailed(err.to_string()))
        });
        (response, disposition)
    };

    let mut response = match outcome {
        Ok(response) => response,
        Err(err) => {
            return respond_error(
                conn,
                err.status(),
                &err,
                keep_alive,
                start,
                access_log(cache_disposition),
            )
            .await;
        }
    };

    match response.send(&mut conn, keep_alive).await {
        Ok(bytes_out) => {
            access_log(cache_disposition)
                .status(response.status)
                .bytes_out(bytes_out)
                .elapsed(start.elapsed())
                .log();
        }
        Err(err) => {
            debug!(peer = %peer_ip, error = %err, "failed to relay response to client");
        }
    }
    conn.shutdown().await;
    Ok(())
}

/// Synthesize an error response for the given status, send it, close.
async fn respond_error(
    mut conn: Connection,
    status: StatusCode,
    err: &ProxyError,
    keep_alive: std::time::Duration,
    start: Instant,
    log: AccessLogBuilder,
) -> Result<()> {
    warn!(status = status.as_u16(), error = %err, "request failed");
    let reason = status.canonical_reason().unwrap_or("Error");
    let mut response = Response::synthesize_error(status, reason);
    match response.send(&mut conn, keep_alive).await {
        Ok(bytes_out) => {
            log.status(status)
                .bytes_out(bytes_out)
                .elapsed(start.elapsed())
                .log();
        }
        Err(send_err) => {
            debug!(error = %send_err, "failed to deliver error response");
        }
    }
    conn.shutdown().await;
    Ok(())
}
