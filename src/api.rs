/* ********************************************************************************************************************
 *
 * Request surface
 *
 * One hyper listener publishes the query and ingestion endpoints; a second, optional management
 * listener takes over /save and /stop when configured. Every operation answers with a JSON
 * envelope whose status is one of its enumerated outcomes; there is no catch-all. A worker pool
 * that has gone silent maps to shardUnavailable with 503.
 *
 *    GET  /connections?title=T&depth=N    bounded-degree expansion (depth 0..6, default 2)
 *    GET  /paths?source=A&target=B        path search
 *    POST /page                           {"title": ..., "linkedTitles": [...]}
 *    POST /save                           {"filename": optional}
 *    POST /stop                           {"forceExit": bool, "filename": optional}
 *
 *******************************************************************************************************************/

use std::{
    collections::HashMap,
    convert::Infallible,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    path::PathBuf,
};

use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use regex::Regex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::ingest::{IngestOutcome, Rejection};
use crate::opt::OPT;
use crate::query::QueryError;
use crate::shard::AccessError;
use crate::worker::Dispatcher;

static DEFAULT_API_PORT: u16 = 6457;
static DEFAULT_MANAGEMENT_PORT: u16 = 6458;

lazy_static! {
    static ref DEFAULT_API_SOCKET: SocketAddr =
        std::net::SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_API_PORT));
    static ref DEFAULT_MANAGEMENT_SOCKET: SocketAddr = std::net::SocketAddr::V4(
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, DEFAULT_MANAGEMENT_PORT)
    );
}

/// Which endpoints a listener answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerRole {
    Combined,
    QueryOnly,
    ManagementOnly,
}

// ***********************************************************************************************

// JSON request bodies

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UpdatePageBody {
    title: String,
    linked_titles: Vec<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SaveBody {
    #[serde(default)]
    filename: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct StopBody {
    #[serde(default)]
    force_exit: bool,
    #[serde(default)]
    filename: Option<String>,
}

/* *****************************************************************************************************************
 *
 * Server
 *
 * *****************************************************************************************************************/

/// Publish the API, and the management listener when one is configured. Resolves when the
/// listeners stop; the /stop endpoint signals `stop_tx` and main tears the process down.
pub async fn serve(dispatcher: Dispatcher, stop_tx: mpsc::Sender<()>) -> Result<(), hyper::Error> {
    trace!("api::serve");
    let api_addr = get_api_address();
    match OPT.get_management() {
        Some(management) => {
            let management_addr = get_address(management, *DEFAULT_MANAGEMENT_SOCKET);
            tokio::try_join!(
                server_on(api_addr, ServerRole::QueryOnly, dispatcher.clone(), stop_tx.clone()),
                server_on(management_addr, ServerRole::ManagementOnly, dispatcher, stop_tx),
            )?;
            Ok(())
        }
        None => server_on(api_addr, ServerRole::Combined, dispatcher, stop_tx).await,
    }
}

async fn server_on(
    addr: SocketAddr,
    role: ServerRole,
    dispatcher: Dispatcher,
    stop_tx: mpsc::Sender<()>,
) -> Result<(), hyper::Error> {
    let make_service = make_service_fn(move |_| {
        let dispatcher = dispatcher.clone();
        let stop_tx = stop_tx.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                api_service(req, role, dispatcher.clone(), stop_tx.clone())
            }))
        }
    });
    let server = Server::bind(&addr).serve(make_service);
    info!("Listening on http://{} ({:?})", addr, role);
    server.await
}

async fn api_service(
    req: Request<Body>,
    role: ServerRole,
    dispatcher: Dispatcher,
    stop_tx: mpsc::Sender<()>,
) -> Result<Response<Body>, hyper::Error> {
    let path = req.uri().path().to_ascii_lowercase();
    let queries = role != ServerRole::ManagementOnly;
    let management = role != ServerRole::QueryOnly;

    if req.method() == &Method::GET && path == "/connections" && queries {
        get_links(&req, &dispatcher).await
    } else if req.method() == &Method::GET && path == "/paths" && queries {
        paths_between(&req, &dispatcher).await
    } else if req.method() == &Method::POST && path == "/page" && queries {
        update_page(req, &dispatcher).await
    } else if req.method() == &Method::POST && path == "/save" && management {
        save_dataset(req, &dispatcher).await
    } else if req.method() == &Method::POST && path == "/stop" && management {
        stop_server(req, &dispatcher, &stop_tx).await
    } else {
        let message = format!("Nothing found at {}", &path);
        Ok(json_response(
            StatusCode::NOT_FOUND,
            json!({ "status": "notFound", "message": message }),
        ))
    }
}

/* *****************************************************************************************************************
 *
 * Endpoints
 *
 * *****************************************************************************************************************/

async fn get_links(
    req: &Request<Body>,
    dispatcher: &Dispatcher,
) -> Result<Response<Body>, hyper::Error> {
    let params = query_params(req);
    let title = match params.get("title") {
        Some(title) => title.clone(),
        None => return Ok(malformed("missing title parameter")),
    };
    // Absent means the default depth; present-but-unparsable is malformed, and anything
    // above the ceiling is rejected downstream rather than clamped
    let degrees = match params.get("depth").or_else(|| params.get("degrees")) {
        Some(raw) => match raw.parse::<u32>() {
            Ok(value) => value,
            Err(_) => return Ok(malformed("depth must be a non-negative integer")),
        },
        None => 2,
    };

    match dispatcher.get_links(title, degrees).await {
        Some(Ok(subgraph)) => Ok(json_response(
            StatusCode::OK,
            json!({ "status": "ok", "subgraph": subgraph }),
        )),
        Some(Err(error)) => Ok(query_error_response(error)),
        None => Ok(unavailable()),
    }
}

async fn paths_between(
    req: &Request<Body>,
    dispatcher: &Dispatcher,
) -> Result<Response<Body>, hyper::Error> {
    let params = query_params(req);
    let (source, target) = match (params.get("source"), params.get("target")) {
        (Some(source), Some(target)) => (source.clone(), target.clone()),
        _ => return Ok(malformed("missing source or target parameter")),
    };

    match dispatcher.paths_between(source, target).await {
        Some(Ok(path_set)) => Ok(json_response(
            StatusCode::OK,
            json!({ "status": "ok", "paths": path_set.paths }),
        )),
        Some(Err(error)) => Ok(query_error_response(error)),
        None => Ok(unavailable()),
    }
}

async fn update_page(
    req: Request<Body>,
    dispatcher: &Dispatcher,
) -> Result<Response<Body>, hyper::Error> {
    let body = hyper::body::to_bytes(req.into_body()).await?;
    let page: UpdatePageBody = match serde_json::from_slice(&body) {
        Ok(page) => page,
        Err(error) => return Ok(malformed(&error.to_string())),
    };

    match dispatcher.update_page(page.title, page.linked_titles).await {
        Some(Ok(outcome)) => Ok(match outcome {
            IngestOutcome::Stored => {
                json_response(StatusCode::OK, json!({ "status": "ok", "result": "stored" }))
            }
            IngestOutcome::Disambiguation => json_response(
                StatusCode::OK,
                json!({ "status": "ok", "result": "disambiguation" }),
            ),
            IngestOutcome::Redirect => json_response(
                StatusCode::OK,
                json!({ "status": "ok", "result": "redirect" }),
            ),
            IngestOutcome::Rejected(Rejection::Malformed(reason)) => malformed(&reason),
            IngestOutcome::Rejected(Rejection::NoSpace) => json_response(
                StatusCode::INSUFFICIENT_STORAGE,
                json!({ "status": "outOfMemory" }),
            ),
        }),
        Some(Err(AccessError::CapacityExhausted)) => Ok(json_response(
            StatusCode::INSUFFICIENT_STORAGE,
            json!({ "status": "outOfMemory" }),
        )),
        Some(Err(AccessError::ShardUnavailable)) | None => Ok(unavailable()),
    }
}

async fn save_dataset(
    req: Request<Body>,
    dispatcher: &Dispatcher,
) -> Result<Response<Body>, hyper::Error> {
    let body = hyper::body::to_bytes(req.into_body()).await?;
    let save: SaveBody = if body.is_empty() {
        SaveBody { filename: None }
    } else {
        match serde_json::from_slice(&body) {
            Ok(save) => save,
            Err(error) => return Ok(malformed(&error.to_string())),
        }
    };

    match dispatcher.save_dataset(save.filename.map(PathBuf::from)).await {
        Some(Ok(path)) => Ok(json_response(
            StatusCode::OK,
            json!({ "status": "ok", "savedTo": path.to_string_lossy() }),
        )),
        Some(Err(reason)) => Ok(json_response(
            StatusCode::INSUFFICIENT_STORAGE,
            json!({ "status": "noSpaceToSave", "reason": reason }),
        )),
        None => Ok(unavailable()),
    }
}

async fn stop_server(
    req: Request<Body>,
    dispatcher: &Dispatcher,
    stop_tx: &mpsc::Sender<()>,
) -> Result<Response<Body>, hyper::Error> {
    let body = hyper::body::to_bytes(req.into_body()).await?;
    let stop: StopBody = if body.is_empty() {
        StopBody {
            force_exit: false,
            filename: None,
        }
    } else {
        match serde_json::from_slice(&body) {
            Ok(stop) => stop,
            Err(error) => return Ok(malformed(&error.to_string())),
        }
    };

    match dispatcher.save_dataset(stop.filename.map(PathBuf::from)).await {
        Some(Ok(path)) => {
            info!("api:: stopping; dataset saved to {:?}", path);
            let _ = stop_tx.send(()).await;
            Ok(json_response(
                StatusCode::OK,
                json!({ "status": "ok", "savedTo": path.to_string_lossy() }),
            ))
        }
        failed => {
            let reason = match failed {
                Some(Err(reason)) => reason,
                _ => "worker pool unavailable".to_string(),
            };
            // A failed save only halts the server when the caller forces it
            if stop.force_exit {
                error!("api:: save failed ({}); halting anyway (forceExit)", reason);
                let _ = stop_tx.send(()).await;
            }
            Ok(json_response(
                StatusCode::INSUFFICIENT_STORAGE,
                json!({ "status": "noSpaceToSave", "reason": reason, "halting": stop.force_exit }),
            ))
        }
    }
}

/* *****************************************************************************************************************
 *
 * Response and parameter plumbing
 *
 * *****************************************************************************************************************/

// Extract query options from uri
// From: https://users.rust-lang.org/t/using-hyper-how-to-get-url-query-string-params/23768/2

fn query_params(req: &Request<Body>) -> HashMap<String, String> {
    req.uri()
        .query()
        .map(|v| {
            url::form_urlencoded::parse(v.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_else(HashMap::new)
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn malformed(reason: &str) -> Response<Body> {
    json_response(
        StatusCode::BAD_REQUEST,
        json!({ "status": "malformed", "reason": reason }),
    )
}

fn unavailable() -> Response<Body> {
    json_response(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({ "status": "shardUnavailable" }),
    )
}

fn query_error_response(error: QueryError) -> Response<Body> {
    let (status, label) = match error {
        QueryError::PageNotFound => (StatusCode::NOT_FOUND, "pageNotFound"),
        QueryError::TooManyDegrees => (StatusCode::BAD_REQUEST, "tooManyDegrees"),
        QueryError::SourceNotFound => (StatusCode::NOT_FOUND, "sourceNotFound"),
        QueryError::TargetNotFound => (StatusCode::NOT_FOUND, "targetNotFound"),
        QueryError::NoPathFound => (StatusCode::NOT_FOUND, "noPathFound"),
        QueryError::ShardUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "shardUnavailable"),
    };
    json_response(status, json!({ "status": label }))
}

/* *****************************************************************************************************************
 *
 * Listen addresses
 *
 * *****************************************************************************************************************/

fn get_api_address() -> SocketAddr {
    match OPT.get_api() {
        Some(api_target) => get_address(api_target, *DEFAULT_API_SOCKET),
        None => *DEFAULT_API_SOCKET,
    }
}

fn get_address(addr: &str, default: SocketAddr) -> SocketAddr {
    match try_v4_address(addr, default) {
        Some(socket) => socket,
        None => default,
    }
}

/// Parse "a.b.c.d:port", "a.b.c.d" or ":port", falling back to the default for whichever
/// half is absent. Out-of-range octets and ports are configuration errors.
fn try_v4_address(address_from_command_line: &str, default: SocketAddr) -> Option<SocketAddr> {
    let v4_match =
        Regex::new(r"^((\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3}))?(:(\d{1,5}))?$").unwrap();

    let caps = match v4_match.captures(address_from_command_line) {
        Some(caps) => caps,
        None => return None,
    };
    if caps.get(1).is_none() && caps.get(7).is_none() {
        return None;
    }

    let ip = match caps.get(1) {
        Some(_) => {
            let mut address_builder: Vec<u8> = Vec::with_capacity(4);
            for group in 2..6 {
                let octet: u16 = caps.get(group).unwrap().as_str().parse().unwrap();
                if octet > 255 {
                    panic!(
                        "IPv4 address should use octets in the range 0-255. Found {} in address.",
                        octet
                    );
                }
                address_builder.push(octet as u8);
            }
            std::net::IpAddr::V4(Ipv4Addr::new(
                address_builder[0],
                address_builder[1],
                address_builder[2],
                address_builder[3],
            ))
        }
        None => default.ip(),
    };

    let port = match caps.get(7) {
        Some(raw) => {
            let port: u32 = raw.as_str().parse().unwrap();
            if port > u16::MAX as u32 {
                panic!("Port should be in the range 0-65535. Found {} in address.", port);
            }
            port as u16
        }
        None => default.port(),
    };

    Some(SocketAddr::new(ip, port))
}

/* *****************************************************************************************************************
 *
 * Tests
 *
 * *****************************************************************************************************************/
