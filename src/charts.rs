//! Real-time chart server.
//!
//! A small hyper server that serves one HTML page, two embedded JS assets
//! and two JSON data endpoints fed from the aggregator's rolling one-second
//! window. The page polls `/data/latency` and `/data/rps` once per second.
//! Failing to bind is a configuration error; losing the listener later does
//! not abort the run.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use hyper::header::CONTENT_TYPE;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use tracing::{error, warn};

use crate::aggregator::Aggregator;
use crate::config::ConfigError;

const INDEX_HTML: &str = include_str!("../assets/index.html");
const ECHARTS_JS: &str = include_str!("../assets/echarts.min.js");
const JQUERY_JS: &str = include_str!("../assets/jquery.min.js");

/// Turns the `--listen` form (`:18888` or `host:port`) into a socket
/// address.
pub fn parse_listen_addr(listen: &str) -> Result<SocketAddr, ConfigError> {
    let full = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    full.parse().map_err(|e| ConfigError::ChartBind {
        addr: listen.to_string(),
        message: format!("{}", e),
    })
}

/// Binds the chart server and returns its bound address plus the serve
/// future for the caller to spawn.
pub fn serve(
    addr: SocketAddr,
    aggregator: Arc<Aggregator>,
) -> Result<(SocketAddr, impl Future<Output = ()>), ConfigError> {
    let builder = Server::try_bind(&addr).map_err(|e| ConfigError::ChartBind {
        addr: addr.to_string(),
        message: e.to_string(),
    })?;
    let make_svc = make_service_fn(move |_conn| {
        let aggregator = aggregator.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(req, aggregator.clone())))
        }
    });
    let server = builder.serve(make_svc);
    let local_addr = server.local_addr();
    let fut = async move {
        if let Err(e) = server.await {
            error!(error = %e, "chart server terminated");
        }
    };
    Ok((local_addr, fut))
}

async fn handle(
    req: Request<Body>,
    aggregator: Arc<Aggregator>,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") => with_type("text/html; charset=utf-8", INDEX_HTML),
        (&Method::GET, "/echarts/statics/echarts.min.js") => {
            with_type("application/javascript", ECHARTS_JS)
        }
        (&Method::GET, "/echarts/statics/jquery.min.js") => {
            with_type("application/javascript", JQUERY_JS)
        }
        (&Method::GET, "/data/latency") => {
            let values = aggregator.charts().map(|c| {
                vec![
                    millis(c.latency.min),
                    millis(c.latency.mean),
                    millis(c.latency.max),
                ]
            });
            data_response(values)
        }
        (&Method::GET, "/data/rps") => {
            let values = aggregator.charts().map(|c| vec![c.rps]);
            data_response(values)
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found"))
            .unwrap_or_default(),
    };
    Ok(response)
}

fn with_type(content_type: &str, body: &'static str) -> Response<Body> {
    Response::builder()
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap_or_default()
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1e3
}

/// One polled data point; an empty `values` array means "no samples in the
/// last second".
#[derive(Serialize)]
struct ChartPoint {
    time: String,
    values: Vec<f64>,
}

fn data_response(values: Option<Vec<f64>>) -> Response<Body> {
    let point = ChartPoint {
        time: Local::now().format("%H:%M:%S").to_string(),
        values: values.unwrap_or_default(),
    };
    let payload = serde_json::to_string(&point).unwrap_or_default();
    Response::builder()
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(payload))
        .unwrap_or_default()
}

/// Best-effort launch of the platform browser opener; failures only warn.
pub fn open_browser(url: &str) {
    #[cfg(target_os = "macos")]
    let mut cmd = {
        let mut c = Command::new("open");
        c.arg(url);
        c
    };
    #[cfg(target_os = "windows")]
    let mut cmd = {
        let mut c = Command::new("cmd");
        c.args(["/c", "start", url]);
        c
    };
    #[cfg(all(unix, not(target_os = "macos")))]
    let mut cmd = {
        let mut c = Command::new("xdg-open");
        c.arg(url);
        c
    };
    if let Err(e) = cmd.spawn() {
        warn!(url = url, error = %e, "failed to open browser");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use std::time::Instant;

    fn request(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let agg = Arc::new(Aggregator::new(Instant::now()));
        let res = handle(request("/nope"), agg).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_index_and_assets_served() {
        let agg = Arc::new(Aggregator::new(Instant::now()));
        for path in ["/", "/echarts/statics/echarts.min.js", "/echarts/statics/jquery.min.js"] {
            let res = handle(request(path), agg.clone()).await.unwrap();
            assert_eq!(res.status(), StatusCode::OK, "path {}", path);
        }
    }

    #[tokio::test]
    async fn test_data_endpoints_shape() {
        let agg = Arc::new(Aggregator::new(Instant::now()));
        agg.ingest(&Record {
            elapsed: Duration::from_millis(12),
            code: "2xx",
            error: String::new(),
            read_bytes: 0,
            write_bytes: 0,
        });
        agg.roll_second();

        let res = handle(request("/data/latency"), agg.clone()).await.unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&body_string(res).await).unwrap();
        assert_eq!(parsed["values"].as_array().unwrap().len(), 3);
        assert!(parsed["time"].is_string());

        let res = handle(request("/data/rps"), agg.clone()).await.unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&body_string(res).await).unwrap();
        assert_eq!(parsed["values"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_data_empty_when_idle() {
        let agg = Arc::new(Aggregator::new(Instant::now()));
        let res = handle(request("/data/latency"), agg).await.unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&body_string(res).await).unwrap();
        assert!(parsed["values"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_parse_listen_forms() {
        assert_eq!(
            parse_listen_addr(":18888").unwrap().to_string(),
            "0.0.0.0:18888"
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap().to_string(),
            "127.0.0.1:9000"
        );
        assert!(parse_listen_addr("bogus").is_err());
    }
}
