use std::{env, future::Future, net::SocketAddr, path::PathBuf, str::FromStr, sync::Arc, time::Instant};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::server::conn::http1;
use hyper::{body::Incoming, service::service_fn, Request, Response};
use hyper_util::rt::TokioIo;
use quarry_plugin_sdk::{
    resolve_connection, ConnectionProfile, PluginFactory, PROTOCOL_VERSION,
};
use tokio::{net::TcpListener, sync::watch, task::JoinSet};
use tracing_subscriber::{fmt, EnvFilter};

use crate::dispatch::{ListRequest, PluginRuntime};

type PluginBody = BoxBody<Bytes, hyper::Error>;

/// Harness-level settings plus the factory reference. Constructing this value
/// performs no I/O and does not invoke the factory; all side effects are
/// deferred to [`bootstrap`].
pub struct ServeOptions {
    pub factory: Arc<dyn PluginFactory>,
    pub log_level: String,
    pub listen: SocketAddr,
    pub connection_path: Option<PathBuf>,
}

impl ServeOptions {
    pub fn new(factory: Arc<dyn PluginFactory>) -> Self {
        Self {
            factory,
            log_level: "info".into(),
            listen: SocketAddr::from(([127, 0, 0, 1], 0)),
            connection_path: None,
        }
    }

    /// Reads harness settings from `QUARRY_LOG`, `QUARRY_LISTEN` and
    /// `QUARRY_CONNECTION`. The plugin process itself interprets no
    /// command-line arguments; the launching host owns those.
    pub fn from_env(factory: Arc<dyn PluginFactory>) -> Result<Self> {
        let mut opts = Self::new(factory);
        if let Ok(level) = env::var("QUARRY_LOG") {
            opts.log_level = level;
        }
        if let Ok(listen) = env::var("QUARRY_LISTEN") {
            opts.listen = parse_listen_addr(&listen)
                .with_context(|| format!("invalid QUARRY_LISTEN value `{listen}`"))?;
        }
        if let Ok(path) = env::var("QUARRY_CONNECTION") {
            opts.connection_path = Some(PathBuf::from(path));
        }
        Ok(opts)
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_connection_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.connection_path = Some(path.into());
        self
    }
}

/// Why a harness returned control. Both variants are clean exits; failures
/// travel through `Err` and end the process with a non-zero status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The host requested shutdown or closed the serving channel.
    HostShutdown,
    /// The process received an interrupt signal.
    Interrupted,
}

/// Narrow seam toward the component that owns the host transport and request
/// loop. [`bootstrap`] invokes `serve` exactly once per process lifetime.
pub trait Harness {
    fn serve(
        &self,
        plugin: PluginRuntime,
        opts: &ServeOptions,
    ) -> impl Future<Output = Result<ExitReason>> + Send;
}

/// Runs the plugin for the process lifetime with the default TCP harness.
/// Does not return under normal operation until the host shuts us down.
pub async fn serve(opts: ServeOptions) -> Result<()> {
    bootstrap(&HostHarness, &opts).await
}

/// Builds the plugin runtime and hands it off to the harness.
///
/// All construction failures (factory error, descriptor validation,
/// connection resolution) return before the harness is invoked; a partially
/// initialized plugin must never reach the serving state.
pub async fn bootstrap<H: Harness>(harness: &H, opts: &ServeOptions) -> Result<()> {
    init_tracing(&opts.log_level);

    let descriptor = opts
        .factory
        .build()
        .context("plugin factory failed to build a descriptor")?;
    descriptor.validate()?;

    let connection = match &opts.connection_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read connection file {}", path.display()))?;
            resolve_connection(&descriptor.connection, &raw)?
        }
        None => {
            if descriptor.connection.has_required_attributes() {
                bail!(
                    "plugin `{}` requires connection configuration; set QUARRY_CONNECTION",
                    descriptor.name
                );
            }
            ConnectionProfile::empty()
        }
    };

    let runtime = PluginRuntime::new(descriptor, connection)?;
    tracing::info!(
        plugin = %runtime.name(),
        version = %runtime.version(),
        tables = ?runtime.table_names(),
        "plugin descriptor ready; handing off to serve harness"
    );

    match harness.serve(runtime, opts).await? {
        ExitReason::HostShutdown => tracing::info!("host requested shutdown; exiting"),
        ExitReason::Interrupted => tracing::info!("interrupted; exiting"),
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout belongs to the handshake line; all diagnostics go to stderr.
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

/// Accepts `host:port` or the `:port` shorthand, which binds loopback only.
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr> {
    if let Some(port) = value.strip_prefix(':') {
        let addr = format!("127.0.0.1:{port}");
        Ok(SocketAddr::from_str(&addr)?)
    } else {
        Ok(SocketAddr::from_str(value)?)
    }
}

/// Default harness: serves the plugin over loopback TCP and announces the
/// bound address to the launching host on stdout.
pub struct HostHarness;

impl Harness for HostHarness {
    async fn serve(&self, plugin: PluginRuntime, opts: &ServeOptions) -> Result<ExitReason> {
        let bound = BoundHarness::bind(opts.listen).await?;
        // The single line the launching host reads from our stdout.
        println!(
            "{}|{}|{}|tcp|{}",
            PROTOCOL_VERSION,
            plugin.name(),
            plugin.version(),
            bound.local_addr()
        );
        bound.serve(plugin).await
    }
}

/// Bind/serve split so the ephemeral port is observable before serving
/// starts; the default harness announces it, tests connect to it.
pub struct BoundHarness {
    listener: TcpListener,
    addr: SocketAddr,
}

impl BoundHarness {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind plugin listener on {addr}"))?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn serve(self, plugin: PluginRuntime) -> Result<ExitReason> {
        let state = Arc::new(plugin);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let mut join_set = JoinSet::new();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        tracing::info!(addr = %self.addr, plugin = %state.name(), "serve harness ready");

        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {
                    tracing::info!("shutdown requested; draining connections");
                    break ExitReason::HostShutdown;
                }
                _ = &mut ctrl_c => {
                    tracing::info!("interrupt received; draining connections");
                    break ExitReason::Interrupted;
                }
                accept = self.listener.accept() => {
                    let (stream, peer_addr) = accept.context("accept failed")?;
                    let state = state.clone();
                    let shutdown_tx = shutdown_tx.clone();
                    join_set.spawn(async move {
                        if let Err(err) = handle_connection(stream, peer_addr, state, shutdown_tx).await {
                            tracing::warn!(error = %err, "connection closed with error");
                        }
                    });
                }
            }
        };

        // Wake idle keep-alive connections so the drain below terminates.
        shutdown_tx.send(true).ok();
        while let Some(result) = join_set.join_next().await {
            if let Err(err) = result {
                tracing::error!(error = %err, "connection task aborted");
            }
        }

        Ok(reason)
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    peer_addr: SocketAddr,
    state: Arc<PluginRuntime>,
    shutdown_tx: watch::Sender<bool>,
) -> Result<()> {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let service = service_fn(move |req| {
        let state = state.clone();
        let shutdown_tx = shutdown_tx.clone();
        async move { Ok::<_, hyper::Error>(handle_request(state, shutdown_tx, req).await) }
    });
    let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);
    tokio::select! {
        result = &mut conn => {
            result.with_context(|| format!("connection from {peer_addr} failed"))
        }
        _ = shutdown_rx.changed() => {
            // Finish any in-flight response (the shutdown ack included),
            // then close the connection.
            conn.as_mut().graceful_shutdown();
            conn.await.ok();
            Ok(())
        }
    }
}

async fn handle_request(
    state: Arc<PluginRuntime>,
    shutdown_tx: watch::Sender<bool>,
    req: Request<Incoming>,
) -> Response<PluginBody> {
    let start = Instant::now();
    let span = tracing::info_span!(
        "request",
        method = %req.method(),
        path = %req.uri().path(),
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    );
    let _enter = span.enter();

    let response = match route_request(&state, &shutdown_tx, req).await {
        Ok(response) => response,
        Err(err) => {
            tracing::error!(error = %err, "request handling failed");
            metrics::counter!("quarry_requests_total", "outcome" => "error").increment(1);
            internal_error()
        }
    };
    span.record("status", response.status().as_u16());
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    response
}

async fn route_request(
    state: &Arc<PluginRuntime>,
    shutdown_tx: &watch::Sender<bool>,
    req: Request<Incoming>,
) -> Result<Response<PluginBody>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::GET && path == "/schema" {
        metrics::counter!("quarry_requests_total", "outcome" => "ok").increment(1);
        return Ok(json_response(StatusCode::OK, state.schema_json()));
    }

    if method == Method::POST && path == "/shutdown" {
        metrics::counter!("quarry_requests_total", "outcome" => "ok").increment(1);
        shutdown_tx.send(true).ok();
        return Ok(json_response(
            StatusCode::OK,
            Bytes::from_static(b"{\"status\":\"shutting_down\"}"),
        ));
    }

    if method == Method::POST {
        if let Some(table) = path.strip_prefix("/list/") {
            let body = req
                .into_body()
                .collect()
                .await
                .context("failed to read request body")?
                .to_bytes();
            let request = if body.is_empty() {
                ListRequest::default()
            } else {
                match serde_json::from_slice::<ListRequest>(&body) {
                    Ok(request) => request,
                    Err(err) => return Ok(bad_request(&err.to_string())),
                }
            };
            return match state.list(table, request).await? {
                Some(rows) => {
                    metrics::counter!("quarry_requests_total", "outcome" => "ok").increment(1);
                    let payload =
                        serde_json::to_vec(&serde_json::json!({ "rows": rows }))
                            .context("failed to serialize rows")?;
                    Ok(json_response(StatusCode::OK, Bytes::from(payload)))
                }
                None => {
                    tracing::debug!(table, "unknown table requested");
                    metrics::counter!("quarry_requests_total", "outcome" => "miss").increment(1);
                    Ok(not_found())
                }
            };
        }
    }

    metrics::counter!("quarry_requests_total", "outcome" => "miss").increment(1);
    Ok(not_found())
}

fn json_response(status: StatusCode, payload: Bytes) -> Response<PluginBody> {
    let body = Full::new(payload).map_err(|never| match never {}).boxed();
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(body)
        .unwrap()
}

fn not_found() -> Response<PluginBody> {
    json_response(
        StatusCode::NOT_FOUND,
        Bytes::from_static(b"{\"error\":\"not found\"}"),
    )
}

fn bad_request(message: &str) -> Response<PluginBody> {
    let payload = serde_json::json!({ "error": message }).to_string();
    json_response(StatusCode::BAD_REQUEST, Bytes::from(payload))
}

fn internal_error() -> Response<PluginBody> {
    json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        Bytes::from_static(b"{\"error\":\"internal error\"}"),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hyper_util::{
        client::legacy::{connect::HttpConnector, Client},
        rt::TokioExecutor,
    };
    use quarry_plugin_sdk::{
        AttributeKind, AttributeSpec, Column, ColumnKind, ConnectionSchema, PluginDescriptor,
        QueryContext, Row, TableProvider, TableSchema,
    };
    use serde_json::{json, Value};

    use super::*;

    struct StaticTable;

    impl TableProvider for StaticTable {
        fn list(&self, _ctx: &QueryContext) -> Result<Vec<Row>> {
            let mut row = Row::new();
            row.insert("id".into(), json!(1));
            row.insert("label".into(), json!("one"));
            Ok(vec![row])
        }
    }

    struct StaticFactory {
        builds: Arc<AtomicUsize>,
    }

    impl StaticFactory {
        fn new() -> (Arc<Self>, Arc<AtomicUsize>) {
            let builds = Arc::new(AtomicUsize::new(0));
            (
                Arc::new(Self {
                    builds: builds.clone(),
                }),
                builds,
            )
        }
    }

    impl PluginFactory for StaticFactory {
        fn build(&self) -> Result<PluginDescriptor> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(
                PluginDescriptor::new("fixture", semver::Version::new(0, 1, 0)).table(
                    TableSchema {
                        name: "widget".into(),
                        columns: vec![
                            Column::new("id", ColumnKind::Integer),
                            Column::new("label", ColumnKind::String),
                        ],
                        ..TableSchema::default()
                    },
                    Arc::new(StaticTable),
                ),
            )
        }
    }

    struct FailingFactory;

    impl PluginFactory for FailingFactory {
        fn build(&self) -> Result<PluginDescriptor> {
            anyhow::bail!("descriptor metadata is incomplete")
        }
    }

    struct RecordingHarness {
        calls: Arc<AtomicUsize>,
    }

    impl RecordingHarness {
        fn new() -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    impl Harness for RecordingHarness {
        async fn serve(&self, _plugin: PluginRuntime, _opts: &ServeOptions) -> Result<ExitReason> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExitReason::HostShutdown)
        }
    }

    #[test]
    fn constructing_options_invokes_nothing() {
        let (factory, builds) = StaticFactory::new();
        let _opts = ServeOptions::new(factory).with_log_level("debug");
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listen_shorthand_binds_loopback() {
        assert_eq!(
            parse_listen_addr(":7433").unwrap(),
            SocketAddr::from_str("127.0.0.1:7433").unwrap()
        );
        assert!(parse_listen_addr("not an addr").is_err());
    }

    #[tokio::test]
    async fn bootstrap_hands_off_exactly_once() {
        let (factory, builds) = StaticFactory::new();
        let (harness, calls) = RecordingHarness::new();
        let opts = ServeOptions::new(factory);
        bootstrap(&harness, &opts).await.unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn factory_failure_is_fatal_before_handoff() {
        let (harness, calls) = RecordingHarness::new();
        let opts = ServeOptions::new(Arc::new(FailingFactory));
        let err = bootstrap(&harness, &opts).await.unwrap_err();
        assert!(err.to_string().contains("plugin factory failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    struct GuardedFactory;

    impl PluginFactory for GuardedFactory {
        fn build(&self) -> Result<PluginDescriptor> {
            Ok(
                PluginDescriptor::new("guarded", semver::Version::new(0, 1, 0))
                    .table(
                        TableSchema {
                            name: "widget".into(),
                            columns: vec![Column::new("id", ColumnKind::Integer)],
                            ..TableSchema::default()
                        },
                        Arc::new(StaticTable),
                    )
                    .connection(
                        ConnectionSchema::default()
                            .attribute("token", AttributeSpec::required(AttributeKind::String)),
                    ),
            )
        }
    }

    #[tokio::test]
    async fn missing_required_connection_is_fatal_before_handoff() {
        let (harness, calls) = RecordingHarness::new();
        let opts = ServeOptions::new(Arc::new(GuardedFactory));
        let err = bootstrap(&harness, &opts).await.unwrap_err();
        assert!(err.to_string().contains("requires connection configuration"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    async fn spawn_fixture_harness() -> (
        SocketAddr,
        tokio::task::JoinHandle<Result<ExitReason>>,
        Client<HttpConnector, Full<Bytes>>,
    ) {
        let (factory, _) = StaticFactory::new();
        let descriptor = factory.build().unwrap();
        descriptor.validate().unwrap();
        let runtime = PluginRuntime::new(descriptor, ConnectionProfile::empty()).unwrap();
        let bound = BoundHarness::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = bound.local_addr();
        let server = tokio::spawn(bound.serve(runtime));
        let client = Client::builder(TokioExecutor::new()).build_http();
        (addr, server, client)
    }

    async fn body_json(response: Response<Incoming>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn harness_serves_schema_rows_and_shutdown() {
        let (addr, server, client) = spawn_fixture_harness().await;

        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("http://{addr}/schema"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let schema = body_json(response).await;
        assert_eq!(schema["name"], json!("fixture"));
        assert!(schema["tables"]["widget"].is_object());

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}/list/widget"))
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rows = body_json(response).await;
        assert_eq!(rows["rows"][0]["label"], json!("one"));

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}/list/missing"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}/list/widget"))
            .body(Full::new(Bytes::from_static(b"{\"quals\": 5}")))
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}/shutdown"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let reason = server.await.unwrap().unwrap();
        assert_eq!(reason, ExitReason::HostShutdown);
    }

    #[tokio::test]
    async fn wire_quals_filter_rows() {
        let (addr, server, client) = spawn_fixture_harness().await;

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}/list/widget"))
            .body(Full::new(Bytes::from_static(
                b"{\"quals\":[{\"column\":\"id\",\"op\":\"=\",\"value\":2}]}",
            )))
            .unwrap();
        let response = client.request(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let rows = body_json(response).await;
        assert_eq!(rows["rows"], json!([]));

        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("http://{addr}/shutdown"))
            .body(Full::new(Bytes::new()))
            .unwrap();
        client.request(request).await.unwrap();
        server.await.unwrap().unwrap();
    }
}
