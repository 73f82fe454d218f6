use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{json, Value};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    error::{BridgeError, Result},
    state::SharedSpeedState,
    types::{Command, SpeedUnit},
};

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Longest request or header line accepted, CRLF included
pub const MAX_HEADER_LINE_BYTES: usize = 8 * 1024;

/// Largest request head (request line plus headers) accepted
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Time allowed for a client to send a complete request
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Path that queues a transmitter start
pub const ANT_START_PATH: &str = "/diagnostic/antstart";

/// Path that queues a transmitter stop
pub const ANT_STOP_PATH: &str = "/diagnostic/antstop";

/// Status code and JSON body of an ingest reply
#[derive(Debug, Clone, PartialEq)]
pub struct IngestResponse {
    /// HTTP status code
    pub status: u16,
    /// JSON body
    pub body: Value,
}

impl IngestResponse {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "error": message }),
        }
    }

    /// Reason phrase for the status code
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            400 => "Bad Request",
            405 => "Method Not Allowed",
            408 => "Request Timeout",
            413 => "Payload Too Large",
            431 => "Request Header Fields Too Large",
            _ => "Internal Server Error",
        }
    }

    /// Serialize as an HTTP/1.1 response
    #[must_use]
    pub fn to_http_bytes(&self) -> Bytes {
        let body = self.body.to_string();
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.reason(),
            body.len()
        );

        let mut buf = BytesMut::with_capacity(head.len() + body.len());
        buf.put_slice(head.as_bytes());
        buf.put_slice(body.as_bytes());
        buf.freeze()
    }
}

/// Extract the posted speed from a request payload
///
/// A JSON array is accepted and its first element used.
///
/// # Errors
///
/// Returns [`BridgeError::MissingField`] if there is no numeric `speed` field.
pub fn parse_speed(data: &Value) -> Result<f64> {
    data.get("speed")
        .and_then(Value::as_f64)
        .ok_or(BridgeError::MissingField("speed"))
}

/// Receives speed samples posted by the speed source
///
/// Routes:
/// - `POST` (any path): JSON body with a numeric `speed`, stored as the current
///   sample
/// - `GET /diagnostic/antstart`, `GET /diagnostic/antstop`: queue a command
/// - any other `GET`: liveness reply
pub struct Ingest {
    state: Arc<SharedSpeedState>,
    unit: SpeedUnit,
}

impl Ingest {
    /// Create an ingest writing into `state`, reading `speed` in `unit`
    #[must_use]
    pub const fn new(state: Arc<SharedSpeedState>, unit: SpeedUnit) -> Self {
        Self { state, unit }
    }

    /// Parse a POST body and record its speed
    ///
    /// Returns the received JSON value (first element if an array was posted).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidJson`] for malformed bodies and
    /// [`BridgeError::MissingField`] when `speed` is absent. Shared state is
    /// untouched on error.
    pub fn ingest(&self, body: &[u8]) -> Result<Value> {
        let mut data: Value =
            serde_json::from_slice(body).map_err(|e| BridgeError::InvalidJson(e.to_string()))?;

        if let Value::Array(items) = data {
            data = items.into_iter().next().unwrap_or(Value::Null);
        }

        debug!("Received JSON: {}", data);

        let raw = parse_speed(&data)?;
        let speed_kmh = self.unit.to_kmh(raw);
        self.state.record_sample(speed_kmh / 3.6, Instant::now());

        debug!("Speed [recv]: {} Speed [km/h]: {:.1}", raw, speed_kmh);
        Ok(data)
    }

    /// Route one request
    #[must_use]
    pub fn handle(&self, method: &str, target: &str, body: &[u8]) -> IngestResponse {
        let path = target.split('?').next().unwrap_or(target);

        match (method, path) {
            ("POST", _) => match self.ingest(body) {
                Ok(data) => IngestResponse::ok(json!({
                    "message": "JSON received successfully",
                    "received_data": data,
                })),
                Err(BridgeError::InvalidJson(_)) => IngestResponse::error(400, "Invalid JSON"),
                Err(e) if e.is_client_error() => {
                    IngestResponse::error(400, "Missing speed field")
                }
                Err(e) => {
                    warn!("Failed to ingest speed sample: {}", e);
                    IngestResponse::error(500, "Internal error")
                }
            },
            ("GET", ANT_START_PATH) => self.enqueue(Command::Start),
            ("GET", ANT_STOP_PATH) => self.enqueue(Command::Stop),
            ("GET", _) => IngestResponse::ok(json!({
                "message": "This is a GET response",
                "status": "success",
            })),
            _ => IngestResponse::error(405, "Method not allowed"),
        }
    }

    fn enqueue(&self, command: Command) -> IngestResponse {
        info!("Diagnostic request: queueing {}", command);
        self.state.push_command(command);
        IngestResponse::ok(json!({
            "message": format!("ANT+ {command} requested"),
            "command": command,
        }))
    }

    /// Accept connections until the task is dropped
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Server running on http://{}/", addr),
            Err(e) => warn!("Server running on unknown address: {}", e),
        }

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let ingest = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = ingest.handle_connection(stream).await {
                    debug!("{} - connection error: {}", peer, e);
                }
            });
        }
    }

    /// Serve a single request and close the connection
    async fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        let peer = stream.peer_addr()?;

        let request = timeout(
            Duration::from_millis(REQUEST_TIMEOUT_MS),
            read_request(&mut stream),
        )
        .await
        .map_err(|_| BridgeError::Timeout {
            timeout_ms: REQUEST_TIMEOUT_MS,
        });

        let response = match request {
            Ok(Ok(Some(HttpRequest {
                method,
                target,
                body,
            }))) => {
                let response = self.handle(&method, &target, &body);
                debug!("{} - \"{} {}\" {}", peer, method, target, response.status);
                response
            }
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(RequestError::Malformed)) => IngestResponse::error(400, "Malformed request"),
            Ok(Err(RequestError::HeaderTooLarge)) => {
                IngestResponse::error(431, "Request header fields too large")
            }
            Ok(Err(RequestError::TooLarge)) => IngestResponse::error(413, "Payload too large"),
            Ok(Err(RequestError::Io(e))) => return Err(e.into()),
            Err(e) => {
                debug!("{} - {}", peer, e);
                IngestResponse::error(408, "Request timeout")
            }
        };

        stream.write_all(&response.to_http_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

struct HttpRequest {
    method: String,
    target: String,
    body: Vec<u8>,
}

enum RequestError {
    Malformed,
    HeaderTooLarge,
    TooLarge,
    Io(std::io::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Read one CRLF-terminated head line, charging it against `budget`
///
/// Returns `None` at end of stream.
async fn read_head_line<R>(
    reader: &mut R,
    budget: &mut usize,
) -> std::result::Result<Option<String>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    if *budget == 0 {
        return Err(RequestError::HeaderTooLarge);
    }

    let limit = MAX_HEADER_LINE_BYTES.min(*budget);
    let mut line = String::new();
    let read = (&mut *reader).take(limit as u64).read_line(&mut line).await?;

    if read == 0 {
        return Ok(None);
    }
    if read == limit && !line.ends_with('\n') {
        return Err(RequestError::HeaderTooLarge);
    }

    *budget -= read;
    Ok(Some(line))
}

/// Read request line, headers and a `Content-Length` body
async fn read_request<S>(stream: S) -> std::result::Result<Option<HttpRequest>, RequestError>
where
    S: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut budget = MAX_HEADER_BYTES;

    let Some(request_line) = read_head_line(&mut reader, &mut budget).await? else {
        return Ok(None);
    };

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
        return Err(RequestError::Malformed);
    };
    let method = method.to_ascii_uppercase();
    let target = target.to_string();

    let mut content_length = 0usize;
    while let Some(line) = read_head_line(&mut reader, &mut budget).await? {
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| RequestError::Malformed)?;
            }
        }
    }

    if content_length > MAX_BODY_BYTES {
        return Err(RequestError::TooLarge);
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    Ok(Some(HttpRequest {
        method,
        target,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::FrameGenerator,
        types::{ChannelConfig, WheelConfig},
    };
    use tokio_test::assert_ok;

    fn ingest(unit: SpeedUnit) -> (Ingest, Arc<SharedSpeedState>) {
        let state = Arc::new(SharedSpeedState::new());
        (Ingest::new(Arc::clone(&state), unit), state)
    }

    #[test]
    fn test_post_records_speed() {
        let (ingest, state) = ingest(SpeedUnit::MillimetersPerSecond);

        let response = ingest.handle("POST", "/", br#"{"speed": 2780}"#);
        assert_eq!(response.status, 200);
        assert_eq!(response.body["message"], "JSON received successfully");
        assert_eq!(response.body["received_data"]["speed"], 2780);

        assert!((state.speed() - 2.78).abs() < 1e-9);
        assert!(state.last_update().is_some());
    }

    #[test]
    fn test_post_accepts_array() {
        let (ingest, state) = ingest(SpeedUnit::KilometersPerHour);

        let response = ingest.handle("POST", "/", br#"[{"speed": 36.0}, {"speed": 1.0}]"#);
        assert_eq!(response.status, 200);
        assert_eq!(response.body["received_data"]["speed"], 36.0);
        assert!((state.speed() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_json_leaves_state_alone() {
        let (ingest, state) = ingest(SpeedUnit::MillimetersPerSecond);
        state.set_speed(1.5);

        let response = ingest.handle("POST", "/", b"{speed: ");
        assert_eq!(response.status, 400);
        assert_eq!(response.body, json!({ "error": "Invalid JSON" }));
        assert!((state.speed() - 1.5).abs() < f64::EPSILON);
        assert!(state.last_update().is_none());
    }

    #[test]
    fn test_missing_speed_is_client_error() {
        let (ingest, state) = ingest(SpeedUnit::MillimetersPerSecond);

        for body in [&br#"{"pace": 5}"#[..], br#"{"speed": "fast"}"#, b"[]", b"42"] {
            let response = ingest.handle("POST", "/", body);
            assert_eq!(response.status, 400);
            assert_eq!(response.body["error"], "Missing speed field");
        }
        assert!(state.last_update().is_none());

        assert!(matches!(
            ingest.ingest(br#"{"pace": 5}"#),
            Err(BridgeError::MissingField("speed"))
        ));
    }

    #[test]
    fn test_negative_speed_is_clamped() {
        let (ingest, state) = ingest(SpeedUnit::MetersPerSecond);

        let response = ingest.handle("POST", "/", br#"{"speed": -4}"#);
        assert_eq!(response.status, 200);
        assert!(state.speed().abs() < f64::EPSILON);
    }

    #[test]
    fn test_diagnostic_routes() {
        let (ingest, state) = ingest(SpeedUnit::MillimetersPerSecond);

        let response = ingest.handle("GET", ANT_START_PATH, b"");
        assert_eq!(response.status, 200);
        assert_eq!(response.body["command"], "START");

        let response = ingest.handle("GET", "/diagnostic/antstop?now=1", b"");
        assert_eq!(response.status, 200);

        assert_eq!(state.pop_command(), Some(Command::Start));
        assert_eq!(state.pop_command(), Some(Command::Stop));
        assert_eq!(state.pop_command(), None);
    }

    #[test]
    fn test_other_routes() {
        let (ingest, state) = ingest(SpeedUnit::MillimetersPerSecond);

        let response = ingest.handle("GET", "/", b"");
        assert_eq!(response.status, 200);
        assert_eq!(response.body["status"], "success");

        let response = ingest.handle("DELETE", "/", b"");
        assert_eq!(response.status, 405);
        assert_eq!(state.pending_commands(), 0);
    }

    #[test]
    fn test_http_serialization() {
        let response = IngestResponse::error(400, "Invalid JSON");
        let bytes = response.to_http_bytes();
        let text = std::str::from_utf8(&bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 24\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"error\":\"Invalid JSON\"}"));
    }

    #[test]
    fn test_posted_speed_drives_rotation_counter() {
        let (ingest, state) = ingest(SpeedUnit::MetersPerSecond);
        let channel = ChannelConfig::default();
        let wheel = WheelConfig::default();
        let mut generator = FrameGenerator::new(channel.tick_seconds(), wheel);

        let response = ingest.handle("POST", "/", br#"{"speed": 2.78}"#);
        assert_eq!(response.status, 200);

        let frame = generator.next_frame(state.speed());
        let bytes = frame.to_array();
        let revolutions = u16::from_le_bytes([bytes[6], bytes[7]]);
        let event_time = u16::from_le_bytes([bytes[4], bytes[5]]);

        // first interval averages 0 and 2.78 m/s
        let tick = channel.tick_seconds();
        let expected = 0.5 * 2.78 / tick / wheel.circumference_m;
        let total = generator.snapshot().total_wheel_rotations;
        assert!((total - expected).abs() < 1e-9);
        assert!(total > 0.0 && total < 2.78 / tick / wheel.circumference_m);
        assert_eq!(revolutions, 2);
        assert_eq!(event_time, 4133);

        // receiver view: revolutions over event time gives back the average speed
        let shown = total * wheel.circumference_m / (f64::from(event_time) / 1024.0);
        assert!((shown - 1.39).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_header_limits() {
        let request = b"POST /?a=1 HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}";
        let parsed = read_request(&request[..]).await.ok().flatten().unwrap();
        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.target, "/?a=1");
        assert_eq!(parsed.body, b"{}");

        // one oversized header line
        let mut request = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        request.extend(std::iter::repeat(b'a').take(MAX_HEADER_LINE_BYTES));
        request.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(
            read_request(&request[..]).await,
            Err(RequestError::HeaderTooLarge)
        ));

        // many lines that are each fine but too large together
        let mut request = b"GET / HTTP/1.1\r\n".to_vec();
        let header = format!("X-Pad: {}\r\n", "a".repeat(4000));
        while request.len() <= MAX_HEADER_BYTES {
            request.extend_from_slice(header.as_bytes());
        }
        request.extend_from_slice(b"\r\n");
        assert!(matches!(
            read_request(&request[..]).await,
            Err(RequestError::HeaderTooLarge)
        ));

        let response = IngestResponse::error(431, "Request header fields too large");
        let bytes = response.to_http_bytes();
        assert!(bytes.starts_with(b"HTTP/1.1 431 Request Header Fields Too Large\r\n"));
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let state = Arc::new(SharedSpeedState::new());
        let ingest = Arc::new(Ingest::new(
            Arc::clone(&state),
            SpeedUnit::MillimetersPerSecond,
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(Arc::clone(&ingest).serve(listener));

        let body = r#"{"speed": 5000}"#;
        let request = format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_ok!(client.write_all(request.as_bytes()).await);
        let mut reply = String::new();
        assert_ok!(client.read_to_string(&mut reply).await);

        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert!(reply.contains("JSON received successfully"));
        assert!((state.speed() - 5.0).abs() < 1e-9);

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_ok!(
            client
                .write_all(b"GET /diagnostic/antstart HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
        );
        let mut reply = String::new();
        assert_ok!(client.read_to_string(&mut reply).await);
        assert!(reply.starts_with("HTTP/1.1 200 OK"));
        assert_eq!(state.pop_command(), Some(Command::Start));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        assert_ok!(client.write_all(request.as_bytes()).await);
        let mut reply = String::new();
        assert_ok!(client.read_to_string(&mut reply).await);
        assert!(reply.starts_with("HTTP/1.1 413"));

        server.abort();
    }
}
