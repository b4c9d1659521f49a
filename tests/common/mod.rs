//! Scripted mock Miniserver for end-to-end tests.
//!
//! The HTTP side (reachability probe) is served by wiremock; the WebSocket
//! side is a real listener speaking the binary framing protocol: every
//! response is announced by an 8-byte header frame, followed by the payload
//! in its own message. Received commands are logged for assertions, and
//! tests can push unsolicited frames at any time.

use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use loxone_client::{MiniserverAddress, Uuid};

pub const MAGIC: u8 = 0x03;

pub const DEFAULT_STRUCTURE: &str = r#"{
    "lastModified": "2023-11-04 17:31:00",
    "rooms": {"0f86a2fe-0378-3632-ffff403fb0c34b9e": {"name": "Kitchen"}},
    "cats": {"0f86a2fe-0378-3633-ffff403fb0c34b9e": {"name": "Lighting"}},
    "controls": {
        "0f86a2fe-0378-3634-ffff403fb0c34b9e": {
            "name": "Ceiling Light",
            "type": "Switch",
            "room": "0f86a2fe-0378-3632-ffff403fb0c34b9e",
            "cat": "0f86a2fe-0378-3633-ffff403fb0c34b9e",
            "states": {"active": "0f86a2fe-0378-3635-ffff403fb0c34b9e"}
        }
    }
}"#;

/// 8-byte frame header announcing a payload.
pub fn header(identifier: u8, flags: u8, length: u32) -> Vec<u8> {
    let mut bytes = vec![MAGIC, identifier, flags, 0];
    bytes.extend_from_slice(&length.to_le_bytes());
    bytes
}

/// JSON response envelope with the given status code.
pub fn envelope_with_code(control: &str, value: serde_json::Value, code: &str) -> String {
    json!({"LL": {"control": control, "value": value, "Code": code}}).to_string()
}

pub fn envelope(control: &str, value: serde_json::Value) -> String {
    envelope_with_code(control, value, "200")
}

/// Header frame plus text payload, the way the Miniserver answers commands.
pub fn framed_text(identifier: u8, payload: &str) -> Vec<Message> {
    vec![
        Message::Binary(header(identifier, 0, payload.len() as u32)),
        Message::Text(payload.to_string()),
    ]
}

fn command_response(control: &str, value: serde_json::Value) -> Vec<Message> {
    framed_text(0, &envelope(control, value))
}

#[derive(Default, Clone)]
pub struct MockOptions {
    /// Firmware version reported by the probe
    pub version: String,
    /// Structure file served for `data/LoxAPP3.json`
    pub structure: Option<String>,
    /// Answer every authentication step with status 401
    pub reject_auth: bool,
}

impl MockOptions {
    pub fn version(version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..Self::default()
        }
    }
}

pub struct MockMiniserver {
    _http: MockServer,
    pub address: MiniserverAddress,
    commands: Arc<Mutex<Vec<String>>>,
    frames: mpsc::UnboundedSender<Vec<Message>>,
}

impl MockMiniserver {
    pub async fn start(version: &str) -> Self {
        Self::start_with(MockOptions::version(version)).await
    }

    pub async fn start_with(options: MockOptions) -> Self {
        let http = MockServer::start().await;
        let api_value = format!(
            "{{'snr': '50:4F:94:AA:BB:CC', 'version':'{}'}}",
            options.version
        );
        Mock::given(method("GET"))
            .and(path("/jdev/cfg/api"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(envelope("dev/cfg/api", json!(api_value))),
            )
            .mount(&http)
            .await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_port = listener.local_addr().unwrap().port();
        let http_port = http.address().port();

        let commands = Arc::new(Mutex::new(Vec::new()));
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve(listener, commands.clone(), frame_rx, options.clone()));

        Self {
            _http: http,
            address: MiniserverAddress::with_ports("127.0.0.1", http_port, ws_port),
            commands,
            frames: frame_tx,
        }
    }

    /// Push raw frames to the connected client.
    pub fn push_frames(&self, frames: Vec<Message>) {
        let _ = self.frames.send(frames);
    }

    /// Push one value-state batch with a single record.
    pub fn push_value_state(&self, uuid: Uuid, value: f64) {
        let mut payload = uuid.as_bytes().to_vec();
        payload.extend_from_slice(&value.to_le_bytes());
        self.push_frames(vec![
            Message::Binary(header(2, 0, 24)),
            Message::Binary(payload),
        ]);
    }

    /// Same record, but announced through the two-stage length encoding.
    pub fn push_value_state_estimated(&self, uuid: Uuid, value: f64) {
        let mut payload = uuid.as_bytes().to_vec();
        payload.extend_from_slice(&value.to_le_bytes());
        self.push_frames(vec![
            Message::Binary(header(2, 0x01, 4096)),
            Message::Binary(header(2, 0, 24)),
            Message::Binary(payload),
        ]);
    }

    /// Every command received over the WebSocket so far.
    pub fn command_log(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

async fn serve(
    listener: TcpListener,
    commands: Arc<Mutex<Vec<String>>>,
    mut frame_rx: mpsc::UnboundedReceiver<Vec<Message>>,
    options: MockOptions,
) {
    let Ok((stream, _)) = listener.accept().await else {
        return;
    };
    let accept_subprotocol = |_request: &Request, mut response: Response| {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", "remotecontrol".parse().unwrap());
        Ok::<_, ErrorResponse>(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, accept_subprotocol).await else {
        return;
    };

    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            frames = frame_rx.recv() => match frames {
                Some(frames) => {
                    for frame in frames {
                        if sink.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                None => return,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(command))) => {
                    commands.lock().unwrap().push(command.clone());
                    for frame in respond(&command, &options) {
                        if sink.send(frame).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

fn respond(command: &str, options: &MockOptions) -> Vec<Message> {
    if command == "keepalive" {
        return vec![Message::Binary(header(6, 0, 0))];
    }
    if command == "data/LoxAPP3.json" {
        let body = options.structure.clone().unwrap_or_else(|| DEFAULT_STRUCTURE.to_string());
        return framed_text(1, &body);
    }
    if command.contains("noreply") {
        return Vec::new();
    }
    if options.reject_auth
        && (command.starts_with("jdev/sys/getkey") || command.starts_with("authenticate/"))
    {
        return framed_text(0, &envelope_with_code(command, json!(""), "401"));
    }
    if command.starts_with("jdev/sys/getkey2/") {
        return command_response(
            command,
            json!({"key": "41424344", "salt": "6162", "hashAlg": "SHA256"}),
        );
    }
    if command.starts_with("jdev/sys/getjwt/") {
        return command_response(
            command,
            json!({
                "token": "eyJhbGciOiJIUzI1NiJ9.mock.token",
                "key": "4142",
                "salt": "61",
                "validUntil": 1234567890_i64,
                "tokenRights": 1666,
                "unsecurePass": false
            }),
        );
    }
    if command == "jdev/sys/getkey" {
        return command_response(command, json!("41424344"));
    }
    if command.starts_with("authenticate/") {
        return command_response(command, json!("1"));
    }
    if command == "jdev/sps/LoxAPPversion3" {
        return command_response(command, json!("2023-11-04 17:31:00"));
    }
    command_response(command, json!("1"))
}
