use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    serve, Router,
};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::constants::MISSING_KEY_NOTICE;
use crate::llm_interaction::CompletionClient;
use crate::profile::{FitnessLevel, Goal, Injury, Preference};
use crate::session::{parse_client_event, Session, SessionEvent};

const WELCOME_TOPICS: [&str; 5] = [
    "Creating personalized workout plans",
    "Setting and tracking fitness goals",
    "Modifying exercises based on injuries",
    "Tracking your progress",
    "Providing form guidance and exercise explanations",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    pub static_dir: String,
}

// Shared application state
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    // None when no API key is configured; the UI then stays disabled.
    client: Option<Arc<dyn CompletionClient>>,
}

impl AppState {
    pub fn new(templates: AutoReloader, client: Option<Arc<dyn CompletionClient>>) -> Self {
        Self {
            templates: Arc::new(templates),
            client,
        }
    }
}

// Minijinja Environment setup
pub fn create_minijinja_env(templates_dir: impl Into<String>) -> AutoReloader {
    let templates_dir = templates_dir.into();
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(&templates_dir));
        // Watch the templates directory for changes
        notifier.watch_path(&templates_dir, true);
        Ok(env)
    })
}

fn labels<T: Copy>(options: &[T], label: fn(T) -> &'static str) -> Vec<&'static str> {
    options.iter().copied().map(label).collect()
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, (StatusCode, Html<String>)> {
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                tmpl.render(minijinja::context! {
                    title => "Fitness Coach Bot",
                    ready => state.client.is_some(),
                    notice => MISSING_KEY_NOTICE,
                    welcome_topics => WELCOME_TOPICS,
                    levels => labels(FitnessLevel::ALL, FitnessLevel::label),
                    goals => labels(Goal::ALL, Goal::label),
                    injuries => labels(Injury::ALL, Injury::label),
                    preferences => labels(Preference::ALL, Preference::label),
                })
            })
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html(format!("Internal Server Error: {}", e)),
            )
        })
}

async fn health_handler() -> &'static str {
    "ok"
}

// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn send_event(socket: &mut WebSocket, event: &SessionEvent) -> Result<()> {
    let json = serde_json::to_string(event).context("Failed to serialize session event")?;
    socket
        .send(Message::Text(json))
        .await
        .context("WebSocket send failed")
}

/// Pushes a turn's events to the socket. Returns false once the client is gone,
/// which drops the receiver and makes the turn abandon its stream.
async fn forward_events(socket: &mut WebSocket, mut rx: mpsc::UnboundedReceiver<SessionEvent>) -> bool {
    while let Some(event) = rx.recv().await {
        if let Err(e) = send_event(socket, &event).await {
            warn!("WebSocket client disconnected mid-turn: {:?}", e);
            return false;
        }
    }
    true
}

// One connection is one session: state is created here and dropped on disconnect.
async fn handle_socket(mut socket: WebSocket, state: AppState) {
    info!("New WebSocket session established");

    let Some(client) = state.client.clone() else {
        let notice = SessionEvent::Notice {
            message: MISSING_KEY_NOTICE.to_string(),
        };
        if send_event(&mut socket, &notice).await.is_err() {
            warn!("Failed to send notice to WebSocket client");
        }
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let mut session = Session::new();
    let snapshot = SessionEvent::Profile {
        profile: session.profile().clone(),
    };
    if send_event(&mut socket, &snapshot).await.is_err() {
        warn!("Failed to send initial profile to new WebSocket client");
        return;
    }

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => {
                let event = match parse_client_event(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Rejected client frame: {}", e);
                        let reply = SessionEvent::Error {
                            error: e.to_string(),
                        };
                        if send_event(&mut socket, &reply).await.is_err() {
                            break;
                        }
                        continue;
                    }
                };

                let (tx, rx) = mpsc::unbounded_channel();
                let session_ref = &mut session;
                let client_ref = client.as_ref();
                let turn = async move {
                    session_ref.handle(event, client_ref, &tx).await;
                    // tx drops here, ending the forwarder
                };
                let (_, connected) = tokio::join!(turn, forward_events(&mut socket, rx));
                if !connected {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                warn!("Received unexpected binary message from client");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                // Axum answers pings itself
            }
            Ok(Message::Close(_)) => {
                info!("Client requested WebSocket close");
                break;
            }
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        }
    }

    info!(turns = session.log().turns(), "WebSocket session closed");
}

pub fn router(state: AppState, static_dir: &str) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .nest_service("/static", ServeDir::new(static_dir))
        .with_state(state)
        .layer(TraceLayer::new_for_http()) // Add request logging
}

pub async fn start_web_server(config: ServerConfig, state: AppState) -> Result<()> {
    let app = router(state, &config.static_dir);

    let addr = SocketAddr::new(config.host, config.port);
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}
