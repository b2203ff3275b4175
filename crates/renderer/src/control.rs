//! HTTP control surface.
//!
//! Stands in for the control-point transport protocol: each route maps
//! onto one facade callback. Mutating commands are forwarded over a
//! channel to a dispatch thread so HTTP workers never block on decoder
//! or sink I/O; status and settings reads answer inline.

use std::net::SocketAddr;
use std::sync::Arc;

use actix_web::{http::StatusCode, middleware::Logger, web, App, HttpResponse, HttpServer};
use crossbeam_channel::{Receiver, Sender};

use crate::facade::RendererFacade;

#[derive(Debug)]
pub enum ControlCommand {
    SetUri { uri: String, metadata: String },
    SetNextUri { uri: String, metadata: String },
    Play,
    Pause,
    Stop,
    Seek { target: String },
}

/// Run facade callbacks for inbound commands until the channel closes.
pub fn spawn_control_loop(
    facade: Arc<RendererFacade>,
    rx: Receiver<ControlCommand>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while let Ok(cmd) = rx.recv() {
            match cmd {
                ControlCommand::SetUri { uri, metadata } => {
                    facade.on_set_current_uri(&uri, &metadata)
                }
                ControlCommand::SetNextUri { uri, metadata } => {
                    facade.on_set_next_uri(&uri, &metadata)
                }
                ControlCommand::Play => {
                    if !facade.on_play() {
                        tracing::warn!("play command failed");
                    }
                }
                ControlCommand::Pause => facade.on_pause(),
                ControlCommand::Stop => facade.on_stop(),
                ControlCommand::Seek { target } => {
                    if !facade.on_seek(&target) {
                        tracing::warn!(target = %target, "seek command failed");
                    }
                }
            }
        }
        tracing::debug!("control loop finished");
    })
}

#[derive(serde::Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(serde::Deserialize)]
struct UriRequest {
    uri: String,
    #[serde(default)]
    metadata: String,
}

#[derive(serde::Deserialize)]
struct SeekRequest {
    target: String,
}

#[derive(serde::Deserialize)]
struct VolumeRequest {
    volume: u8,
}

#[derive(serde::Deserialize)]
struct MuteRequest {
    mute: bool,
}

#[derive(Clone)]
struct AppState {
    facade: Arc<RendererFacade>,
    commands: Sender<ControlCommand>,
}

/// Spawn the HTTP API server on the given bind address.
pub fn spawn_http_server(
    bind: SocketAddr,
    facade: Arc<RendererFacade>,
    commands: Sender<ControlCommand>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let state = AppState { facade, commands };
        let runner = match HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(
                    Logger::new("http request method=%m path=%U status=%s")
                        .exclude("/status")
                        .exclude("/health"),
                )
                .route("/health", web::get().to(health))
                .route("/status", web::get().to(status))
                .route("/uri", web::post().to(set_uri))
                .route("/next-uri", web::post().to(set_next_uri))
                .route("/play", web::post().to(play))
                .route("/pause", web::post().to(pause))
                .route("/stop", web::post().to(stop))
                .route("/seek", web::post().to(seek))
                .route("/volume", web::get().to(get_volume))
                .route("/volume", web::post().to(set_volume))
                .route("/mute", web::get().to(get_mute))
                .route("/mute", web::post().to(set_mute))
        })
        .bind(bind)
        {
            Ok(server) => server.run(),
            Err(e) => {
                tracing::error!(error = %e, "http server bind failed");
                return;
            }
        };

        tracing::info!(bind = %bind, "control api listening");
        let _ = actix_web::rt::System::new().block_on(runner);
    })
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.facade.status())
}

async fn set_uri(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let req: UriRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if req.uri.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "uri is required");
    }
    send_command(
        &state,
        ControlCommand::SetUri {
            uri: req.uri,
            metadata: req.metadata,
        },
    )
}

async fn set_next_uri(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let req: UriRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    if req.uri.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "uri is required");
    }
    send_command(
        &state,
        ControlCommand::SetNextUri {
            uri: req.uri,
            metadata: req.metadata,
        },
    )
}

async fn play(state: web::Data<AppState>) -> HttpResponse {
    send_command(&state, ControlCommand::Play)
}

async fn pause(state: web::Data<AppState>) -> HttpResponse {
    send_command(&state, ControlCommand::Pause)
}

async fn stop(state: web::Data<AppState>) -> HttpResponse {
    send_command(&state, ControlCommand::Stop)
}

async fn seek(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let req: SeekRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    send_command(&state, ControlCommand::Seek { target: req.target })
}

async fn get_volume(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "volume": state.facade.on_get_volume() }))
}

async fn set_volume(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let req: VolumeRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    state.facade.on_set_volume(req.volume);
    HttpResponse::NoContent().finish()
}

async fn get_mute(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "mute": state.facade.on_get_mute() }))
}

async fn set_mute(state: web::Data<AppState>, body: web::Bytes) -> HttpResponse {
    let req: MuteRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    state.facade.on_set_mute(req.mute);
    HttpResponse::NoContent().finish()
}

fn send_command(state: &web::Data<AppState>, cmd: ControlCommand) -> HttpResponse {
    if state.commands.send(cmd).is_err() {
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "renderer offline")
    } else {
        HttpResponse::NoContent().finish()
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &web::Bytes) -> Result<T, HttpResponse> {
    serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, &format!("invalid json: {e}")))
}

fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(serde_json::json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body;

    #[actix_web::test]
    async fn error_response_encodes_message() {
        let resp = error_response(StatusCode::NOT_FOUND, "missing");
        let bytes = body::to_bytes(resp.into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["error"], "missing");
    }

    #[test]
    fn uri_request_defaults_metadata() {
        let req: UriRequest = serde_json::from_str(r#"{"uri":"http://host/a.flac"}"#).unwrap();
        assert_eq!(req.uri, "http://host/a.flac");
        assert_eq!(req.metadata, "");
    }

    #[test]
    fn seek_request_parses_target() {
        let req: SeekRequest = serde_json::from_str(r#"{"target":"00:01:00"}"#).unwrap();
        assert_eq!(req.target, "00:01:00");
    }

    #[test]
    fn volume_request_parses() {
        let req: VolumeRequest = serde_json::from_str(r#"{"volume":55}"#).unwrap();
        assert_eq!(req.volume, 55);
    }
}
