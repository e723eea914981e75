use std::convert::Infallible;
use std::sync::Arc;

use futures_util::stream::{self, Stream, StreamExt};
use futures_util::SinkExt;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use super::types::{ApiError, Applied, DevicesQuery, LogsQuery, RestartRequest};
use crate::error_handling::types::{BackendError, ServiceError, StorageError};
use crate::service::{AgentService, UserDelta};

/// HTTP status an operation failure is reported with.
pub fn error_status(err: &ServiceError) -> StatusCode {
    match err {
        ServiceError::BackendNotFound(_)
        | ServiceError::InboundNotFound(_)
        | ServiceError::Storage(StorageError::UserNotFound(_))
        | ServiceError::Storage(StorageError::InboundNotFound(_)) => StatusCode::NOT_FOUND,
        ServiceError::Backend(BackendError::RestartInProgress) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_reply(err: ServiceError) -> Response {
    let status = error_status(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("Request failed: {}", err);
    } else {
        debug!("Request rejected ({}): {}", status, err);
    }
    reply::with_status(
        reply::json(&ApiError {
            message: err.to_string(),
        }),
        status,
    )
    .into_response()
}

fn json_or_error<T: serde::Serialize>(result: Result<T, ServiceError>) -> Response {
    match result {
        Ok(value) => reply::json(&value).into_response(),
        Err(e) => error_reply(e),
    }
}

fn with_service(
    service: Arc<AgentService>,
) -> impl Filter<Extract = (Arc<AgentService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Query string decoded into `T`, or `T::default()` when absent or malformed.
fn optional_query<T>() -> impl Filter<Extract = (T,), Error = Infallible> + Clone
where
    T: DeserializeOwned + Default + Send + 'static,
{
    warp::query::<T>().or(warp::any().map(T::default)).unify()
}

/// POST /users/sync
pub fn sync_users_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("users" / "sync")
        .and(warp::post())
        .and(warp::body::json::<Vec<UserDelta>>())
        .and(with_service(service))
        .and_then(|deltas: Vec<UserDelta>, service: Arc<AgentService>| async move {
            let result = service
                .sync_users(stream::iter(deltas))
                .await
                .map(|applied| Applied { applied });
            Ok::<_, Rejection>(json_or_error(result))
        })
}

/// POST /users/repopulate
pub fn repopulate_users_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("users" / "repopulate")
        .and(warp::post())
        .and(warp::body::json::<Vec<UserDelta>>())
        .and(with_service(service))
        .and_then(|deltas: Vec<UserDelta>, service: Arc<AgentService>| async move {
            let applied = deltas.len();
            let result = service
                .repopulate_users(deltas)
                .await
                .map(|()| Applied { applied });
            Ok::<_, Rejection>(json_or_error(result))
        })
}

/// GET /users/stats
pub fn users_stats_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("users" / "stats")
        .and(warp::get())
        .and(with_service(service))
        .and_then(|service: Arc<AgentService>| async move {
            let stats = service.fetch_users_stats().await;
            Ok::<_, Rejection>(reply::json(&stats))
        })
}

/// GET /users/:uid/devices
pub fn user_devices_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("users" / u32 / "devices")
        .and(warp::get())
        .and(optional_query::<DevicesQuery>())
        .and(with_service(service))
        .map(|uid: u32, query: DevicesQuery, service: Arc<AgentService>| {
            reply::json(&service.fetch_user_devices(uid, query.active_only))
        })
}

/// GET /devices
pub fn all_devices_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("devices")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service))
        .map(|service: Arc<AgentService>| reply::json(&service.fetch_all_devices()))
}

/// GET /backends
pub fn backends_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("backends")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_service(service))
        .and_then(|service: Arc<AgentService>| async move {
            let backends = service.fetch_backends().await;
            Ok::<_, Rejection>(reply::json(&backends))
        })
}

/// GET /backends/:name/stats
pub fn backend_stats_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("backends" / String / "stats")
        .and(warp::get())
        .and(with_service(service))
        .and_then(|name: String, service: Arc<AgentService>| async move {
            Ok::<_, Rejection>(json_or_error(service.get_backend_stats(&name).await))
        })
}

/// GET /backends/:name/config
pub fn backend_config_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("backends" / String / "config")
        .and(warp::get())
        .and(with_service(service))
        .map(|name: String, service: Arc<AgentService>| {
            json_or_error(service.fetch_backend_config(&name))
        })
}

/// POST /backends/:name/restart
pub fn restart_backend_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let body = warp::body::json::<RestartRequest>()
        .or(warp::any().map(RestartRequest::default))
        .unify();
    warp::path!("backends" / String / "restart")
        .and(warp::post())
        .and(body)
        .and(with_service(service))
        .and_then(
            |name: String, request: RestartRequest, service: Arc<AgentService>| async move {
                let result = service
                    .restart_backend(&name, request.config)
                    .await
                    .map(|()| Applied { applied: 1 });
                Ok::<_, Rejection>(json_or_error(result))
            },
        )
}

/// GET /backends/:name/logs (WebSocket)
pub fn backend_logs_route(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("backends" / String / "logs")
        .and(warp::get())
        .and(optional_query::<LogsQuery>())
        .and(warp::ws())
        .and(with_service(service))
        .map(
            |name: String, query: LogsQuery, ws: Ws, service: Arc<AgentService>| {
                match service.stream_backend_logs(&name, query.include_buffer) {
                    Ok(lines) => ws
                        .on_upgrade(move |socket| forward_logs(socket, lines))
                        .into_response(),
                    Err(e) => error_reply(e),
                }
            },
        )
}

/// Sends one text frame per line until the lines end or the peer goes away.
async fn forward_logs<S>(socket: WebSocket, lines: S)
where
    S: Stream<Item = String> + Send + 'static,
{
    let (mut sink, mut incoming) = socket.split();
    let mut lines = Box::pin(lines);
    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(line) => {
                    if sink.send(Message::text(line)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            message = incoming.next() => match message {
                Some(Ok(message)) if message.is_close() => break,
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
    let _ = sink.close().await;
    debug!("Log stream closed");
}

/// Every route of the RPC surface.
pub fn routes(
    service: Arc<AgentService>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    sync_users_route(service.clone())
        .or(repopulate_users_route(service.clone()))
        .or(users_stats_route(service.clone()))
        .or(user_devices_route(service.clone()))
        .or(all_devices_route(service.clone()))
        .or(backends_route(service.clone()))
        .or(backend_stats_route(service.clone()))
        .or(backend_config_route(service.clone()))
        .or(restart_backend_route(service.clone()))
        .or(backend_logs_route(service))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_handling::types::ControlApiError;

    #[test]
    fn test_not_found_errors_map_to_404() {
        assert_eq!(
            error_status(&ServiceError::BackendNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&ServiceError::InboundNotFound("tag".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&StorageError::UserNotFound(3).into()),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_restart_in_progress_maps_to_409() {
        assert_eq!(
            error_status(&BackendError::RestartInProgress.into()),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_other_failures_map_to_500() {
        let err: ServiceError =
            BackendError::from(ControlApiError::IdentityExists("1.a".into())).into();
        assert_eq!(error_status(&err), StatusCode::INTERNAL_SERVER_ERROR);
        let err: ServiceError = BackendError::UnsupportedProtocol("http".into()).into();
        assert_eq!(error_status(&err), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
