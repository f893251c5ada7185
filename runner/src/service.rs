use crate::RunnerError;
use crate::auth::{BASIC_AUTH_REALM, CredentialGate};
use crate::dispatcher::{Dispatcher, Reply, parse_path};
use crate::metrics_defs::REQUESTS;
use http::header::WWW_AUTHENTICATE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use serde_json::json;
use shared::counter;
use shared::http::{full_body, make_error_response, make_json_response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub type RunnerResponse = Response<BoxBody<Bytes, RunnerError>>;

/// The single HTTP endpoint. Every request is routed first (which needs no
/// I/O), then authenticated, and only then handed to the dispatcher.
#[derive(Clone)]
pub struct RunnerService {
    gate: Arc<CredentialGate>,
    dispatcher: Arc<Dispatcher>,
}

impl RunnerService {
    pub fn new(gate: Arc<CredentialGate>, dispatcher: Arc<Dispatcher>) -> Self {
        RunnerService { gate, dispatcher }
    }

    pub async fn handle(&self, method: &Method, path: &str, headers: &HeaderMap) -> RunnerResponse {
        let (outcome, response) = self.respond(method, path, headers).await;
        counter!(REQUESTS, "outcome" => outcome).increment(1);
        tracing::info!(%method, path, status = response.status().as_u16(), outcome, "Handled request");
        response
    }

    async fn respond(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> (&'static str, RunnerResponse) {
        let request = match parse_path(path) {
            Ok(request) => request,
            Err(err) => {
                return (
                    "not_found",
                    make_json_response(StatusCode::NOT_FOUND, &json!({"error": err.to_string()})),
                );
            }
        };

        if method != Method::GET && method != Method::POST {
            return (
                "method_not_allowed",
                make_error_response(StatusCode::METHOD_NOT_ALLOWED),
            );
        }

        if !self.gate.authorize(headers).await {
            return ("unauthorized", unauthorized_response());
        }

        // Dispatch outlives the connection: a client hanging up must not stop a
        // run halfway and leave a partial collection in the working directory.
        let deck = request.deck.clone();
        let dispatcher = self.dispatcher.clone();
        let dispatched = tokio::spawn(async move { dispatcher.dispatch(&request).await }).await;

        match dispatched {
            Ok(Ok(Reply::Processed(result))) => {
                ("ok", make_json_response(StatusCode::OK, &result))
            }
            Ok(Ok(Reply::DeckNotFound(deck))) => (
                "deck_not_found",
                make_json_response(
                    StatusCode::NOT_FOUND,
                    &json!({"error": format!("Anki deck {deck} does not exist.")}),
                ),
            ),
            Ok(Err(err)) => {
                tracing::error!(error = %err, deck = %deck, "Request failed");
                ("error", internal_error_response())
            }
            Err(err) => {
                tracing::error!(error = %err, deck = %deck, "Dispatch task failed");
                ("error", internal_error_response())
            }
        }
    }
}

fn internal_error_response() -> RunnerResponse {
    make_json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &json!({"error": "Internal Server Error"}),
    )
}

fn unauthorized_response() -> RunnerResponse {
    let mut response = Response::new(full_body("Unauthorized Access"));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static(BASIC_AUTH_REALM));
    response
}

impl Service<Request<Incoming>> for RunnerService {
    type Response = RunnerResponse;
    type Error = RunnerError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();

        Box::pin(async move {
            // The endpoint takes no body, only the path and the credentials matter
            let (parts, _body) = req.into_parts();
            Ok(service
                .handle(&parts.method, parts.uri.path(), &parts.headers)
                .await)
        })
    }
}
