use actix_web::error;
use actix_web::http::{Method, StatusCode};
use actix_web::web::{self, Bytes};
use actix_web::{HttpRequest, HttpResponse, Result};
use serde_json::Value;

use crate::json_api::{split_api_path, JsonApiMethod, JsonApiResult, JsonApiStatus, JsonObject};
use crate::server::{ServerCommand, ServerTx};

pub fn configure_admin_handlers(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/api/{path:.*}")
            .name("admin_api")
            .route(web::route().to(call_api)),
    );
}

fn api_method(method: &Method) -> Option<JsonApiMethod> {
    match *method {
        Method::GET => Some(JsonApiMethod::Get),
        Method::POST => Some(JsonApiMethod::Create),
        Method::PUT | Method::PATCH => Some(JsonApiMethod::Update),
        Method::DELETE => Some(JsonApiMethod::Delete),
        _ => None,
    }
}

fn status_code(status: JsonApiStatus) -> StatusCode {
    match status {
        JsonApiStatus::Ok => StatusCode::OK,
        JsonApiStatus::BadRequest => StatusCode::BAD_REQUEST,
        JsonApiStatus::NotFound => StatusCode::NOT_FOUND,
        JsonApiStatus::BadMethod => StatusCode::METHOD_NOT_ALLOWED,
    }
}

fn respond(result: JsonApiResult) -> HttpResponse {
    HttpResponse::build(status_code(result.status)).json(result.body)
}

fn parse_body(body: &[u8]) -> std::result::Result<JsonObject, JsonApiResult> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(JsonObject::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(request)) => Ok(request),
        Ok(_) => Err(JsonApiResult::bad_request("request body must be an object")),
        Err(err) => Err(JsonApiResult::bad_request(&err.to_string())),
    }
}

pub async fn call_api(
    req: HttpRequest,
    body: Bytes,
    srv_tx: web::Data<ServerTx>,
) -> Result<HttpResponse> {
    let method = match api_method(req.method()) {
        Some(method) => method,
        None => return Ok(respond(JsonApiResult::bad_method())),
    };
    let request = match parse_body(&body) {
        Ok(request) => request,
        Err(result) => return Ok(respond(result)),
    };
    let path = split_api_path(req.match_info().get("path").unwrap_or_default());
    log::debug!("Admin API {:?} {:?}", method, path);

    let (tx, rx) = tokio::sync::oneshot::channel::<JsonApiResult>();

    srv_tx
        .get_ref()
        .clone()
        .send(ServerCommand::Admin {
            method,
            path,
            request,
            tx,
        })
        .await
        .map_err(|_| error::ErrorInternalServerError("Internal Server Error"))?;

    let result = rx
        .await
        .map_err(|_| error::ErrorInternalServerError("Receiver await error"))?;

    Ok(respond(result))
}
