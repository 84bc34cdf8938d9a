use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        FromRequest, FromRequestParts, Query, State,
        rejection::{JsonRejection, PathRejection},
    },
    http::{StatusCode, header, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::auth::{Actor, Authorizer, Module, Permission};
use super::db::DbHandle;
use super::models::*;
use super::ws::{WsMessage, broadcast_message};
use crate::errors::BoardError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: broadcast::Sender<String>,
    pub auth: Authorizer,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SaveBoardsRequest {
    pub boards: Vec<String>,
}

#[derive(Deserialize)]
pub struct CreateBoardRequest {
    pub name: String,
    pub color: Option<BoardColor>,
}

#[derive(Deserialize)]
pub struct RenameBoardRequest {
    pub old_name: String,
    pub new_name: String,
}

#[derive(Deserialize)]
pub struct ReorderBoardsRequest {
    pub boards: Vec<String>,
}

#[derive(Deserialize)]
pub struct SetBoardColorRequest {
    pub board_name: String,
    pub color: BoardColor,
}

#[derive(Deserialize)]
pub struct MoveTicketRequest {
    pub board_name: String,
}

#[derive(Deserialize)]
pub struct UpdateFieldsRequest {
    pub fields: BTreeMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Serialize)]
pub struct DeleteBoardResponse {
    pub deleted_tickets: usize,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    InvalidOperation(String),
    BadRequest(String),
    Internal(String),
}

impl From<&BoardError> for ApiError {
    fn from(err: &BoardError) -> Self {
        let msg = err.to_string();
        match err {
            BoardError::Unauthorized => ApiError::Unauthorized(msg),
            BoardError::Forbidden(_) => ApiError::Forbidden(msg),
            BoardError::NotFound(_) => ApiError::NotFound(msg),
            BoardError::Conflict(_) => ApiError::Conflict(msg),
            BoardError::InvalidOperation(_) => ApiError::InvalidOperation(msg),
            BoardError::Validation(_) => ApiError::BadRequest(msg),
            BoardError::LockPoisoned => ApiError::Internal(msg),
        }
    }
}

impl From<BoardError> for ApiError {
    fn from(err: BoardError) -> Self {
        ApiError::from(&err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match BoardError::find(&err) {
            Some(board_err) => ApiError::from(board_err),
            None => {
                tracing::error!(error = ?err, "request failed");
                ApiError::Internal(format!("{:#}", err))
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::InvalidOperation(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Extractors ────────────────────────────────────────────────────────

/// JSON body whose rejections render as `{"error": ...}`.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Path parameters whose rejections render as `{"error": ...}`.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Path), rejection(ApiError))]
pub struct ApiPath<T>(pub T);

impl FromRequestParts<SharedState> for Actor {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        Ok(state.auth.authenticate(header)?)
    }
}

impl AppState {
    fn require(&self, actor: &Actor, module: Module, permission: Permission) -> Result<(), ApiError> {
        Ok(self.auth.authorize(actor, module, permission)?)
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/projects/{project_type}", get(get_board_view).post(save_boards))
        .route(
            "/api/projects/{project_type}/boards",
            get(list_boards).post(create_board),
        )
        .route("/api/projects/{project_type}/boards/{name}", delete(delete_board))
        .route("/api/projects/{project_type}/rename-board", put(rename_board))
        .route("/api/projects/{project_type}/reorder-boards", put(reorder_boards))
        .route("/api/projects/{project_type}/create", post(create_ticket))
        .route("/api/projects/{project_type}/tickets", get(list_tickets))
        .route("/api/projects/{project_type}/search", get(search_tickets))
        .route(
            "/api/tickets/{id}",
            get(get_ticket).put(update_ticket).delete(delete_ticket),
        )
        .route("/api/tickets/{id}/move", patch(move_ticket))
        .route("/api/tickets/{id}/fields", patch(update_fields))
        .route("/api/tickets/{id}/activity", get(ticket_activity))
        .route("/api/tickets/{id}/comments", post(add_comment))
        .route(
            "/api/tickets/{id}/comments/{comment_id}",
            put(edit_comment).delete(remove_comment),
        )
        .route("/api/tickets/{id}/attachments", post(add_attachment))
        .route(
            "/api/tickets/{id}/attachments/{attachment_id}",
            delete(remove_attachment),
        )
        .route("/api/tickets/{id}/pending-items", post(add_pending_item))
        .route(
            "/api/tickets/{id}/pending-items/{item_id}",
            patch(toggle_pending_item).delete(remove_pending_item),
        )
        .route(
            "/api/board-colors/{project_type}",
            get(list_board_colors).post(set_board_color),
        )
        .route(
            "/api/field-configs/{project_type}",
            get(list_field_configs).post(create_field_config),
        )
        .route(
            "/api/field-configs/{project_type}/{id}",
            get(get_field_config)
                .put(update_field_config)
                .delete(delete_field_config),
        )
}

// ── Boards ────────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_board_view(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Read)?;
    let view = state.db.call(move |db| db.board_view(&project_type)).await?;
    Ok(Json(view))
}

async fn save_boards(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
    ApiJson(req): ApiJson<SaveBoardsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Write)?;
    let pt = project_type.clone();
    let boards = state.db.call(move |db| db.save_boards(&pt, &req.boards)).await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::BoardsReordered {
            project_type,
            boards: boards.clone(),
        },
    );
    Ok(Json(boards))
}

async fn list_boards(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Read)?;
    let boards = state.db.call(move |db| db.list_boards(&project_type)).await?;
    Ok(Json(boards))
}

async fn create_board(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
    ApiJson(req): ApiJson<CreateBoardRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Write)?;
    let board = state
        .db
        .call(move |db| db.create_board(&project_type, &req.name, req.color))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::BoardCreated { board: board.clone() });
    Ok((StatusCode::CREATED, Json(board)))
}

async fn delete_board(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((project_type, name)): ApiPath<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Delete)?;
    let (pt, board) = (project_type.clone(), name.clone());
    let deleted_tickets = state.db.call(move |db| db.delete_board(&pt, &board)).await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::BoardDeleted {
            project_type,
            name,
            deleted_tickets,
        },
    );
    Ok(Json(DeleteBoardResponse { deleted_tickets }))
}

async fn rename_board(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
    ApiJson(req): ApiJson<RenameBoardRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Write)?;
    let pt = project_type.clone();
    let old_name = req.old_name.clone();
    let board = state
        .db
        .call(move |db| db.rename_board(&pt, &req.old_name, &req.new_name))
        .await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::BoardRenamed {
            project_type,
            old_name,
            board: board.clone(),
        },
    );
    Ok(Json(board))
}

async fn reorder_boards(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
    ApiJson(req): ApiJson<ReorderBoardsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Write)?;
    let pt = project_type.clone();
    let boards = state.db.call(move |db| db.reorder_boards(&pt, &req.boards)).await?;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::BoardsReordered {
            project_type,
            boards: boards.clone(),
        },
    );
    Ok(Json(boards))
}

async fn list_board_colors(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Read)?;
    let colors = state.db.call(move |db| db.list_board_colors(&project_type)).await?;
    Ok(Json(colors))
}

async fn set_board_color(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
    ApiJson(req): ApiJson<SetBoardColorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Boards, Permission::Write)?;
    let mapping = state
        .db
        .call(move |db| db.set_board_color(&project_type, &req.board_name, req.color))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::BoardColorChanged { mapping: mapping.clone() });
    Ok(Json(mapping))
}

// ── Tickets ───────────────────────────────────────────────────────────

async fn create_ticket(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
    ApiJson(req): ApiJson<NewTicket>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    let ticket = state
        .db
        .call(move |db| db.create_ticket(&project_type, req, &actor.name))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::TicketCreated { ticket: ticket.clone() });
    Ok((StatusCode::CREATED, Json(ticket)))
}

async fn list_tickets(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Read)?;
    let tickets = state.db.call(move |db| db.list_tickets(&project_type)).await?;
    Ok(Json(tickets))
}

async fn search_tickets(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
    Query(query): Query<SearchQuery>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Read)?;
    let tickets = state
        .db
        .call(move |db| db.search_tickets(&project_type, &query.q))
        .await?;
    Ok(Json(tickets))
}

async fn get_ticket(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Read)?;
    let ticket = state.db.call(move |db| db.get_ticket(id)).await?;
    match ticket {
        Some(ticket) => Ok(Json(ticket)),
        None => Err(ApiError::NotFound(format!("Ticket {} not found", id))),
    }
}

async fn update_ticket(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<TicketUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    let ticket = state.db.call(move |db| db.update_ticket(id, req)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::TicketUpdated { ticket: ticket.clone() });
    Ok(Json(ticket))
}

async fn delete_ticket(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Delete)?;
    state.db.call(move |db| db.delete_ticket(id)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::TicketDeleted { ticket_id: id });
    Ok(StatusCode::NO_CONTENT)
}

async fn move_ticket(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<MoveTicketRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    let (from_board, ticket) = state
        .db
        .call(move |db| {
            let from_board = db
                .get_ticket(id)?
                .map(|t| t.board_name)
                .unwrap_or_default();
            let ticket = db.move_ticket(id, &req.board_name, &actor.name)?;
            Ok((from_board, ticket))
        })
        .await?;
    if from_board != ticket.board_name {
        broadcast_message(
            &state.ws_tx,
            &WsMessage::TicketMoved {
                ticket_id: id,
                from_board,
                to_board: ticket.board_name.clone(),
            },
        );
    }
    Ok(Json(ticket))
}

async fn update_fields(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<UpdateFieldsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    let ticket = state
        .db
        .call(move |db| db.update_fields(id, &req.fields, &actor.name))
        .await?;
    broadcast_message(&state.ws_tx, &WsMessage::TicketUpdated { ticket: ticket.clone() });
    Ok(Json(ticket))
}

async fn ticket_activity(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Read)?;
    let entries = state.db.call(move |db| db.ticket_activity(id)).await?;
    Ok(Json(entries))
}

// ── Ticket sub-items ──────────────────────────────────────────────────

/// Run a ticket mutation and broadcast the updated ticket.
async fn mutate<F>(state: &SharedState, f: F) -> Result<Json<Ticket>, ApiError>
where
    F: FnOnce(&super::db::BoardDb) -> anyhow::Result<Ticket> + Send + 'static,
{
    let ticket = state.db.call(f).await?;
    broadcast_message(&state.ws_tx, &WsMessage::TicketUpdated { ticket: ticket.clone() });
    Ok(Json(ticket))
}

async fn add_comment(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<TextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    let ticket = mutate(&state, move |db| db.add_comment(id, &actor.name, &req.text)).await?;
    Ok((StatusCode::CREATED, ticket))
}

async fn edit_comment(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((id, comment_id)): ApiPath<(Uuid, Uuid)>,
    ApiJson(req): ApiJson<TextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    mutate(&state, move |db| db.edit_comment(id, comment_id, &actor.name, &req.text)).await
}

async fn remove_comment(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((id, comment_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    let moderator = state.auth.can(actor.role, Module::Tickets, Permission::Delete);
    mutate(&state, move |db| db.remove_comment(id, comment_id, &actor.name, moderator)).await
}

async fn add_attachment(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<NewAttachment>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    let ticket = mutate(&state, move |db| db.add_attachment(id, &actor.name, req)).await?;
    Ok((StatusCode::CREATED, ticket))
}

async fn remove_attachment(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((id, attachment_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    mutate(&state, move |db| db.remove_attachment(id, attachment_id, &actor.name)).await
}

async fn add_pending_item(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(req): ApiJson<TextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    let ticket = mutate(&state, move |db| db.add_pending_item(id, &actor.name, &req.text)).await?;
    Ok((StatusCode::CREATED, ticket))
}

async fn toggle_pending_item(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((id, item_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    mutate(&state, move |db| db.toggle_pending_item(id, item_id, &actor.name)).await
}

async fn remove_pending_item(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((id, item_id)): ApiPath<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Tickets, Permission::Write)?;
    mutate(&state, move |db| db.remove_pending_item(id, item_id, &actor.name)).await
}

// ── Field configuration ───────────────────────────────────────────────

async fn list_field_configs(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Fields, Permission::Read)?;
    let fields = state.db.call(move |db| db.list_fields(&project_type)).await?;
    Ok(Json(fields))
}

async fn create_field_config(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath(project_type): ApiPath<String>,
    ApiJson(req): ApiJson<NewFieldConfig>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Fields, Permission::Write)?;
    let pt = project_type.clone();
    let field = state.db.call(move |db| db.create_field(&pt, req)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::FieldConfigChanged { project_type });
    Ok((StatusCode::CREATED, Json(field)))
}

async fn get_field_config(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((project_type, id)): ApiPath<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Fields, Permission::Read)?;
    let field = state.db.call(move |db| db.get_field(&project_type, id)).await?;
    match field {
        Some(field) => Ok(Json(field)),
        None => Err(ApiError::NotFound(format!("Field config {} not found", id))),
    }
}

async fn update_field_config(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((project_type, id)): ApiPath<(String, i64)>,
    ApiJson(req): ApiJson<FieldConfigUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Fields, Permission::Write)?;
    let pt = project_type.clone();
    let field = state.db.call(move |db| db.update_field(&pt, id, req)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::FieldConfigChanged { project_type });
    Ok(Json(field))
}

async fn delete_field_config(
    State(state): State<SharedState>,
    actor: Actor,
    ApiPath((project_type, id)): ApiPath<(String, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    state.require(&actor, Module::Fields, Permission::Delete)?;
    let pt = project_type.clone();
    state.db.call(move |db| db.delete_field(&pt, id)).await?;
    broadcast_message(&state.ws_tx, &WsMessage::FieldConfigChanged { project_type });
    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::db::BoardDb;
    use crate::config::{AuthSection, UserConfig};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    fn user(name: &str, role: &str) -> UserConfig {
        UserConfig {
            name: name.into(),
            role: role.into(),
            token: format!("t-{}", name),
        }
    }

    fn test_state() -> SharedState {
        let db = BoardDb::new_in_memory().unwrap();
        let (ws_tx, _) = broadcast::channel(16);
        let auth = Authorizer::new(&AuthSection {
            users: vec![user("ana", "admin"), user("bruno", "member"), user("vera", "viewer")],
            roles: Default::default(),
        });
        Arc::new(AppState {
            db: DbHandle::new(db),
            ws_tx,
            auth,
        })
    }

    fn test_app() -> Router {
        api_router().with_state(test_state())
    }

    async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn create_board(app: &Router, name: &str) {
        let (status, _) = send(
            app,
            "POST",
            "/api/projects/registro/boards",
            Some("t-ana"),
            Some(json!({"name": name})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    async fn create_ticket(app: &Router, board: &str, name: &str) -> Value {
        let (status, ticket) = send(
            app,
            "POST",
            "/api/projects/registro/create",
            Some("t-bruno"),
            Some(json!({"name": name, "board_name": board, "fields": {"matricula": "123"}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        ticket
    }

    fn board_names(view: &Value) -> Vec<String> {
        view["columns"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["board"]["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_health_check_is_public() {
        let app = test_app();
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_missing_or_bad_token_is_unauthorized() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/projects/registro", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, "GET", "/api/projects/registro", Some("nope"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_board_view_has_reserved_boards() {
        let app = test_app();
        let (status, view) = send(&app, "GET", "/api/projects/registro", Some("t-vera"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(board_names(&view), vec!["Concluídas", "Canceladas"]);
    }

    #[tokio::test]
    async fn test_viewer_cannot_create_board() {
        let app = test_app();
        let (status, body) = send(
            &app,
            "POST",
            "/api/projects/registro/boards",
            Some("t-vera"),
            Some(json!({"name": "Triagem"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains("vera"));
    }

    #[tokio::test]
    async fn test_duplicate_board_is_conflict() {
        let app = test_app();
        create_board(&app, "Quadro A").await;
        let (status, body) = send(
            &app,
            "POST",
            "/api/projects/registro/boards",
            Some("t-ana"),
            Some(json!({"name": "Quadro A"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("Quadro A"));
    }

    #[tokio::test]
    async fn test_rename_reserved_board_is_unprocessable() {
        let app = test_app();
        create_board(&app, "Triagem").await;
        let (status, _) = send(
            &app,
            "PUT",
            "/api/projects/registro/rename-board",
            Some("t-ana"),
            Some(json!({"old_name": "Triagem", "new_name": "Concluídas"})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, board) = send(
            &app,
            "PUT",
            "/api/projects/registro/rename-board",
            Some("t-ana"),
            Some(json!({"old_name": "Triagem", "new_name": "Entrada"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(board["name"], "Entrada");
    }

    #[tokio::test]
    async fn test_reorder_boards_then_list() {
        let app = test_app();
        for name in ["A", "B", "C"] {
            create_board(&app, name).await;
        }
        let (status, _) = send(
            &app,
            "PUT",
            "/api/projects/registro/reorder-boards",
            Some("t-ana"),
            Some(json!({"boards": ["C", "A", "B"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, boards) = send(&app, "GET", "/api/projects/registro/boards", Some("t-ana"), None).await;
        let names: Vec<&str> = boards
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["C", "A", "B", "Concluídas", "Canceladas"]);
    }

    #[tokio::test]
    async fn test_save_boards_creates_missing() {
        let app = test_app();
        let (status, boards) = send(
            &app,
            "POST",
            "/api/projects/registro",
            Some("t-ana"),
            Some(json!({"boards": ["Triagem", "Análise"]})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(boards.as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_ticket_flow_to_done() {
        let app = test_app();
        create_board(&app, "Triagem").await;
        let ticket = create_ticket(&app, "Triagem", "T1").await;
        assert_eq!(ticket["field_values"]["matricula"]["value"], "123");
        let id = ticket["id"].as_str().unwrap();

        let (status, moved) = send(
            &app,
            "PATCH",
            &format!("/api/tickets/{}/move", id),
            Some("t-bruno"),
            Some(json!({"board_name": "Concluídas"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(moved["board_name"], "Concluídas");

        let (_, activity) = send(&app, "GET", &format!("/api/tickets/{}/activity", id), Some("t-vera"), None).await;
        let kinds: Vec<&str> = activity
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, vec!["completed", "status_changed", "created"]);
        assert_eq!(activity[0]["actor"], "bruno");

        let (_, view) = send(&app, "GET", "/api/projects/registro", Some("t-vera"), None).await;
        let triagem = &view["columns"][0];
        assert_eq!(triagem["board"]["name"], "Triagem");
        assert!(triagem["tickets"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_ticket_on_missing_board_is_not_found() {
        let app = test_app();
        let (status, _) = send(
            &app,
            "POST",
            "/api/projects/registro/create",
            Some("t-bruno"),
            Some(json!({"name": "T1", "board_name": "Fantasma"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/api/projects/registro/boards")
            .header("authorization", "Bearer t-ana")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_ticket_id_is_bad_request() {
        let app = test_app();
        let (status, body) = send(&app, "GET", "/api/tickets/not-a-uuid", Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&app, "GET", &format!("/api/tickets/{}", Uuid::new_v4()), Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_required_field_is_validated() {
        let app = test_app();
        create_board(&app, "Triagem").await;
        let (status, _) = send(
            &app,
            "POST",
            "/api/field-configs/registro",
            Some("t-ana"),
            Some(json!({"label": "Custas", "field_name": "custas", "field_type": "text", "required": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(
            &app,
            "POST",
            "/api/projects/registro/create",
            Some("t-bruno"),
            Some(json!({"name": "T1", "board_name": "Triagem"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Custas"));
    }

    #[tokio::test]
    async fn test_member_cannot_manage_fields() {
        let app = test_app();
        let (status, _) = send(
            &app,
            "POST",
            "/api/field-configs/registro",
            Some("t-bruno"),
            Some(json!({"label": "Livro", "field_name": "livro", "field_type": "text"})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, fields) = send(&app, "GET", "/api/field-configs/registro", Some("t-bruno"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(fields.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_field_config_crud() {
        let app = test_app();
        let (_, field) = send(
            &app,
            "POST",
            "/api/field-configs/registro",
            Some("t-ana"),
            Some(json!({
                "label": "Tipo",
                "field_name": "tipo",
                "field_type": "dropdown",
                "options": [{"value": "nasc", "label": "Nascimento"}]
            })),
        )
        .await;
        let uri = format!("/api/field-configs/registro/{}", field["id"]);

        let (status, updated) = send(&app, "PUT", &uri, Some("t-ana"), Some(json!({"visible_on_card": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["visible_on_card"], true);

        let (status, _) = send(&app, "DELETE", &uri, Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "GET", &uri, Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_fields_twice_adds_entries_once() {
        let app = test_app();
        create_board(&app, "Triagem").await;
        let ticket = create_ticket(&app, "Triagem", "T1").await;
        let uri = format!("/api/tickets/{}/fields", ticket["id"].as_str().unwrap());
        let body = json!({"fields": {"matricula": "999", "livro": "A"}});

        let (_, first) = send(&app, "PATCH", &uri, Some("t-bruno"), Some(body.clone())).await;
        assert_eq!(first["activity"].as_array().unwrap().len(), 3);
        let (_, second) = send(&app, "PATCH", &uri, Some("t-bruno"), Some(body)).await;
        assert_eq!(second["activity"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_delete_ticket_requires_delete_permission() {
        let app = test_app();
        create_board(&app, "Triagem").await;
        let ticket = create_ticket(&app, "Triagem", "T1").await;
        let uri = format!("/api/tickets/{}", ticket["id"].as_str().unwrap());

        let (status, _) = send(&app, "DELETE", &uri, Some("t-bruno"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, "DELETE", &uri, Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, "DELETE", &uri, Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_comment_moderation() {
        let app = test_app();
        create_board(&app, "Triagem").await;
        let ticket = create_ticket(&app, "Triagem", "T1").await;
        let id = ticket["id"].as_str().unwrap();

        let (status, ticket) = send(
            &app,
            "POST",
            &format!("/api/tickets/{}/comments", id),
            Some("t-ana"),
            Some(json!({"text": "Aguardando certidão"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(ticket["comments"][0]["author"], "ana");
        let comment_uri = format!("/api/tickets/{}/comments/{}", id, ticket["comments"][0]["id"].as_str().unwrap());

        let (status, _) = send(&app, "PUT", &comment_uri, Some("t-bruno"), Some(json!({"text": "x"}))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = send(&app, "DELETE", &comment_uri, Some("t-bruno"), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Admins hold tickets:delete and may remove anyone's comment.
        let (status, ticket) = send(&app, "DELETE", &comment_uri, Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(ticket["comments"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_items_and_attachments() {
        let app = test_app();
        create_board(&app, "Triagem").await;
        let ticket = create_ticket(&app, "Triagem", "T1").await;
        let id = ticket["id"].as_str().unwrap();

        let (status, ticket) = send(
            &app,
            "POST",
            &format!("/api/tickets/{}/pending-items", id),
            Some("t-bruno"),
            Some(json!({"text": "Conferir selo"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let item_uri = format!("/api/tickets/{}/pending-items/{}", id, ticket["pending_items"][0]["id"].as_str().unwrap());
        let (_, ticket) = send(&app, "PATCH", &item_uri, Some("t-bruno"), None).await;
        assert_eq!(ticket["pending_items"][0]["completed"], true);

        let (status, ticket) = send(
            &app,
            "POST",
            &format!("/api/tickets/{}/attachments", id),
            Some("t-bruno"),
            Some(json!({"file_name": "selo.pdf", "url": "https://files.example/selo.pdf"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let attachment_uri = format!("/api/tickets/{}/attachments/{}", id, ticket["attachments"][0]["id"].as_str().unwrap());
        let (status, ticket) = send(&app, "DELETE", &attachment_uri, Some("t-bruno"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(ticket["attachments"].as_array().unwrap().is_empty());
        assert_eq!(ticket["activity"][0]["type"], "attachment_removed");
    }

    #[tokio::test]
    async fn test_search_and_board_colors() {
        let app = test_app();
        create_board(&app, "Triagem").await;
        create_ticket(&app, "Triagem", "Nascimento Pedro").await;
        create_ticket(&app, "Triagem", "Casamento").await;

        let (status, results) = send(&app, "GET", "/api/projects/registro/search?q=pedro", Some("t-vera"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(results.as_array().unwrap().len(), 1);

        let (status, mapping) = send(
            &app,
            "POST",
            "/api/board-colors/registro",
            Some("t-ana"),
            Some(json!({"board_name": "Triagem", "color": "purple"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(mapping["color"], "purple");

        let (_, colors) = send(&app, "GET", "/api/board-colors/registro", Some("t-vera"), None).await;
        assert_eq!(colors[0]["color"], "purple");
        assert_eq!(colors[1]["color"], "green");
    }

    #[tokio::test]
    async fn test_delete_board_reports_ticket_count_and_broadcasts() {
        let state = test_state();
        let mut rx = state.ws_tx.subscribe();
        let app = api_router().with_state(state);
        create_board(&app, "Triagem").await;
        create_ticket(&app, "Triagem", "T1").await;

        let (status, body) = send(&app, "DELETE", "/api/projects/registro/boards/Triagem", Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deleted_tickets"], 1);

        let mut last = None;
        while let Ok(msg) = rx.try_recv() {
            last = Some(msg);
        }
        let last: Value = serde_json::from_str(&last.unwrap()).unwrap();
        assert_eq!(last["type"], "BoardDeleted");
        assert_eq!(last["data"]["name"], "Triagem");
    }

    #[tokio::test]
    async fn test_delete_reserved_board_is_unprocessable() {
        let app = test_app();
        let (status, _) = send(&app, "DELETE", "/api/projects/registro/boards/Canceladas", Some("t-ana"), None).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
