//! Kanban board back-end: boards, tickets and per-project-type field schemas.
//!
//! ## Overview
//!
//! Each *project type* owns an ordered set of boards (columns), plus the two
//! reserved terminal boards `Concluídas` and `Canceladas` that always sort
//! last. Tickets sit on exactly one board and carry a typed field bag
//! validated against the project type's field configuration. Every change to
//! a ticket is recorded in its capped activity trail.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    ├─ api.rs   (route handlers, AppState)        │
//! └──────────┘ WebSocket│    │    └─ auth.rs (Actor, Authorizer)          │
//!                       │    └─ ws.rs    (WsMessage change feed)           │
//!                       │         │                                        │
//!                       │         │ DbHandle::call()                       │
//!                       │         v                                        │
//!                       │  db/  (BoardDb: boards, tickets, field_configs)  │
//!                       │         │                                        │
//!                       │         │ FieldSchema / ActivityLog              │
//!                       │         v                                        │
//!                       │  fields.rs, activity.rs, models.rs               │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Typical Request Flow (move ticket → "Concluídas")
//!
//! 1. `PATCH /api/tickets/{id}/move` → `api::move_ticket()`; the bearer token
//!    resolves to an [`auth::Actor`] and `tickets:write` is checked.
//! 2. `BoardDb::move_ticket()` loads the ticket, records `status_changed`
//!    then `completed`, and writes the row back.
//! 3. A `TicketMoved` message is broadcast to WebSocket clients and the
//!    updated ticket is returned.

pub mod activity;
pub mod api;
pub mod auth;
pub mod db;
pub mod fields;
pub mod models;
pub mod server;
pub mod ws;
