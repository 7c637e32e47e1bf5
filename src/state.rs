use crate::{config::Config, matching::Matchmaker, websocket::ConnectionRegistry};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ConnectionRegistry,
    pub matchmaker: Matchmaker,
}
