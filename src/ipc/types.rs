use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::config::EnvVars;
use crate::services::Services;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub config: EnvVars,
    pub services: Services,
}

impl AppState {
    pub fn new(config: EnvVars) -> Self {
        Self {
            workspace: None,
            db: None,
            config,
            services: Services::sqlite(),
        }
    }
}
