use crate::config::DashConfig;
use crate::services::acquire::AcquirePipeline;
use crate::services::engine::{EngineSession, EngineSettings};
use crate::services::views::ViewBuilder;
use crate::time::SelectionStore;
use reqwest::Client;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: DashConfig,
    pub engine: Arc<EngineSession>,
    pub pipeline: Arc<AcquirePipeline>,
    pub views: Arc<ViewBuilder>,
    pub selection: Arc<SelectionStore>,
    pub http: Client,
}

impl AppState {
    pub fn new(config: DashConfig) -> Self {
        let http = Client::new();
        let engine = Arc::new(EngineSession::new(
            EngineSettings::from_config(&config),
            config.engine_max_concurrent,
        ));
        let pipeline = Arc::new(AcquirePipeline::new(engine.clone(), http.clone(), &config));
        let views = Arc::new(ViewBuilder::new(engine.clone()));
        let selection = Arc::new(SelectionStore::new(config.selection_state_path()));
        Self {
            config,
            engine,
            pipeline,
            views,
            selection,
            http,
        }
    }
}
