mod config;
mod cycle;
mod dispatcher;
mod gateway;
mod memory;
mod prompt;
mod rng;
mod roles;
mod scheduler;
mod server;
mod tasks;

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use config::AppConfig;
use cycle::CycleEngine;
use dispatcher::EventDispatcher;
use gateway::{AiGateway, ChatApi};
use memory::context::ContextEngine;
use memory::store::MemoryStore;
use rng::{RandomSource, ThreadRngSource};
use roles::RoleStore;
use scheduler::SchedulerContext;
use server::{spawn_event_bridge, ServerState};
use tasks::TaskStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,companion_backend=debug")),
        )
        .init();

    tracing::info!("Companion backend starting...");

    let config = Arc::new(AppConfig::load());
    if config.ai_api_key.is_none() {
        tracing::warn!("No global AI API key configured; roles without their own key will fail");
    }

    let roles = Arc::new(RoleStore::new(config.roles_dir()));
    let tasks = Arc::new(TaskStore::new(config.tasks_file()));
    let memory = Arc::new(MemoryStore::new(&config.database_path, config.roles_dir())?);
    let gateway = Arc::new(AiGateway::new()) as Arc<dyn ChatApi>;
    let random = Arc::new(ThreadRngSource) as Arc<dyn RandomSource>;

    let context = ContextEngine::new(
        Arc::clone(&memory),
        Arc::clone(&roles),
        Arc::clone(&gateway),
        Arc::clone(&config),
    );
    let cycle = Arc::new(CycleEngine::new(
        Arc::clone(&memory),
        Arc::clone(&roles),
        Arc::clone(&config),
        Arc::clone(&random),
    ));
    let dispatcher = Arc::new(EventDispatcher::new(
        context,
        cycle,
        Arc::clone(&roles),
        Arc::clone(&gateway),
        Arc::clone(&config),
        Arc::clone(&random),
    ));

    let (event_sender, event_receiver) = flume::unbounded();
    spawn_event_bridge(Arc::clone(&dispatcher), event_receiver);

    let sched = Arc::new(SchedulerContext::new(
        event_sender,
        Arc::clone(&roles),
        tasks,
        Arc::clone(&config),
        random,
    ));
    sched.start()?;

    let state = Arc::new(ServerState {
        dispatcher,
        roles,
        memory,
    });
    let result = server::run(state, &config.bind_addr).await;

    sched.shutdown();
    result
}
