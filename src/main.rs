use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Map};
use tracing::{error, info};

use integration_sync_engine::config::{EngineConfig, FieldSpec, FieldType};
use integration_sync_engine::job_state::{EngineContext, StepExecutionContext};
use integration_sync_engine::summary::ExecuteIntegrationResult;
use integration_sync_engine::sync::{
    synchronize_collected_data, EventPublisher, HttpSyncClient, RetryPolicy, SyncClient,
};
use integration_sync_engine::types::{
    self, Entity, ExecutionHandler, Relationship, Step, StepStartState, TypeSchema,
};
use integration_sync_engine::StepScheduler;

/// CLI entrypoint using `clap` to define subcommands.
#[derive(Parser)]
#[command(name = "integration-sync-engine", version, about = "Step execution engine for integration collection jobs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the built-in demo step catalog and, if `--sync-base-url` is
    /// given, synchronize the collected data with a remote persister.
    Run {
        /// Directory graph objects are flushed to and the cache loader
        /// reads from. Also where `summary.json` is written.
        #[arg(long, default_value = "./storage")]
        storage: PathBuf,

        /// Maximum number of steps dispatched concurrently.
        #[arg(long, default_value_t = 1)]
        concurrency: usize,

        /// Base URL of the synchronization API. Omit to skip upload.
        #[arg(long)]
        sync_base_url: Option<String>,
    },
}

/// Async entrypoint with Tokio runtime.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    integration_sync_engine::logging::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            storage,
            concurrency,
            sync_base_url,
        } => run(storage, concurrency, sync_base_url).await,
    }
}

async fn run(storage: PathBuf, concurrency: usize, sync_base_url: Option<String>) -> anyhow::Result<()> {
    let specs = [FieldSpec::optional("integration_instance_id", FieldType::String)];
    let engine_config = EngineConfig::load(&specs)?;
    let integration_instance_id = engine_config
        .get_string("integration_instance_id")
        .unwrap_or("demo-instance")
        .to_string();

    std::fs::create_dir_all(&storage)?;

    let engine = Arc::new(EngineContext::new(storage.clone()));
    let steps = demo_step_catalog();
    let start_states: HashMap<String, StepStartState> = HashMap::new();

    info!(step_count = steps.len(), %integration_instance_id, "starting run");

    let scheduler = StepScheduler::new(engine.clone(), None, concurrency);
    let results = match scheduler.run(steps, start_states).await {
        Ok(results) => results,
        Err(err) => {
            error!("run aborted: {err}");
            return Err(err.into());
        }
    };

    println!("Step results:");
    for result in &results {
        println!("  {:<24} {:?}", result.id, result.status);
    }

    let partial_datasets = results
        .iter()
        .map(|r| (r.id.clone(), !r.partial_types.is_empty()))
        .collect();
    let summary = ExecuteIntegrationResult::new(results, partial_datasets);
    summary.write_to(&storage)?;

    if let Some(base_url) = sync_base_url {
        let client: Arc<dyn SyncClient> = Arc::new(HttpSyncClient::new(base_url));
        let (events, events_handle) = EventPublisher::spawn(|event| async move {
            info!(name = %event.name, description = %event.description, "sync event");
        });

        let sync_result = synchronize_collected_data(
            client,
            &integration_instance_id,
            &engine.store,
            json!(summary.metadata.partial_datasets),
            events,
            events_handle,
            RetryPolicy::default(),
        )
        .await;

        match sync_result {
            Ok(job) => println!("synchronization job {} finished as {}", job.id, job.status),
            Err(err) => {
                error!("synchronization failed: {err}");
                return Err(err.into());
            }
        }
    }

    if summary.has_non_success_steps() {
        std::process::exit(1);
    }

    Ok(())
}

fn handler(f: impl Fn(StepExecutionContext) -> types::HandlerFuture + Send + Sync + 'static) -> ExecutionHandler {
    Arc::new(f)
}

/// A small embedded demo catalog standing in for the step catalog an
/// out-of-scope front end would otherwise load: `fetch-users` and
/// `fetch-groups` run independently, `build-memberships` depends on
/// both and emits relationships between their entities.
fn demo_step_catalog() -> Vec<Step> {
    vec![
        Step {
            id: "fetch-users".into(),
            name: "Fetch Users".into(),
            depends_on: Default::default(),
            entities: vec![TypeSchema::new("user", false)],
            relationships: vec![],
            mapped_relationships: vec![],
            execution_handler: handler(|ctx| {
                Box::pin(async move {
                    for i in 0..3 {
                        ctx.add_entity(Entity {
                            _key: format!("user-{i}"),
                            _type: "user".into(),
                            _class: vec!["User".into()],
                            properties: Map::new(),
                            _raw_data: None,
                        })
                        .await?;
                    }
                    Ok(())
                })
            }),
        },
        Step {
            id: "fetch-groups".into(),
            name: "Fetch Groups".into(),
            depends_on: Default::default(),
            entities: vec![TypeSchema::new("group", false)],
            relationships: vec![],
            mapped_relationships: vec![],
            execution_handler: handler(|ctx| {
                Box::pin(async move {
                    ctx.add_entity(Entity {
                        _key: "group-admins".into(),
                        _type: "group".into(),
                        _class: vec!["UserGroup".into()],
                        properties: Map::new(),
                        _raw_data: None,
                    })
                    .await?;
                    Ok(())
                })
            }),
        },
        Step {
            id: "build-memberships".into(),
            name: "Build Memberships".into(),
            depends_on: ["fetch-users".to_string(), "fetch-groups".to_string()]
                .into_iter()
                .collect(),
            entities: vec![],
            relationships: vec![TypeSchema::new("has_member", false)],
            mapped_relationships: vec![],
            execution_handler: handler(|ctx| {
                Box::pin(async move {
                    let users: Vec<_> = ctx
                        .job_state
                        .iterate_entities(types::TypeFilter {
                            _type: Some("user".into()),
                        })
                        .collect();
                    for user in users {
                        ctx.add_relationship(Relationship {
                            _key: format!("group-admins-has-{}", user._key),
                            _type: "has_member".into(),
                            _from_entity_key: "group-admins".into(),
                            _to_entity_key: Some(user._key.clone()),
                            mapping: None,
                            properties: Map::new(),
                        })
                        .await?;
                    }
                    Ok(())
                })
            }),
        },
    ]
}
