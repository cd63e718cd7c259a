use clap::{Parser, ValueEnum};
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, EnvFilter};
use udyamitra::application::eligibility::{
    outcome_message, EligibilityLoop, LoopStep, RemoteEligibilityChecker,
};
use udyamitra::application::executor::PlanExecutor;
use udyamitra::application::extractor::MetadataExtractor;
use udyamitra::application::locations::{LocationNormalizer, NominatimGeocoder};
use udyamitra::application::mapper::ToolMapper;
use udyamitra::application::pipeline::Pipeline;
use udyamitra::application::planner::Planner;
use udyamitra::config::{AppConfig, ToolRegistry};
use udyamitra::domain::types::{EligibilityCheckRequest, Location, UserProfile};
use udyamitra::infrastructure::llm::{GroqClient, LlmClient};
use udyamitra::infrastructure::server;
use udyamitra::infrastructure::tools::{HttpToolTransport, ToolTransport};

#[derive(Parser, Debug)]
#[command(
    name = "udyamitra",
    version,
    about = "Conversational assistant for Indian government schemes"
)]
struct Cli {
    #[arg(long)]
    config: Option<String>,
    #[arg(long, value_enum, default_value_t = RunMode::Cli)]
    mode: RunMode,
    #[arg(long, default_value = "127.0.0.1:8080")]
    rest_addr: SocketAddr,
    /// Scheme to check in eligibility mode.
    #[arg(long)]
    scheme: Option<String>,
    #[arg(long, default_value = "entrepreneur")]
    user_type: String,
    #[arg(long, default_value = "India")]
    location: String,
    query: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RunMode {
    /// Process one query and print the result.
    Cli,
    /// Serve the conversation API over HTTP.
    Rest,
    /// Interactive eligibility follow-up session on stdin.
    Eligibility,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    info!("Starting udyamitra");

    let cli = Cli::parse();
    debug!(?cli.mode, config = ?cli.config, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let config = AppConfig::load(config_path)?;
    let registry = Arc::new(ToolRegistry::load(&config.registry_path)?);
    info!(tools = registry.len(), "Tool registry loaded");

    let api_key = std::env::var("GROQ_API_KEY")
        .map_err(|_| "GROQ_API_KEY must be set (environment or .env)")?;
    let llm: Arc<dyn LlmClient> =
        Arc::new(GroqClient::new(&config.llm_base_url, api_key, &config.model));
    let transport: Arc<dyn ToolTransport> = Arc::new(HttpToolTransport::new());

    match cli.mode {
        RunMode::Cli => {
            let query = cli.query.join(" ");
            if query.trim().is_empty() {
                return Err("a query is required in CLI mode".into());
            }
            let mut pipeline = build_pipeline(llm, transport, registry);
            let outcome = pipeline.start(&query).await;
            println!("{}", outcome.message);
        }
        RunMode::Rest => {
            info!(addr = %cli.rest_addr, "Starting REST server");
            let pipeline = build_pipeline(llm, transport, registry.clone());
            server::serve(pipeline, registry, cli.rest_addr).await?;
        }
        RunMode::Eligibility => {
            let scheme = cli
                .scheme
                .clone()
                .ok_or("--scheme is required in eligibility mode")?;
            run_eligibility_session(
                llm,
                transport,
                &registry,
                scheme,
                cli.user_type.clone(),
                cli.location.clone(),
                config.max_eligibility_turns,
            )
            .await?;
        }
    }
    info!("Run finished");
    Ok(())
}

fn build_pipeline(
    llm: Arc<dyn LlmClient>,
    transport: Arc<dyn ToolTransport>,
    registry: Arc<ToolRegistry>,
) -> Pipeline {
    let locations = Arc::new(LocationNormalizer::new(Box::new(NominatimGeocoder::new())));
    let extractor = MetadataExtractor::new(llm.clone(), locations);
    let mapper = ToolMapper::new(&registry);
    let planner = Planner::new(llm.clone());
    let executor = PlanExecutor::new(registry, transport, llm);
    Pipeline::new(extractor, mapper, planner, executor)
}

async fn run_eligibility_session(
    llm: Arc<dyn LlmClient>,
    transport: Arc<dyn ToolTransport>,
    registry: &ToolRegistry,
    scheme: String,
    user_type: String,
    location: String,
    max_turns: usize,
) -> Result<(), Box<dyn Error>> {
    let entry = registry
        .iter()
        .find(|entry| entry.intents.iter().any(|intent| intent == "check_eligibility"))
        .ok_or("no registered tool serves the check_eligibility intent")?
        .clone();
    info!(tool = %entry.tool_name, %scheme, "Starting interactive eligibility session");

    let request = EligibilityCheckRequest {
        scheme_name: scheme,
        user_profile: UserProfile {
            user_type,
            location: Location::india(location),
        },
        context_entities: None,
        query: None,
    };

    let checker = Arc::new(RemoteEligibilityChecker::new(transport, entry));
    let mut flow = EligibilityLoop::with_max_turns(checker, llm, request, max_turns);
    let stdin = io::stdin();

    loop {
        match flow.advance().await? {
            LoopStep::Ask { question, .. } => {
                println!("{question}");
                print!("> ");
                io::stdout().flush()?;
                let mut answer = String::new();
                stdin.lock().read_line(&mut answer)?;
                flow.submit_answer(&answer);
            }
            LoopStep::Done(outcome) => {
                println!("{}", outcome_message(&outcome));
                break;
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}
