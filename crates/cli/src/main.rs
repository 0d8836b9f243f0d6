//! weftctl: run the controller against a cluster, validate supply-chain
//! definitions, or render a workload offline.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{info, warn};
use weft_chain::{validate_chain, EmptySelectorPolicy};
use weft_core::{kinds, SupplyChain, Template, TemplateSpec, Workload};
use weft_kubehub::{ClusterWatchHub, KubeStore};
use weft_runtime::{spawn_workers, BackoffConfig, MemoryQueue, Reconciler, ReconcilerConfig, RouterHub};
use weft_stamp::{WatchHub, WatchRegistrar};
use weft_store::{MemoryStore, ObjectRef, ObjectStore};

#[derive(Parser, Debug)]
#[command(name = "weftctl", version, about = "Weft supply-chain controller")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller against the current kube context
    Run {
        /// Concurrent reconcile workers
        #[arg(long = "workers", default_value_t = 2)]
        workers: usize,
        /// Base backoff delay in milliseconds
        #[arg(long = "base-delay-ms", default_value_t = 1000)]
        base_delay_ms: u64,
        /// Backoff cap in milliseconds
        #[arg(long = "max-delay-ms", default_value_t = 64_000)]
        max_delay_ms: u64,
        /// Let a supply chain with an empty selector match every workload
        #[arg(long = "empty-selector-matches-all", action = ArgAction::SetTrue)]
        empty_selector_matches_all: bool,
    },
    /// Validate supply chains and templates from YAML files
    Validate {
        /// YAML files (multi-document allowed)
        files: Vec<PathBuf>,
    },
    /// Evaluate a workload against local definitions without a cluster
    Render {
        /// YAML files holding the workload, supply chain, and templates
        files: Vec<PathBuf>,
        /// Let a supply chain with an empty selector match every workload
        #[arg(long = "empty-selector-matches-all", action = ArgAction::SetTrue)]
        empty_selector_matches_all: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("WEFT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("WEFT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid WEFT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { workers, base_delay_ms, max_delay_ms, empty_selector_matches_all } => {
            run_controller(workers, base_delay_ms, max_delay_ms, selector_policy(empty_selector_matches_all)).await
        }
        Commands::Validate { files } => validate(&files),
        Commands::Render { files, empty_selector_matches_all } => {
            render(&files, selector_policy(empty_selector_matches_all), cli.output).await
        }
    }
}

fn selector_policy(match_all: bool) -> EmptySelectorPolicy {
    if match_all {
        EmptySelectorPolicy::MatchEverything
    } else {
        EmptySelectorPolicy::MatchNothing
    }
}

async fn run_controller(
    workers: usize,
    base_delay_ms: u64,
    max_delay_ms: u64,
    empty_selector: EmptySelectorPolicy,
) -> Result<()> {
    let store = Arc::new(KubeStore::connect().await.map_err(|e| anyhow!("connecting to cluster: {e}"))?);
    let queue = Arc::new(MemoryQueue::new());
    let hub = ClusterWatchHub::new(store.client(), queue.clone());
    let registrar = WatchRegistrar::new(Arc::new(hub.clone()));
    let cfg = ReconcilerConfig {
        backoff: BackoffConfig {
            base: Duration::from_millis(base_delay_ms),
            max: Duration::from_millis(max_delay_ms),
        },
        empty_selector,
    };
    let reconciler = Arc::new(Reconciler::new(store.clone(), registrar, cfg));
    hub.set_reconciler(reconciler.clone());

    // The initial watch list replays every object, which seeds the queue.
    for kind in [
        kinds::WORKLOAD,
        kinds::SUPPLY_CHAIN,
        kinds::SOURCE_TEMPLATE,
        kinds::IMAGE_TEMPLATE,
        kinds::CONFIG_TEMPLATE,
        kinds::GENERIC_TEMPLATE,
    ] {
        hub.subscribe(weft_core::API_VERSION, kind)
            .await
            .map_err(|e| anyhow!("watching {kind}: {e}"))?;
    }

    let _workers = spawn_workers(workers, reconciler, queue);
    info!(workers, "weft controller running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

fn load_documents(files: &[PathBuf]) -> Result<Vec<Json>> {
    if files.is_empty() {
        bail!("no input files given");
    }
    let mut docs = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        for doc in serde_yaml::Deserializer::from_str(&text) {
            let value = serde_yaml::Value::deserialize(doc)
                .with_context(|| format!("parsing {}", path.display()))?;
            if value.is_null() {
                continue;
            }
            let json = serde_json::to_value(value).with_context(|| format!("converting {}", path.display()))?;
            docs.push(json);
        }
    }
    Ok(docs)
}

fn doc_kind(doc: &Json) -> &str {
    doc.get("kind").and_then(|k| k.as_str()).unwrap_or("")
}

fn doc_name(doc: &Json) -> &str {
    doc["metadata"]["name"].as_str().unwrap_or("<unnamed>")
}

fn template_paths(spec: &TemplateSpec) -> Vec<&str> {
    let mut paths = Vec::new();
    match spec {
        TemplateSpec::Source(s) => {
            paths.push(s.url_path.as_str());
            paths.push(s.revision_path.as_str());
        }
        TemplateSpec::Image(s) => paths.push(s.image_path.as_str()),
        TemplateSpec::Config(s) => paths.push(s.config_path.as_str()),
        TemplateSpec::Generic(_) => {}
    }
    if let Some(h) = spec.health_path() {
        paths.push(h);
    }
    paths
}

fn validate(files: &[PathBuf]) -> Result<()> {
    let docs = load_documents(files)?;
    let mut failures = 0usize;
    for doc in &docs {
        let name = doc_name(doc).to_string();
        match doc_kind(doc) {
            kinds::SUPPLY_CHAIN => {
                let chain = match SupplyChain::from_object(doc) {
                    Ok(c) => c,
                    Err(e) => {
                        failures += 1;
                        println!("FAIL SupplyChain/{name}: {e}");
                        continue;
                    }
                };
                if let Err(e) = validate_chain(&chain) {
                    failures += 1;
                    println!("FAIL SupplyChain/{name}: {e}");
                    continue;
                }
                if chain.spec.selector.is_empty() {
                    println!("WARN SupplyChain/{name}: empty selector matches nothing by default");
                }
                println!("OK   SupplyChain/{name}");
            }
            kinds::SOURCE_TEMPLATE | kinds::IMAGE_TEMPLATE | kinds::CONFIG_TEMPLATE | kinds::GENERIC_TEMPLATE => {
                let kind = doc_kind(doc).to_string();
                match Template::from_object(doc) {
                    Ok(t) => {
                        let mut bad = false;
                        for path in template_paths(&t.spec) {
                            if let Err(e) = weft_expr::parse(path) {
                                failures += 1;
                                bad = true;
                                println!("FAIL {kind}/{name}: {e}");
                            }
                        }
                        if !bad {
                            println!("OK   {kind}/{name}");
                        }
                    }
                    Err(e) => {
                        failures += 1;
                        println!("FAIL {kind}/{name}: {e}");
                    }
                }
            }
            kinds::WORKLOAD => println!("OK   Workload/{name}"),
            other => println!("SKIP {other}/{name}: not a weft kind"),
        }
    }
    if failures > 0 {
        bail!("{failures} document(s) failed validation");
    }
    Ok(())
}

async fn render(files: &[PathBuf], empty_selector: EmptySelectorPolicy, output: Output) -> Result<()> {
    let docs = load_documents(files)?;
    let store = Arc::new(MemoryStore::new());
    let mut workload_keys = Vec::new();
    for doc in docs {
        if doc_kind(&doc) == kinds::WORKLOAD {
            let workload = Workload::from_object(&doc).context("parsing workload")?;
            workload_keys.push(workload.key());
        }
        store
            .create(doc)
            .await
            .map_err(|e| anyhow!("loading object: {e}"))?;
    }
    if workload_keys.is_empty() {
        bail!("no Workload document in input");
    }

    let hub = RouterHub::new();
    let registrar = WatchRegistrar::new(Arc::new(hub));
    let cfg = ReconcilerConfig { empty_selector, ..Default::default() };
    let reconciler = Arc::new(Reconciler::new(store.clone(), registrar, cfg));

    // Cycle to a fixpoint: stop once a full pass writes nothing new.
    for _ in 0..10 {
        let before = store.write_count();
        for key in &workload_keys {
            reconciler.reconcile(key).await;
        }
        if store.write_count() == before {
            break;
        }
    }

    let mut report = Vec::new();
    for key in &workload_keys {
        let obj = store
            .get(&ObjectRef::weft(kinds::WORKLOAD, Some(&key.namespace), &key.name))
            .await
            .map_err(|e| anyhow!("reading workload back: {e}"))?
            .ok_or_else(|| anyhow!("workload {key} disappeared during render"))?;
        let status = obj.get("status").cloned().unwrap_or(Json::Null);
        let mut stamped = Vec::new();
        if let Some(resources) = status.get("resources").and_then(|r| r.as_array()) {
            for res in resources {
                let Some(r) = res.get("stampedRef") else { continue };
                let obj_ref = ObjectRef::new(
                    r["apiVersion"].as_str().unwrap_or_default(),
                    r["kind"].as_str().unwrap_or_default(),
                    r["namespace"].as_str(),
                    r["name"].as_str().unwrap_or_default(),
                );
                if let Some(live) = store.get(&obj_ref).await.map_err(|e| anyhow!("reading stamped object: {e}"))? {
                    stamped.push(live);
                }
            }
        }
        report.push(serde_json::json!({
            "workload": key.to_string(),
            "status": status,
            "stamped": stamped,
        }));
    }

    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Output::Human => {
            for entry in &report {
                println!("workload {}", entry["workload"].as_str().unwrap_or_default());
                if let Some(conditions) = entry["status"]["conditions"].as_array() {
                    for c in conditions {
                        println!(
                            "  {:<20} {:<8} {}{}",
                            c["type"].as_str().unwrap_or_default(),
                            c["status"].as_str().unwrap_or_default(),
                            c["reason"].as_str().unwrap_or_default(),
                            c["message"]
                                .as_str()
                                .filter(|m| !m.is_empty())
                                .map(|m| format!(" ({m})"))
                                .unwrap_or_default(),
                        );
                    }
                }
                if let Some(stamped) = entry["stamped"].as_array() {
                    for obj in stamped {
                        println!("---");
                        print!("{}", serde_yaml::to_string(obj)?);
                    }
                }
            }
        }
    }
    Ok(())
}
