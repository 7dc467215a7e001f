//! Provplan CLI - provisioning-plan evaluator

use std::fs;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::Value;

use provplan::ast::BUILTIN_TEMPLATE;
use provplan::binding::value_to_string;
use provplan::event::TraceWriter;
use provplan::plan::{ENV_PARAM, LOCATION_PARAM};
use provplan::{
    generate_token, validate_template, FixSuggestion, InMemoryControlPlane, ModuleRegistry,
    Plan, PlanError, PlanInputs, ProvplanConfig, Runner, Template,
};

const PRINCIPAL_PARAM: &str = "principalId";

#[derive(Parser)]
#[command(name = "provplan")]
#[command(about = "Provplan - provisioning-plan evaluator")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the plan and print token, order, waves and excluded nodes
    Plan {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, value_enum, default_value_t = PlanFormat::Text)]
        format: PlanFormat,
    },

    /// Apply the plan against the in-memory control plane
    Apply {
        #[command(flatten)]
        target: TargetArgs,

        /// Write the event log as NDJSON
        #[arg(long)]
        trace: Option<String>,

        #[arg(long, value_enum, default_value_t = ApplyFormat::Text)]
        format: ApplyFormat,

        /// Continue independent branches after a failure
        #[arg(long)]
        keep_going: bool,
    },

    /// Parse and statically check a template (no parameters needed)
    Validate {
        /// Path to a template file
        file: String,
    },

    /// Print the resource token for a scope/environment/location triple
    Token {
        #[arg(long)]
        scope: Option<String>,

        #[arg(long)]
        env: Option<String>,

        #[arg(long)]
        location: Option<String>,
    },
}

#[derive(Args)]
struct TargetArgs {
    /// Environment name (AZURE_ENV_NAME)
    #[arg(long)]
    env: Option<String>,

    /// Primary region (AZURE_LOCATION)
    #[arg(long)]
    location: Option<String>,

    /// Principal granted registry push; empty skips the grant
    #[arg(long)]
    principal_id: Option<String>,

    /// Scope id (AZURE_SUBSCRIPTION_ID)
    #[arg(long)]
    scope: Option<String>,

    /// Template file (defaults to the built-in cosmos-table-app)
    #[arg(long)]
    template: Option<String>,

    /// Extra template parameter, repeatable
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

#[derive(Clone, Copy, ValueEnum)]
enum PlanFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ApplyFormat {
    Text,
    Json,
    Env,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{}'", raw)),
    }
}

#[tokio::main]
async fn main() {
    // Load .env file (ignore if not present)
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Plan { target, format } => plan_command(&target, format),
        Commands::Apply {
            target,
            trace,
            format,
            keep_going,
        } => apply_command(&target, trace.as_deref(), format, keep_going).await,
        Commands::Validate { file } => validate_command(&file),
        Commands::Token {
            scope,
            env,
            location,
        } => token_command(scope, env, location),
    };

    if let Err(e) = result {
        eprintln!("{} {}", "Error:".red().bold(), e);
        if let Some(suggestion) = e.fix_suggestion() {
            eprintln!("  {} {}", "Fix:".yellow(), suggestion);
        }
        std::process::exit(1);
    }
}

fn load_config() -> Result<ProvplanConfig, PlanError> {
    Ok(ProvplanConfig::load()?.with_env())
}

/// Template source text: file if given, otherwise the built-in one
fn template_source(target: &TargetArgs) -> Result<String, PlanError> {
    match &target.template {
        Some(path) => Ok(fs::read_to_string(path)?),
        None => Ok(BUILTIN_TEMPLATE.to_string()),
    }
}

/// Flags over env over config file
fn build_plan(
    target: &TargetArgs,
    config: &ProvplanConfig,
    source: &str,
) -> Result<Plan, PlanError> {
    let template = Template::from_yaml(source)?;

    let env = target
        .env
        .as_deref()
        .or(config.environment())
        .ok_or_else(|| PlanError::MissingParameter {
            name: ENV_PARAM.to_string(),
        })?;
    let location = target
        .location
        .as_deref()
        .or(config.location())
        .ok_or_else(|| PlanError::MissingParameter {
            name: LOCATION_PARAM.to_string(),
        })?;
    let scope = target.scope.as_deref().unwrap_or(config.scope_id());

    let mut inputs = PlanInputs::new(scope)
        .with_param(ENV_PARAM, env)
        .with_param(LOCATION_PARAM, location);
    if template.parameters.contains_key(PRINCIPAL_PARAM) {
        let principal = target
            .principal_id
            .as_deref()
            .unwrap_or(config.principal_id());
        inputs = inputs.with_param(PRINCIPAL_PARAM, principal);
    }
    for (name, value) in &target.params {
        inputs = inputs.with_param(name.clone(), value.clone());
    }

    Plan::build(&template, Arc::new(ModuleRegistry::builtin()), &inputs)
}

fn plan_command(target: &TargetArgs, format: PlanFormat) -> Result<(), PlanError> {
    let config = load_config()?;
    let source = template_source(target)?;
    let plan = build_plan(target, &config, &source)?;

    match format {
        PlanFormat::Json => println!("{}", to_pretty(&plan.to_json())?),
        PlanFormat::Text => print_plan(&plan),
    }
    Ok(())
}

fn print_plan(plan: &Plan) {
    println!(
        "{} Plan for '{}' (token {})",
        "→".cyan(),
        plan.template_name.cyan().bold(),
        plan.token.as_str().bold()
    );

    println!("{}", "Order:".cyan().bold());
    for (i, node) in plan.ordered_nodes().enumerate() {
        let deps: Vec<&str> = node.dependencies.iter().map(|d| d.as_ref()).collect();
        let after = if deps.is_empty() {
            String::new()
        } else {
            format!(" after {}", deps.join(", ")).dimmed().to_string()
        };
        println!("  {:>2}. {} ({}){}", i + 1, node.name, node.def.module, after);
    }

    println!("{}", "Waves:".cyan().bold());
    for (i, wave) in plan.waves.iter().enumerate() {
        let names: Vec<&str> = wave.iter().map(|n| n.as_ref()).collect();
        println!("  {}: {}", i, names.join(", "));
    }

    if !plan.excluded.is_empty() {
        println!("{}", "Excluded:".cyan().bold());
        for excluded in &plan.excluded {
            println!(
                "  {} {} {}",
                "[-]".dimmed(),
                excluded.name,
                format!("when {}", excluded.predicate).dimmed()
            );
        }
    }
}

async fn apply_command(
    target: &TargetArgs,
    trace: Option<&str>,
    format: ApplyFormat,
    keep_going: bool,
) -> Result<(), PlanError> {
    let config = load_config()?;
    let source = template_source(target)?;
    let plan = build_plan(target, &config, &source)?;

    let mut settings = config.runner_settings();
    if keep_going {
        settings.fail_fast = false;
    }
    settings.progress = format == ApplyFormat::Text;

    let control_plane = Arc::new(InMemoryControlPlane::new());
    let runner = Runner::new(plan, control_plane, settings).with_template_source(source);
    let result = runner.run().await;

    // Trace is written for failed applies too
    if let Some(path) = trace {
        TraceWriter::create(path)?.write_all(runner.event_log())?;
    }
    let report = result?;

    match format {
        ApplyFormat::Json => {
            let json = serde_json::to_value(&report)
                .map_err(|e| PlanError::Execution(e.to_string()))?;
            println!("{}", to_pretty(&json)?);
        }
        ApplyFormat::Env => {
            for (name, value) in &report.outputs {
                println!("{}={}", name, env_quote(&value_to_string(value)));
            }
        }
        ApplyFormat::Text => {
            println!(
                "{} Applied in {}ms ({} created)",
                "✓".green(),
                report.duration_ms,
                report.created.len()
            );
            println!("{}", "Outputs:".cyan().bold());
            for (name, value) in &report.outputs {
                println!("  {} = {}", name, value_to_string(value));
            }
        }
    }
    Ok(())
}

fn validate_command(file: &str) -> Result<(), PlanError> {
    let yaml = fs::read_to_string(file)?;
    let template = Template::from_yaml(&yaml)?;
    let registry = ModuleRegistry::builtin();
    let report = validate_template(&template, &registry)?;

    println!("{} Template '{}' is valid", "✓".green(), file);
    println!("  Name: {}", template.name);
    println!("  Nodes: {}", report.nodes);
    println!("  Output references: {}", report.references);
    println!("  Predicates: {}", report.predicates);
    println!("  Outputs: {}", report.outputs);

    Ok(())
}

fn token_command(
    scope: Option<String>,
    env: Option<String>,
    location: Option<String>,
) -> Result<(), PlanError> {
    let config = load_config()?;
    let scope = scope.as_deref().unwrap_or(config.scope_id()).to_string();
    let env = env
        .or_else(|| config.environment().map(str::to_string))
        .ok_or_else(|| PlanError::MissingParameter {
            name: ENV_PARAM.to_string(),
        })?;
    let location = location
        .or_else(|| config.location().map(str::to_string))
        .ok_or_else(|| PlanError::MissingParameter {
            name: LOCATION_PARAM.to_string(),
        })?;

    println!("{}", generate_token(&scope, &env, &location));
    Ok(())
}

fn to_pretty(value: &Value) -> Result<String, PlanError> {
    serde_json::to_string_pretty(value).map_err(|e| PlanError::Execution(e.to_string()))
}

/// Double-quoted dotenv value
fn env_quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}
