use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use prompt_core::{
    AccountRef, CallerData, ChunkableInput, DirectorySource, EngineConfig, FormatArgs,
    FunctionSchema, ModelProfileRegistry, OutputFormat, OutputSpec, PromptProcessor,
    TemplateKind, TemplateStore,
};
use prompt_llm::{OpenAiCompatProvider, DEFAULT_BASE_URL};

#[derive(Parser)]
#[command(name = "prompt-cli")]
#[command(about = "Render, fit and run one prompt against an LLM completion endpoint")]
#[command(version)]
struct Cli {
    /// Directory holding the template files
    #[arg(long, env = "PROMPT_TEMPLATES_DIR")]
    templates: PathBuf,

    /// Template layout entry as KIND:FILE (system, user, assistant, main), in order
    #[arg(long = "template", value_name = "KIND:FILE", required = true)]
    layout: Vec<String>,

    /// File with the chunkable input
    #[arg(long)]
    input: Option<PathBuf>,

    /// Tag the input is bound to
    #[arg(long, default_value = "code")]
    field: String,

    /// Split the input only on line boundaries
    #[arg(long)]
    list_shaped: bool,

    /// JSON file with caller data (context blocks, feature fields)
    #[arg(long)]
    data: Option<PathBuf>,

    /// JSON file with a function schema for structured output
    #[arg(long)]
    schema: Option<PathBuf>,

    #[arg(long, env = "PROMPT_MODEL")]
    model: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    max_tokens: Option<u32>,

    /// prose, bulletedList, numberedList, rankedList or json
    #[arg(long)]
    output_format: Option<String>,

    /// Engine tuning (TOML)
    #[arg(long, env = "PROMPT_ENGINE_CONFIG")]
    config: Option<PathBuf>,

    /// Model profile overrides (JSON)
    #[arg(long, env = "PROMPT_MODEL_PROFILES")]
    profiles: Option<PathBuf>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Account usage is reported against
    #[arg(long, default_value = "local")]
    account: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path).await?,
        None => EngineConfig::default(),
    };

    let mut profiles = match &cli.profiles {
        Some(path) => ModelProfileRegistry::with_config_path(path),
        None => ModelProfileRegistry::new(),
    };
    if let Err(e) = profiles.load_overrides().await {
        tracing::warn!("Ignoring model profile overrides: {}", e);
    }

    let layout = parse_layout(&cli.layout)?;
    let store = TemplateStore::load(Arc::new(DirectorySource::new(&cli.templates)), layout)
        .await
        .with_context(|| format!("loading templates from {}", cli.templates.display()))?;

    let output = match &cli.schema {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            OutputSpec::Structured(serde_json::from_str::<FunctionSchema>(&text)?)
        }
        None => OutputSpec::Prose,
    };

    let provider = OpenAiCompatProvider::new(cli.api_key.clone()).with_base_url(cli.base_url.clone());
    let mut builder = PromptProcessor::builder("cli", store, Arc::new(provider))
        .config(config)
        .profiles(Arc::new(profiles))
        .output(output);
    if cli.input.is_some() {
        let mut chunkable = ChunkableInput::new(cli.field.clone());
        if cli.list_shaped {
            chunkable = chunkable.list_shaped();
        }
        builder = builder.chunkable(chunkable);
    }
    let processor = builder.build()?;

    let data = caller_data(&cli).await?;
    let outcome = processor
        .process(&data, &AccountRef::new(cli.account.clone()), FormatArgs::new())
        .await;

    match outcome {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(e) => {
            tracing::error!(status = e.status_code(), retryable = e.is_retryable(), "{}", e);
            Err(e.into())
        }
    }
}

fn parse_layout(entries: &[String]) -> anyhow::Result<Vec<(TemplateKind, String)>> {
    entries
        .iter()
        .map(|entry| {
            let Some((kind, file)) = entry.split_once(':') else {
                bail!("template entry '{}' is not KIND:FILE", entry);
            };
            Ok((kind.parse::<TemplateKind>()?, file.to_string()))
        })
        .collect()
}

async fn caller_data(cli: &Cli) -> anyhow::Result<CallerData> {
    let mut data = match &cli.data {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<CallerData>(&text)?
        }
        None => CallerData::default(),
    };

    if let Some(path) = &cli.input {
        let input = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        data.extra.insert(cli.field.clone(), input.into());
    }

    data.model = cli.model.clone().or(data.model);
    data.temperature = cli.temperature.or(data.temperature);
    data.top_p = cli.top_p.or(data.top_p);
    data.max_tokens = cli.max_tokens.or(data.max_tokens);
    if let Some(format) = &cli.output_format {
        data.output_format = Some(format.parse::<OutputFormat>().map_err(anyhow::Error::msg)?);
    }
    Ok(data)
}
