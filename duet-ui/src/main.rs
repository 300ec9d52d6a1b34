use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use duet_adapters::EnvelopeAdapter;
use duet_adapters::SseEventAdapter;
use duet_adapters::read_jsonl_transcript;
use duet_adapters::read_sse_transcript;
use duet_adapters::transcript_run_id;
use duet_core::JsonlMessageSaver;
use duet_core::Message;
use duet_core::MessageSaver;
use duet_core::Panel;
use duet_core::RawEvent;
use duet_core::Submission;
use duet_core::resolve_stream_config;
use duet_ui::DuetRuntime;
use duet_ui::PanelFeed;
use duet_ui::spawn_replay;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TranscriptFormat {
    /// One `{"event": .., "data": ..}` object per line.
    Jsonl,
    /// A recorded server-sent event body.
    Sse,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SseFraming {
    /// `event:` names the event, `data:` holds its body.
    Event,
    /// `data:` holds a whole `{"event": .., "data": ..}` envelope.
    Envelope,
}

#[derive(Debug, Parser)]
#[command(
    name = "duet-replay",
    about = "Replays recorded run-step streams through the dual-panel assembler."
)]
struct ReplayCli {
    /// Transcript streamed into the primary panel.
    #[arg(long)]
    primary: PathBuf,

    /// Transcript streamed into the secondary panel.
    #[arg(long)]
    secondary: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = TranscriptFormat::Jsonl)]
    format: TranscriptFormat,

    #[arg(long, value_enum, default_value_t = SseFraming::Event)]
    sse_framing: SseFraming,

    /// Directory holding `.duet/stream.toml`. Defaults to the current one.
    #[arg(long)]
    config_root: Option<PathBuf>,

    /// Aborts the primary run once this many events were delivered.
    #[arg(long)]
    abort_primary_after: Option<usize>,

    /// Aborts the secondary run once this many events were delivered.
    #[arg(long)]
    abort_secondary_after: Option<usize>,

    /// Appends completed messages to this JSONL file.
    #[arg(long)]
    save: Option<PathBuf>,

    #[arg(long, default_value = "assistant")]
    sender: String,

    #[arg(long)]
    conversation_id: Option<String>,

    #[arg(long)]
    parent_message_id: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = ReplayCli::parse();
    let config_root = match &cli.config_root {
        Some(path) => path.clone(),
        None => std::env::current_dir()?,
    };
    let config = resolve_stream_config(&config_root)?;
    let mut runtime = DuetRuntime::new(config);

    let mut feeds = vec![
        feed(
            &cli,
            Panel::Primary,
            load(&cli, &cli.primary).await?,
            cli.abort_primary_after,
        ),
    ];
    if let Some(path) = &cli.secondary {
        feeds.push(feed(
            &cli,
            Panel::Secondary,
            load(&cli, path).await?,
            cli.abort_secondary_after,
        ));
    }

    let saver = match &cli.save {
        Some(path) => Some(
            JsonlMessageSaver::open(path)
                .await
                .with_context(|| format!("failed to open `{}`", path.display()))?,
        ),
        None => None,
    };
    let report = runtime
        .run_turn(feeds, saver.as_ref().map(|saver| saver as &dyn MessageSaver))
        .await?;

    let completed: Vec<&Message> = report
        .completed
        .iter()
        .map(|update| &update.message)
        .collect();
    let output = json!({
        "eventsProcessed": report.events_processed,
        "completed": completed,
        "recovered": report.recovered,
        "busy": runtime.store().is_busy(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn load(cli: &ReplayCli, path: &Path) -> anyhow::Result<Vec<RawEvent>> {
    let events = match (cli.format, cli.sse_framing) {
        (TranscriptFormat::Jsonl, _) => read_jsonl_transcript(path).await?,
        (TranscriptFormat::Sse, SseFraming::Event) => {
            read_sse_transcript(path, SseEventAdapter).await?
        }
        (TranscriptFormat::Sse, SseFraming::Envelope) => {
            read_sse_transcript(path, EnvelopeAdapter).await?
        }
    };
    Ok(events)
}

fn feed(
    cli: &ReplayCli,
    panel: Panel,
    events: Vec<RawEvent>,
    abort_after: Option<usize>,
) -> PanelFeed {
    let run_id = transcript_run_id(&events).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let placeholder = Message::placeholder(
        uuid::Uuid::new_v4().to_string(),
        cli.sender.clone(),
        cli.conversation_id.clone(),
        cli.parent_message_id.clone(),
    );
    let submission = Submission::new(panel, run_id, placeholder);
    let events = spawn_replay(events, abort_after, submission.abort.clone());
    PanelFeed::new(submission, events)
}
