use std::io::{self, Write};
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use colored::*;
use tracing_subscriber::EnvFilter;

use debate_stream::cli::Args;
use debate_stream::render::TranscriptPrinter;
use debate_stream::store::{MemorySessionStore, SessionStore, SqliteSessionStore};
use debate_stream::{ConversationState, DebateConfig, DebateSession, DebateTransport, FileTransport, HttpTransport, StreamEnd};

fn init_tracing(verbose: bool) {
    let default = if verbose { "debate_stream=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<DebateConfig, Box<dyn std::error::Error>> {
    let base = match &args.config {
        Some(path) => DebateConfig::load(path)?,
        None => DebateConfig::default(),
    };
    Ok(args.apply_to(base.with_env()))
}

fn open_store(config: &DebateConfig) -> Result<Arc<dyn SessionStore>, Box<dyn std::error::Error>> {
    let store: Arc<dyn SessionStore> = match &config.session_db {
        Some(path) => Arc::new(SqliteSessionStore::open(path)?),
        None => Arc::new(MemorySessionStore::new()),
    };
    Ok(store)
}

fn emit(printer: &mut TranscriptPrinter, state: &ConversationState) {
    let chunk = printer.render(state);
    if !chunk.is_empty() {
        print!("{chunk}");
        let _ = io::stdout().flush();
    }
}

/// Drive one stream while printing snapshots as they arrive. Ctrl-C aborts.
async fn run<T: DebateTransport>(
    session: &DebateSession<T>,
    topic: &str,
    inject: bool,
) -> Result<StreamEnd, Box<dyn std::error::Error>> {
    let mut rx = session.subscribe();
    let mut printer = TranscriptPrinter::new();
    let stream = async {
        if inject {
            session.send_user_message(topic).await
        } else {
            session.start_debate(topic).await
        }
    };
    tokio::pin!(stream);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut stream => break outcome,
            changed = rx.changed() => {
                if changed.is_ok() {
                    emit(&mut printer, &rx.borrow_and_update());
                }
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                session.abort_active_stream();
            }
        }
    };

    emit(&mut printer, &session.snapshot());
    println!();
    Ok(outcome?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(shell) = args.completions {
        clap_complete::generate(shell, &mut Args::command(), "debate-stream", &mut io::stdout());
        return Ok(());
    }

    init_tracing(args.verbose);
    let config = load_config(&args)?;
    let store = open_store(&config)?;

    if args.list_sessions {
        for s in store.list()? {
            println!("{:>6}  {}", s.session_id.to_string().bright_yellow(), s.title);
        }
        return Ok(());
    }

    let topic = match (&args.topic, &args.replay) {
        (Some(topic), _) => topic.clone(),
        (None, Some(path)) => format!("Replay of {}", path.display()),
        (None, None) => {
            eprintln!("{}", "A topic is required (see --help).".bright_red());
            std::process::exit(2);
        }
    };

    let outcome = match &args.replay {
        Some(path) => {
            let session = DebateSession::builder(FileTransport::new(path))
                .config(&config)
                .store(store)
                .build();
            run(&session, &topic, false).await?
        }
        None => {
            let session = DebateSession::builder(HttpTransport::new(&config.api_base_url))
                .config(&config)
                .store(store)
                .build();
            let mut inject = false;
            if let Some(id) = args.resume {
                if !session.resume(id)? {
                    eprintln!("{} {}", "No saved session".bright_red(), id);
                    std::process::exit(1);
                }
                inject = true;
            }
            run(&session, &topic, inject).await?
        }
    };

    match outcome {
        StreamEnd::Finished => {}
        StreamEnd::Cancelled => eprintln!("{}", "stream cancelled".bright_yellow()),
        StreamEnd::ServerError(message) => {
            eprintln!("{} {}", "server reported an error:".bright_red(), message)
        }
    }
    Ok(())
}
