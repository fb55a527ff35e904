use clap::Parser;
use colored::*;
use futures_util::StreamExt;
use parley::engine::SubmitOutcome;
use parley::logging::{init_tracing, setup_panic_hook, LogOptions};
use parley::store::{MessageEdit, SaveOutcome};
use parley::*;
use std::io::Write;
use tokio::io::AsyncReadExt;
use tokio_stream::wrappers::BroadcastStream;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = init_tracing(&LogOptions {
        directory: args.log_dir.clone(),
        json_stderr: args.json_logs,
        ..LogOptions::default()
    });
    setup_panic_hook();

    let code = match run(args).await {
        Ok(SubmitOutcome::Completed) | Ok(SubmitOutcome::Rejected) => 0,
        Ok(SubmitOutcome::Cancelled) => {
            eprintln!("{}", "Generation cancelled.".yellow());
            130
        }
        Ok(SubmitOutcome::Failed(message)) => {
            eprintln!("{} {}", "error:".red().bold(), message);
            1
        }
        Err(e) => {
            tracing::error!("{}", e.with_trace());
            eprintln!("{} {}", "error:".red().bold(), e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<SubmitOutcome> {
    let state = AppState::build(args).await?;

    if state.args.list {
        list_chats(&state).await;
        return Ok(SubmitOutcome::Completed);
    }

    let chat_index = select_chat(&state).await?;
    state.store.set_current_chat_index(chat_index).await;

    let prompt = match &state.args.prompt {
        Some(p) => p.clone(),
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    if prompt.trim().is_empty() {
        eprintln!("{}", "Nothing to send: the prompt is empty.".yellow());
        return Ok(SubmitOutcome::Completed);
    }

    let saved = state
        .store
        .save_message(
            chat_index,
            MessageEdit::Append(Role::User),
            vec![ContentPart::text(prompt)],
        )
        .await;
    if saved == SaveOutcome::Failed {
        return Ok(SubmitOutcome::Failed("Could not save the prompt".to_string()));
    }

    let mut events = BroadcastStream::new(state.store.subscribe());
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        while let Some(event) = events.next().await {
            match event {
                Ok(AppEvent::Delta { text, .. }) => {
                    let _ = write!(stdout, "{}", text);
                    let _ = stdout.flush();
                }
                Ok(AppEvent::StageCleared { .. }) => {
                    let _ = writeln!(stdout, "\n{}", "--- checked answer ---".dimmed());
                }
                Ok(AppEvent::Notice(notice)) => print_notice(&notice),
                Ok(AppEvent::GenerationFinished { .. }) => {
                    let _ = writeln!(stdout);
                    break;
                }
                Err(e) => tracing::warn!("Event stream lagged: {}", e),
            }
        }
    });

    let session = state.session.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            session.cancel_generation();
        }
    });

    let outcome = state.engine.submit().await;
    interrupt.abort();
    if outcome == SubmitOutcome::Rejected {
        printer.abort();
    } else if let Err(e) = printer.await {
        tracing::warn!("Output task ended abnormally: {}", e);
    }

    if let Some(chat) = state.store.chat(chat_index).await {
        if chat.title_set {
            eprintln!("{} {} ({})", "chat:".dimmed(), chat.title.bold(), chat.id);
        } else {
            eprintln!("{} {}", "chat:".dimmed(), chat.id);
        }
    }
    Ok(outcome)
}

async fn select_chat(state: &AppState) -> Result<usize> {
    let mut chats = state.store.snapshot().await;
    if let Some(id) = &state.args.chat_id {
        return chats
            .iter()
            .position(|c| c.id.0 == *id || c.id.short() == id.as_str())
            .ok_or_else(|| ParleyError::ChatNotFound(id.clone()).into());
    }

    let chat = Chat::with_system_message(
        state.args.chat_config(),
        state.args.system.as_deref().unwrap_or_default(),
    );
    tracing::info!("Starting chat {}", chat.id);
    chats.push(chat);
    let index = chats.len() - 1;
    if let Err(e) = state.store.set_chats(chats).await {
        state.store.notify(NoticeLevel::Error, e.to_string());
    }
    Ok(index)
}

async fn list_chats(state: &AppState) {
    let chats = state.store.snapshot().await;
    if chats.is_empty() {
        println!("{}", "No stored chats.".dimmed());
    }
    for chat in chats {
        println!(
            "{}  {}  {}",
            chat.id.short().cyan(),
            chat.title.bold(),
            format!("({} messages, {})", chat.messages.len(), chat.config.model).dimmed()
        );
    }
}

fn print_notice(notice: &Notice) {
    match notice.level {
        NoticeLevel::Info => eprintln!("[{}] {}", notice.timestamp.dimmed(), notice.message.green()),
        NoticeLevel::Error => eprintln!("[{}] {}", notice.timestamp.dimmed(), notice.message.red()),
    }
}
