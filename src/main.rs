//! Muhaffiz terminal front-end
//!
//! Reads single-letter commands from stdin and prints session state changes.

use anyhow::{bail, Context, Result};
use muhaffiz::catalog::{demo_books, find_book, load_book};
use muhaffiz::pulse::PulseDevices;
use muhaffiz::transport::GeminiConnector;
use muhaffiz::{Book, ConnectionState, Passage, SessionController, SessionSnapshot, TutorConfig};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn select_book() -> Result<Book> {
    if let Ok(path) = std::env::var("MUHAFFIZ_BOOK_FILE") {
        return load_book(&path);
    }
    let id = std::env::var("MUHAFFIZ_BOOK").unwrap_or_else(|_| "b1".to_string());
    match find_book(&id) {
        Some(book) => Ok(book),
        None => {
            let known: Vec<String> = demo_books().into_iter().map(|b| b.id).collect();
            bail!("unknown book '{}', expected one of: {}", id, known.join(", "))
        }
    }
}

fn print_help(book: &Book) {
    println!("Muhaffiz - {} ({})", book.title_en, book.title_ar);
    println!("  {}", book.author);
    println!();
    println!("Commands:");
    println!("  c  connect and start reciting");
    println!("  m  mute / unmute the microphone");
    println!("  d  disconnect");
    println!("  q  quit");
    println!();
}

/// The parts of a snapshot worth printing; the input level changes too often.
fn summary(snapshot: &SessionSnapshot) -> (ConnectionState, bool, bool, Option<String>) {
    (
        snapshot.connection,
        snapshot.mic_on,
        snapshot.ai_speaking,
        snapshot.error.clone(),
    )
}

fn render(snapshot: &SessionSnapshot) {
    let mut line = format!("[{}]", snapshot.connection);
    if snapshot.connection == ConnectionState::Connected {
        line.push_str(if snapshot.mic_on { " mic on" } else { " mic muted" });
        if snapshot.ai_speaking {
            line.push_str(", tutor speaking");
        }
    }
    if let Some(error) = &snapshot.error {
        line.push_str(&format!(" - {}", error));
    }
    println!("{}", line);
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("muhaffiz=info")),
        )
        .init();

    let config = TutorConfig::from_env();
    if config.api_key.is_none() {
        warn!("GEMINI_API_KEY is not set; connecting will fail");
    }
    let book = select_book().context("failed to select a book")?;
    let passage = Passage::from_book(&book);
    info!("Loaded \"{}\" with {} node(s)", book.title_en, book.nodes.len());

    let devices = Arc::new(PulseDevices::new(config.app_name.clone()));
    let mut controller = SessionController::new(config, devices, Arc::new(GeminiConnector));
    let mut updates = controller.subscribe();
    let mut last = summary(&updates.borrow_and_update());

    print_help(&book);
    render(controller.snapshot());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match line.trim() {
                    "c" => {
                        if let Err(e) = controller.connect(Some(passage.clone())) {
                            println!("{}", e.user_message());
                        }
                    }
                    "m" => {
                        if let Err(e) = controller.toggle_mic() {
                            println!("{}", e.user_message());
                        }
                    }
                    "d" => controller.disconnect(),
                    "q" => break,
                    "" => {}
                    other => println!("Unknown command '{}'", other),
                }
            }
            _ = controller.step() => {}
            Ok(()) = updates.changed() => {
                let snapshot = updates.borrow_and_update().clone();
                let current = summary(&snapshot);
                if current != last {
                    render(&snapshot);
                    last = current;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    controller.disconnect();
    info!("Goodbye");
    Ok(())
}
