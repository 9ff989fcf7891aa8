//! Prints session snapshots to the terminal.

use pubchat_session::{Message, Seqno, SessionError, SessionSnapshot};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

pub async fn run(mut rx: broadcast::Receiver<SessionSnapshot>) {
    let mut newest: Option<Seqno> = None;
    let mut last_error: Option<SessionError> = None;

    loop {
        let snapshot = match rx.recv().await {
            Ok(snapshot) => snapshot,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Renderer fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        for message in fresh_messages(&snapshot.messages, newest.as_ref()) {
            println!("{}", line(message));
        }
        if let Some(first) = snapshot.messages.first() {
            newest = Some(first.seqno().clone());
        }

        if snapshot.last_error != last_error {
            if let Some(err) = &snapshot.last_error {
                eprintln!("{}", error_line(err));
            }
            last_error = snapshot.last_error;
        }
    }
}

/// Messages newer than `newest`, oldest first.
fn fresh_messages<'a>(messages: &'a [Arc<Message>], newest: Option<&Seqno>) -> Vec<&'a Message> {
    let mut fresh: Vec<_> = messages
        .iter()
        .take_while(|m| Some(m.seqno()) != newest)
        .map(Arc::as_ref)
        .collect();
    fresh.reverse();
    fresh
}

fn error_line(err: &SessionError) -> String {
    if err.is_recoverable() {
        format!("! {err}")
    } else {
        format!("!! {err} (chat unavailable until restart)")
    }
}

fn line(message: &Message) -> String {
    let sender = message.sender().unwrap_or("?");
    match message.text() {
        Some(text) => format!("<{sender}> {text}"),
        None => format!("<{sender}> {}", message.body()),
    }
}
