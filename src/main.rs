use async_trait::async_trait;
use std::process::ExitCode;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use agent_relay_lib::agent::AgentProxy;
use agent_relay_lib::relay::{
    ChatId, ChatTransport, Choice, FilePayload, InboundMessage, MessageId, OutboundFile, Relay,
    TransportError,
};
use agent_relay_lib::sessions::{Publisher, SessionStore};
use agent_relay_lib::{config, logging};

const LOCAL_USER: i64 = 1;
const LOCAL_CHAT: ChatId = 1;
const CHOOSE_PREFIX: &str = "!choose ";

/// Line-based stand-in for a chat platform: replies go to stdout.
struct ConsoleTransport {
    next_id: AtomicI64,
    out: Mutex<tokio::io::Stdout>,
}

impl ConsoleTransport {
    fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            out: Mutex::new(tokio::io::stdout()),
        }
    }

    async fn print(&self, text: &str) -> Result<MessageId, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut out = self.out.lock().await;
        out.write_all(format!("[{}] {}\n\n", id, text).as_bytes())
            .await
            .map_err(|e| TransportError::Delivery(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| TransportError::Delivery(e.to_string()))?;
        Ok(id)
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send_text(&self, _chat_id: ChatId, text: String) -> Result<MessageId, TransportError> {
        self.print(&text).await
    }

    async fn send_choices(
        &self,
        _chat_id: ChatId,
        text: String,
        choices: Vec<Choice>,
    ) -> Result<MessageId, TransportError> {
        let mut rendered = text;
        for choice in choices {
            rendered.push_str(&format!("\n  {}{}  ({})", CHOOSE_PREFIX, choice.data, choice.label));
        }
        self.print(&rendered).await
    }

    async fn edit_text(
        &self,
        _chat_id: ChatId,
        message_id: MessageId,
        text: String,
    ) -> Result<(), TransportError> {
        self.print(&format!("(edit of {}) {}", message_id, text))
            .await
            .map(|_| ())
    }

    async fn delete_message(&self, _chat_id: ChatId, message_id: MessageId) -> Result<(), TransportError> {
        log::debug!("Message {} deleted", message_id);
        Ok(())
    }

    async fn send_file(&self, _chat_id: ChatId, file: OutboundFile) -> Result<(), TransportError> {
        let location = match &file.payload {
            FilePayload::Path(path) => path.display().to_string(),
            FilePayload::Bytes(bytes) => format!("{} bytes in memory", bytes.len()),
        };
        self.print(&format!("[file] {} - {} ({})", file.file_name, file.caption, location))
            .await
            .map(|_| ())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_logging();

    let settings = match config::load() {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("Failed to load settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let proxy = match AgentProxy::from_settings(&settings) {
        Ok(proxy) => Arc::new(proxy),
        Err(e) => {
            log::error!("Failed to set up the agent proxy: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!(
        "Relaying to {} (API {}), sessions under {}",
        settings.agent_command,
        settings.agent_api_url,
        settings.work_dir.display()
    );

    let store = Arc::new(SessionStore::new(&settings.work_dir, proxy.clone()));
    let publisher = Publisher::new(settings.publish.clone());
    let relay = Arc::new(Relay::new(
        settings,
        store,
        proxy,
        Arc::new(ConsoleTransport::new()),
        publisher,
    ));

    let message_ids = AtomicI64::new(1);
    let mut in_flight = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read input: {}", e);
                break;
            }
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        let relay = relay.clone();
        if let Some(data) = line.strip_prefix(CHOOSE_PREFIX) {
            let data = data.trim().to_string();
            in_flight.push(tokio::spawn(async move {
                relay.handle_choice(LOCAL_USER, LOCAL_CHAT, &data).await;
            }));
        } else {
            let mut message = InboundMessage::text(LOCAL_USER, LOCAL_CHAT, line);
            message.message_id = message_ids.fetch_add(1, Ordering::SeqCst);
            in_flight.push(tokio::spawn(async move {
                relay.handle_message(message).await;
            }));
        }
        in_flight.retain(|handle| !handle.is_finished());
    }

    for result in futures::future::join_all(in_flight).await {
        if let Err(e) = result {
            log::error!("Request task failed: {}", e);
        }
    }
    ExitCode::SUCCESS
}
