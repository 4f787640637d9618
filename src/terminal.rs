// Line-oriented chat front end

use crate::chat::{ChatController, StreamOutcome};
use crate::commands;
use crate::gate::StreamStatus;
use crate::models::{Attachment, Message, Role};
use crate::state::AppState;
use anyhow::{Context, Result};
use std::future::Future;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

const HELP: &str = "\
Commands:
  /new                 start a new conversation
  /list                list conversations, most recent first
  /open <n|id>         switch to a conversation
  /delete <n|id>       delete a conversation
  /rename <title>      rename the current conversation
  /models              list available models
  /model <id>          use a model for new conversations and the current one
  /system [text]       show or set the current conversation's system prompt
  /system --default <text>
                       set the default system prompt
  /system --clear      use the default system prompt again
  /attach <path>       attach a file to the next message
  /regen               regenerate the last reply
  /help                show this help
  /quit                exit
Anything else is sent as a message. Ctrl-C stops a reply that is streaming.";

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Message(&'a str),
    New,
    List,
    Open(&'a str),
    Delete(&'a str),
    Rename(&'a str),
    Models,
    Model(&'a str),
    ShowSystem,
    System(&'a str),
    DefaultSystem(&'a str),
    ClearSystem,
    Attach(&'a str),
    Regenerate,
    Help,
    Quit,
    Empty,
    Unknown(&'a str),
}

fn parse_line(line: &str) -> Input<'_> {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line);
    };

    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match (name, arg) {
        ("new", _) => Input::New,
        ("list", _) => Input::List,
        ("open", id) if !id.is_empty() => Input::Open(id),
        ("delete", id) if !id.is_empty() => Input::Delete(id),
        ("rename", title) if !title.is_empty() => Input::Rename(title),
        ("models", _) => Input::Models,
        ("model", id) if !id.is_empty() => Input::Model(id),
        ("system", "") => Input::ShowSystem,
        ("system", "--clear") => Input::ClearSystem,
        ("system", text) => match text.strip_prefix("--default") {
            Some(prompt) if !prompt.trim().is_empty() => Input::DefaultSystem(prompt.trim()),
            Some(_) => Input::Unknown(line),
            None => Input::System(text),
        },
        ("attach", path) if !path.is_empty() => Input::Attach(path),
        ("regen", _) => Input::Regenerate,
        ("help", _) => Input::Help,
        ("quit" | "exit", _) => Input::Quit,
        _ => Input::Unknown(line),
    }
}

/// Turns successive versions of a streaming message into the text that still
/// needs printing.
#[derive(Debug, Default)]
pub struct StreamPrinter {
    message_id: Option<Uuid>,
    printed: String,
}

impl StreamPrinter {
    pub fn render(&mut self, message: &Message) -> Option<String> {
        if self.message_id != Some(message.id) {
            self.message_id = Some(message.id);
            self.printed.clear();
        }
        if message.content == self.printed {
            return None;
        }

        // Content that no longer extends what was shown (an error replacing a
        // partial reply) is printed again in full on its own line.
        let output = match message.content.strip_prefix(self.printed.as_str()) {
            Some(rest) => rest.to_string(),
            None => format!("\n{}", message.content),
        };
        self.printed = message.content.clone();
        Some(output)
    }
}

fn emit(text: &str) {
    print!("{}", text);
    let _ = std::io::stdout().flush();
}

/// Runs `operation` while echoing whichever message is streaming and mapping
/// Ctrl-C to stop-generation.
async fn follow_stream<F, T>(chat: &ChatController, operation: F) -> (T, StreamPrinter)
where
    F: Future<Output = T>,
{
    let mut changes = chat.store().subscribe();
    let mut printer = StreamPrinter::default();
    tokio::pin!(operation);

    loop {
        tokio::select! {
            result = &mut operation => return (result, printer),
            Ok(()) = tokio::signal::ctrl_c() => {
                if chat.stop_active() {
                    emit(" [stopping]");
                }
            }
            Ok(()) = changes.changed() => {
                let StreamStatus::Streaming { conversation_id, message_id } = chat.gate().status() else {
                    continue;
                };
                let state = changes.borrow_and_update().clone();
                let message = state
                    .conversation(conversation_id)
                    .and_then(|c| c.message(message_id));
                if let Some(text) = message.and_then(|m| printer.render(m)) {
                    emit(&text);
                }
            }
        }
    }
}

/// Prints whatever of the finished message has not been shown yet.
fn finish_stream(state: &AppState, printer: &mut StreamPrinter, conversation_id: Uuid, message_id: Uuid) {
    let message = state
        .chat
        .store()
        .get(conversation_id)
        .and_then(|c| c.message(message_id).cloned());
    if let Some(text) = message.and_then(|m| printer.render(&m)) {
        emit(&text);
    }
    println!();
}

fn resolve_conversation(state: &AppState, arg: &str) -> Result<String, String> {
    match arg.parse::<usize>() {
        Ok(n) => commands::list_conversations(state)
            .get(n.wrapping_sub(1))
            .map(|c| c.id.to_string())
            .ok_or_else(|| format!("No conversation #{}", n)),
        Err(_) => Ok(arg.to_string()),
    }
}

fn selected_id(state: &AppState) -> Result<String, String> {
    state
        .chat
        .store()
        .selected()
        .map(|id| id.to_string())
        .ok_or_else(|| "No conversation selected. Use /new or /open first.".to_string())
}

fn print_conversation(state: &AppState, conversation_id: &str) -> Result<(), String> {
    for message in commands::get_conversation_messages(state, conversation_id)? {
        let speaker = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        println!("{}> {}", speaker, message.content);
        for attachment in &message.attachments {
            println!("   [{} {}, {} bytes]", attachment.name, attachment.mime_type, attachment.size);
        }
    }
    Ok(())
}

async fn send(state: &AppState, text: &str, pending: &mut Vec<Attachment>) -> Result<(), String> {
    let attachments = std::mem::take(pending);
    emit("assistant> ");
    let (result, mut printer) = follow_stream(
        &state.chat,
        commands::send_message(state, None, text, attachments.clone()),
    )
    .await;

    match result? {
        Some(turn) => {
            finish_stream(state, &mut printer, turn.conversation_id, turn.assistant_message_id);
            if turn.outcome == StreamOutcome::Cancelled {
                println!("[stopped]");
            }
            Ok(())
        }
        None => {
            println!();
            *pending = attachments;
            Err("Message not sent.".to_string())
        }
    }
}

async fn regenerate(state: &AppState) -> Result<(), String> {
    let conversation_id = selected_id(state)?;
    let messages = commands::get_conversation_messages(state, &conversation_id)?;
    let target = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.id)
        .ok_or_else(|| "Nothing to regenerate yet.".to_string())?;

    emit("assistant> ");
    let (result, mut printer) = follow_stream(
        &state.chat,
        commands::regenerate_response(state, &conversation_id, &target.to_string()),
    )
    .await;

    match result? {
        Some(outcome) => {
            if let Ok(conv_uuid) = Uuid::parse_str(&conversation_id) {
                finish_stream(state, &mut printer, conv_uuid, target);
            }
            if outcome == StreamOutcome::Cancelled {
                println!("[stopped]");
            }
            Ok(())
        }
        None => {
            println!();
            Err("That reply cannot be regenerated.".to_string())
        }
    }
}

async fn handle(state: &AppState, input: Input<'_>, pending: &mut Vec<Attachment>) -> Result<(), String> {
    match input {
        Input::Message(text) => send(state, text, pending).await?,
        Input::New => {
            let conversation = commands::create_conversation(state);
            println!("Started conversation {} ({})", conversation.id, conversation.model_id);
        }
        Input::List => {
            let selected = state.chat.store().selected();
            for (i, conversation) in commands::list_conversations(state).iter().enumerate() {
                let marker = if Some(conversation.id) == selected { '*' } else { ' ' };
                println!(
                    "{}{:>3}. {} ({} messages, {})",
                    marker,
                    i + 1,
                    conversation.title,
                    conversation.messages.len(),
                    conversation.model_id
                );
            }
        }
        Input::Open(arg) => {
            let id = resolve_conversation(state, arg)?;
            let conversation = commands::select_conversation(state, &id)?;
            println!("== {} ==", conversation.title);
            print_conversation(state, &id)?;
        }
        Input::Delete(arg) => {
            let id = resolve_conversation(state, arg)?;
            commands::delete_conversation(state, &id)?;
            println!("Deleted.");
        }
        Input::Rename(title) => commands::rename_conversation(state, &selected_id(state)?, title)?,
        Input::Models => {
            let active = state.chat.settings().active_model.id;
            for model in commands::list_models(state) {
                let marker = if model.id == active { '*' } else { ' ' };
                println!("{} {:<26} {} - {}", marker, model.id, model.name, model.description);
            }
        }
        Input::Model(id) => {
            let model = commands::set_active_model(state, id)?;
            if let Ok(conversation_id) = selected_id(state) {
                commands::update_conversation_model(state, &conversation_id, &model.id)?;
            }
            println!("Using {}", model.name);
        }
        Input::ShowSystem => {
            let default_prompt = state.chat.settings().system_prompt;
            let conversation = state.chat.store().snapshot().selected_conversation().cloned();
            let prompt = conversation
                .as_deref()
                .map(|c| c.effective_system_prompt(&default_prompt).to_string())
                .unwrap_or_else(|| default_prompt.clone());
            println!("{}", prompt);
        }
        Input::System(text) => {
            commands::update_conversation_system_prompt(state, &selected_id(state)?, text)?
        }
        Input::ClearSystem => commands::update_conversation_system_prompt(state, &selected_id(state)?, "")?,
        Input::DefaultSystem(text) => commands::set_system_prompt(state, text)?,
        Input::Attach(path) => {
            let attachment = Attachment::from_file(path)
                .await
                .map_err(|e| format!("{:#}", e))?;
            println!("Attached {} ({}, {} bytes)", attachment.name, attachment.mime_type, attachment.size);
            pending.push(attachment);
        }
        Input::Regenerate => regenerate(state).await?,
        Input::Help => println!("{}", HELP),
        Input::Unknown(line) => return Err(format!("Unknown command: {} (try /help)", line)),
        Input::Quit | Input::Empty => {}
    }
    Ok(())
}

/// Reads commands from stdin until `/quit`, end of input or Ctrl-C at the prompt.
pub async fn run(state: &AppState) -> Result<()> {
    println!("parley - type /help for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Vec<Attachment> = Vec::new();

    loop {
        emit("> ");
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read input")?,
            Ok(()) = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let input = parse_line(&line);
        if input == Input::Quit {
            break;
        }
        if let Err(e) = handle(state, input, &mut pending).await {
            println!("error: {}", e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_and_messages() {
        assert_eq!(parse_line("  hello there "), Input::Message("hello there"));
        assert_eq!(parse_line(""), Input::Empty);
        assert_eq!(parse_line("/open 2"), Input::Open("2"));
        assert_eq!(parse_line("/rename  Trip plans "), Input::Rename("Trip plans"));
        assert_eq!(parse_line("/system"), Input::ShowSystem);
        assert_eq!(parse_line("/system be brief"), Input::System("be brief"));
        assert_eq!(parse_line("/system --default be kind"), Input::DefaultSystem("be kind"));
        assert_eq!(parse_line("/system --clear"), Input::ClearSystem);
        assert_eq!(parse_line("/attach ~/cat.png"), Input::Attach("~/cat.png"));
        assert_eq!(parse_line("/exit"), Input::Quit);
        assert_eq!(parse_line("/open"), Input::Unknown("/open"));
        assert_eq!(parse_line("/frobnicate"), Input::Unknown("/frobnicate"));
    }

    #[test]
    fn printer_emits_only_new_text() {
        let mut printer = StreamPrinter::default();
        let message = Message::assistant_placeholder();
        assert_eq!(printer.render(&message), None);

        let partial = message.with_content("Hel");
        assert_eq!(printer.render(&partial).as_deref(), Some("Hel"));
        assert_eq!(printer.render(&partial), None);
        assert_eq!(printer.render(&message.with_content("Hello")).as_deref(), Some("lo"));

        let failed = message.with_content("Sorry");
        assert_eq!(printer.render(&failed).as_deref(), Some("\nSorry"));
    }

    #[test]
    fn printer_restarts_for_a_new_message() {
        let mut printer = StreamPrinter::default();
        let first = Message::assistant_placeholder().with_content("one");
        let second = Message::assistant_placeholder().with_content("two");
        assert_eq!(printer.render(&first).as_deref(), Some("one"));
        assert_eq!(printer.render(&second).as_deref(), Some("two"));
    }
}
