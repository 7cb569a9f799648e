//! Messaging gateways the bot listens on.

pub mod telegram;

use anyhow::Result;
use async_trait::async_trait;
use credit_ledger::UserId;
use tempfile::TempPath;

pub use telegram::TelegramGateway;

/// Largest text a single outgoing message may carry, in UTF-16 code units.
pub const MAX_MESSAGE_UNITS: usize = 4096;

/// One user event delivered by a gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub chat_id: i64,
    pub user_id: UserId,
    pub display_name: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Text(String),
    /// Opaque gateway reference to the largest photo size.
    Photo { file_ref: String },
    Command { name: String, args: Vec<String> },
}

#[async_trait]
pub trait Gateway: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the next batch of events. An empty batch is a poll timeout.
    async fn next_events(&self) -> Result<Vec<Incoming>>;

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;

    async fn send_typing(&self, chat_id: i64) -> Result<()>;

    /// Download a file to a temporary path that is removed on drop.
    async fn download_file(&self, file_ref: &str) -> Result<TempPath>;
}

/// Split `text` into chunks of at most `max_units` UTF-16 code units,
/// preferring line breaks as split points.
///
/// Telegram measures message length in UTF-16, so a symbol outside the
/// basic plane such as `𝑥` counts twice.
pub fn split_message(text: &str, max_units: usize) -> Vec<String> {
    let max_units = max_units.max(2);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = line.encode_utf16().count();
        if current_len + line_len > max_units && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }

        if line_len > max_units {
            // A single overlong line is cut on character boundaries.
            for ch in line.chars() {
                let ch_len = ch.len_utf16();
                if current_len + ch_len > max_units {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push(ch);
                current_len += ch_len;
            }
        } else {
            current.push_str(line);
            current_len += line_len;
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split a command message into its name and whitespace-separated args.
/// `/start@mathtop_bot 42` yields `("start", ["42"])`.
pub fn parse_command(text: &str) -> Option<(String, Vec<String>)> {
    let body = text.strip_prefix('/')?;
    let mut parts = body.split_whitespace();
    let head = parts.next()?;
    let name = head.split('@').next().unwrap_or(head).to_lowercase();
    if name.is_empty() {
        return None;
    }
    Some((name, parts.map(str::to_string).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_one_chunk() {
        assert_eq!(split_message("hola", 10), vec!["hola"]);
        assert!(split_message("", 10).is_empty());
    }

    #[test]
    fn splits_on_line_breaks() {
        let chunks = split_message("aaaa\nbbbb\ncccc", 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc"]);
    }

    #[test]
    fn long_line_is_cut_on_char_boundaries() {
        let text = "ñ".repeat(25);
        let chunks = split_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn astral_symbols_count_as_two_units() {
        let text = "𝑥".repeat(6);
        let chunks = split_message(&text, 5);
        assert_eq!(chunks, vec!["𝑥𝑥", "𝑥𝑥", "𝑥𝑥"]);
        assert!(chunks.iter().all(|c| c.encode_utf16().count() <= 5));

        let lines = "𝔸𝔸\n𝔸𝔸\n";
        assert_eq!(split_message(lines, 6), vec!["𝔸𝔸\n", "𝔸𝔸\n"]);
    }

    #[test]
    fn command_parsing_strips_bot_suffix() {
        assert_eq!(
            parse_command("/start@mathtop_bot 42"),
            Some(("start".to_string(), vec!["42".to_string()]))
        );
        assert_eq!(parse_command("/BALANCE"), Some(("balance".to_string(), vec![])));
        assert_eq!(parse_command("hola"), None);
        assert_eq!(parse_command("/"), None);
    }
}
