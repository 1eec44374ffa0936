//! Line commands and plain-text rendering for the terminal client.

use std::path::PathBuf;

use counsel_llm::{ContextBlocks, EnrichmentFlags};
use counsel_storage::{AnalysisMode, SessionId, SessionRecord};

use crate::attach::parse_analysis_mode;
use crate::chat::{MessageStatus, RenderedRow, Role};

pub const HELP: &str = "\
Commands:
  /new                     start a new chat
  /list                    list your chats
  /search <text>           list chats whose title or last message matches
  /switch <n|id>           open a chat from the list
  /rename <title>          rename the current chat
  /delete [n|id]           delete a chat (default: current)
  /share                   create a share link for the current chat
  /stop                    stop the reply being streamed
  /export [dir]            write the transcript as JSON
  /attach <path> [mode]    attach a file (mode: text_only, visual, full)
  /detach                  drop pending attachments
  /cases /news /summary    toggle enrichment for the next messages
  /help                    show this help
  /quit                    exit
Anything else is sent as a message.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrichment {
    Cases,
    News,
    Summary,
}

impl Enrichment {
    /// Flips the flag and returns its new value.
    pub fn toggle(self, flags: &mut EnrichmentFlags) -> bool {
        let flag = match self {
            Self::Cases => &mut flags.fetch_cases,
            Self::News => &mut flags.fetch_news,
            Self::Summary => &mut flags.summarize,
        };
        *flag = !*flag;
        *flag
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Cases => "legal case search",
            Self::News => "news search",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    New,
    List,
    Search(String),
    Switch(String),
    Rename(String),
    Delete(Option<String>),
    Share,
    Stop,
    Export(Option<PathBuf>),
    Attach { path: PathBuf, mode: AnalysisMode },
    Detach,
    Toggle(Enrichment),
    Help,
    Quit,
    /// Known command with missing or malformed arguments.
    Usage(&'static str),
    Unknown(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Send(line.to_string());
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    match name {
        "new" => Command::New,
        "list" | "ls" => Command::List,
        "search" | "find" if args.is_empty() => Command::Usage("/search <text>"),
        "search" | "find" => Command::Search(args.to_string()),
        "switch" | "open" if args.is_empty() => Command::Usage("/switch <n|id>"),
        "switch" | "open" => Command::Switch(args.to_string()),
        "rename" if args.is_empty() => Command::Usage("/rename <title>"),
        "rename" => Command::Rename(args.to_string()),
        "delete" | "rm" => Command::Delete((!args.is_empty()).then(|| args.to_string())),
        "share" => Command::Share,
        "stop" => Command::Stop,
        "export" => Command::Export((!args.is_empty()).then(|| PathBuf::from(args))),
        "attach" if args.is_empty() => Command::Usage("/attach <path> [mode]"),
        "attach" => {
            let (path, mode) = args
                .rsplit_once(char::is_whitespace)
                .and_then(|(path, mode)| Some((path.trim(), parse_analysis_mode(mode).ok()?)))
                .unwrap_or((args, AnalysisMode::TextOnly));
            Command::Attach {
                path: PathBuf::from(path),
                mode,
            }
        }
        "detach" => Command::Detach,
        "cases" => Command::Toggle(Enrichment::Cases),
        "news" => Command::Toggle(Enrichment::News),
        "summary" | "summarize" => Command::Toggle(Enrichment::Summary),
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

/// Resolves a 1-based list position or a literal session id.
pub fn resolve_session(sessions: &[SessionRecord], raw: &str) -> Option<SessionId> {
    let raw = raw.trim();
    if let Ok(position) = raw.parse::<usize>() {
        return position
            .checked_sub(1)
            .and_then(|index| sessions.get(index))
            .map(|record| record.id.clone());
    }

    sessions
        .iter()
        .find(|record| record.id.as_str() == raw)
        .map(|record| record.id.clone())
        .or_else(|| SessionId::parse(raw).ok())
}

pub fn format_session_line(position: usize, record: &SessionRecord, current: bool) -> String {
    let marker = if current { '*' } else { ' ' };
    format!(
        "{marker} {position:>2}. {} ({}): {}",
        record.title, record.id, record.last_message
    )
}

pub fn speaker(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "counsel",
        Role::System => "!",
    }
}

pub fn format_context(context: &ContextBlocks) -> String {
    let sections = [
        ("Legal cases", &context.legal_cases),
        ("News", &context.news_articles),
        ("Summary", &context.summary),
    ];

    sections
        .iter()
        .filter_map(|(heading, body)| {
            body.as_deref()
                .map(|body| format!("  [{heading}]\n{}", indent(body.trim())))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lines shown after a reply's text: its context and any status marker.
pub fn format_row_suffix(row: &RenderedRow) -> Option<String> {
    let mut lines = Vec::new();
    if let Some(context) = &row.context {
        lines.push(format_context(context));
    }
    if row.status == MessageStatus::Cancelled {
        lines.push("  [stopped]".to_string());
    }
    (!lines.is_empty()).then(|| lines.join("\n"))
}

pub fn format_row(row: &RenderedRow) -> String {
    let mut out = match row.role {
        Role::System => format!("! {}", row.content),
        role => format!("{}> {}", speaker(role), row.content),
    };

    for file in &row.attachments {
        out.push_str(&format!(
            "\n  [file {} ({}, {} bytes, {})]",
            file.name,
            file.mime_type,
            file.size_bytes,
            file.analysis_mode.as_str()
        ));
    }
    if let Some(suffix) = format_row_suffix(row) {
        out.push('\n');
        out.push_str(&suffix);
    }
    out
}

fn indent(text: &str) -> String {
    text.lines()
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MessageId;
    use counsel_storage::FileRef;

    fn record(id: &str, title: &str) -> SessionRecord {
        let mut record = SessionRecord::new(SessionId::parse(id).unwrap());
        record.title = title.to_string();
        record
    }

    #[test]
    fn plain_lines_are_messages() {
        assert_eq!(
            parse_command("  what is a tort?  "),
            Command::Send("what is a tort?".to_string())
        );
        assert_eq!(parse_command(""), Command::Send(String::new()));
    }

    #[test]
    fn commands_parse_their_arguments() {
        assert_eq!(parse_command("/new"), Command::New);
        assert_eq!(
            parse_command("/rename  Lease dispute "),
            Command::Rename("Lease dispute".to_string())
        );
        assert_eq!(parse_command("/rename"), Command::Usage("/rename <title>"));
        assert_eq!(parse_command("/delete"), Command::Delete(None));
        assert_eq!(
            parse_command("/switch 2"),
            Command::Switch("2".to_string())
        );
        assert_eq!(
            parse_command("/attach docs/my brief.pdf visual"),
            Command::Attach {
                path: PathBuf::from("docs/my brief.pdf"),
                mode: AnalysisMode::Visual,
            }
        );
        assert_eq!(
            parse_command("/attach notes.txt"),
            Command::Attach {
                path: PathBuf::from("notes.txt"),
                mode: AnalysisMode::TextOnly,
            }
        );
        assert_eq!(
            parse_command("/search  Lease "),
            Command::Search("Lease".to_string())
        );
        assert_eq!(parse_command("/search"), Command::Usage("/search <text>"));
        assert_eq!(parse_command("/news"), Command::Toggle(Enrichment::News));
        assert_eq!(
            parse_command("/frobnicate"),
            Command::Unknown("frobnicate".to_string())
        );
    }

    #[test]
    fn enrichment_toggles_flip_one_flag() {
        let mut flags = EnrichmentFlags::default();
        assert!(Enrichment::Cases.toggle(&mut flags));
        assert!(flags.fetch_cases && !flags.fetch_news && !flags.summarize);
        assert!(!Enrichment::Cases.toggle(&mut flags));
        assert!(!flags.any());
    }

    #[test]
    fn sessions_resolve_by_position_or_id() {
        let sessions = vec![record("a-1", "First"), record("b-2", "Second")];

        assert_eq!(resolve_session(&sessions, "2").unwrap().as_str(), "b-2");
        assert_eq!(resolve_session(&sessions, "a-1").unwrap().as_str(), "a-1");
        assert_eq!(resolve_session(&sessions, "elsewhere").unwrap().as_str(), "elsewhere");
        assert!(resolve_session(&sessions, "0").is_none());
        assert!(resolve_session(&sessions, "3").is_none());
    }

    #[test]
    fn rows_show_files_context_and_stop_marker() {
        let row = RenderedRow {
            id: Some(MessageId::new(4)),
            role: Role::Assistant,
            content: "Partial answer".to_string(),
            attachments: vec![FileRef::new("lease.pdf", "application/pdf", 10, AnalysisMode::Full)],
            context: Some(ContextBlocks {
                legal_cases: Some("Smith v Jones".to_string()),
                ..ContextBlocks::default()
            }),
            status: MessageStatus::Cancelled,
            in_progress: false,
        };

        assert_eq!(
            format_row(&row),
            "counsel> Partial answer\n  [file lease.pdf (application/pdf, 10 bytes, full)]\n  \
             [Legal cases]\n    Smith v Jones\n  [stopped]"
        );
    }

    #[test]
    fn notices_render_without_speaker() {
        let row = RenderedRow {
            id: Some(MessageId::new(1)),
            role: Role::System,
            content: "Failed to get a response. Please try again.".to_string(),
            attachments: Vec::new(),
            context: None,
            status: MessageStatus::Error("Failed to get a response. Please try again.".to_string()),
            in_progress: false,
        };
        assert_eq!(format_row(&row), "! Failed to get a response. Please try again.");
    }
}
