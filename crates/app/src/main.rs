use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};

use counsel::attach::load_attachment;
use counsel::chat::{MessageStatus, RenderedRow, Role};
use counsel::logging::init_logging;
use counsel::repl::{
    Command, HELP, format_row, format_row_suffix, format_session_line, parse_command,
    resolve_session,
};
use counsel::settings::SettingsError;
use counsel::{ControllerOptions, SessionController, SettingsStore, SubmitOutcome};
use counsel_llm::{Attachment, EnrichmentFlags, ProviderError, create_service};
use counsel_storage::{FileLastSessionCache, HttpSessionStore, SessionId, StorageError};

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("failed to prepare settings: {source}"))]
    PrepareSettings { source: SettingsError },
    #[snafu(display("failed to connect the session store: {source}"))]
    ConnectStore { source: StorageError },
    #[snafu(display("failed to set up the completion service: {source}"))]
    ConnectProvider { source: ProviderError },
    #[snafu(display("failed to read input: {source}"))]
    ReadInput { source: std::io::Error },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "counsel exited with an error");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CliError> {
    let settings_store = SettingsStore::load();
    let user_id = settings_store
        .ensure_user_id()
        .context(PrepareSettingsSnafu)?;
    let settings = settings_store.settings();
    tracing::info!(
        config = %settings_store.config_path().display(),
        api_base_url = %settings.api_base_url,
        backend = ?settings.completion_backend,
        "starting counsel"
    );

    let store = HttpSessionStore::new(&settings.api_base_url, settings.response_timeout())
        .context(ConnectStoreSnafu)?;
    let service = create_service(settings.provider_config()).context(ConnectProviderSnafu)?;
    let last_session = FileLastSessionCache::for_profile(&settings.profile);

    let mut controller = SessionController::new(
        Arc::new(store),
        service,
        Arc::new(last_session),
        ControllerOptions::new(user_id, settings.share_base_url()),
    );
    controller.start();

    let mut terminal = Terminal::default();
    let mut composer = Composer::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("counsel: type a message, or /help for commands.");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(ReadInputSnafu)? else {
                    break;
                };
                if !composer.handle(&line, &mut controller).await {
                    break;
                }
                terminal.sync(&mut controller);
            }
            Some(event) = controller.next_event() => {
                controller.apply(event);
                terminal.sync(&mut controller);
            }
        }
    }

    controller.stop();
    Ok(())
}

/// Draft state that outlives single lines: pending files and enrichment.
#[derive(Default)]
struct Composer {
    attachments: Vec<Attachment>,
    enrichment: EnrichmentFlags,
}

impl Composer {
    /// Returns false when the user asked to quit.
    async fn handle(&mut self, line: &str, controller: &mut SessionController) -> bool {
        match parse_command(line) {
            Command::Send(text) => {
                let attachments = std::mem::take(&mut self.attachments);
                match controller.submit(&text, attachments.clone(), self.enrichment) {
                    SubmitOutcome::Sent(_) => {}
                    SubmitOutcome::Ignored => {}
                    SubmitOutcome::Busy => {
                        self.attachments = attachments;
                        println!("! A reply is still streaming; /stop it first.");
                    }
                    SubmitOutcome::NotReady => {
                        self.attachments = attachments;
                        println!("! The chat is still loading.");
                    }
                }
            }
            Command::New => controller.create_new(),
            Command::List => {
                controller.refresh_sessions();
                print_sessions(controller);
            }
            Command::Search(query) => print_matches(controller, &query),
            Command::Switch(raw) => match resolve_session(controller.sessions(), &raw) {
                Some(session_id) => controller.switch_session(session_id),
                None => println!("! No chat matches `{raw}`."),
            },
            Command::Rename(title) => match controller.current_session_id().cloned() {
                Some(session_id) => {
                    controller.rename(&session_id, &title);
                }
                None => println!("! No chat is open."),
            },
            Command::Delete(raw) => {
                let target = match raw {
                    Some(raw) => resolve_session(controller.sessions(), &raw),
                    None => controller.current_session_id().cloned(),
                };
                match target {
                    Some(session_id) => controller.delete(&session_id),
                    None => println!("! Nothing to delete."),
                }
            }
            Command::Share => match controller.current_session_id().cloned() {
                Some(session_id) => controller.share(&session_id),
                None => println!("! No chat is open."),
            },
            Command::Stop => {
                if !controller.stop() {
                    println!("! Nothing is streaming.");
                }
            }
            Command::Export(dir) => export(controller, dir.as_deref()),
            Command::Attach { path, mode } => match load_attachment(&path, mode).await {
                Ok(attachment) => {
                    println!(
                        "attached {} ({}, {} bytes)",
                        attachment.file.name, attachment.file.mime_type, attachment.file.size_bytes
                    );
                    self.attachments.push(attachment);
                }
                Err(error) => println!("! {error}"),
            },
            Command::Detach => {
                let dropped = std::mem::take(&mut self.attachments).len();
                println!("dropped {dropped} attachment(s)");
            }
            Command::Toggle(enrichment) => {
                let enabled = enrichment.toggle(&mut self.enrichment);
                let state = if enabled { "on" } else { "off" };
                println!("{} {state}", enrichment.label());
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => return false,
            Command::Usage(usage) => println!("usage: {usage}"),
            Command::Unknown(name) => println!("! Unknown command /{name}. Try /help."),
        }
        true
    }
}

fn print_sessions(controller: &SessionController) {
    let current = controller.current_session_id();
    if controller.sessions().is_empty() {
        println!("(no chats yet)");
    }
    for (index, record) in controller.sessions().iter().enumerate() {
        let line = format_session_line(index + 1, record, current == Some(&record.id));
        println!("{line}");
    }
}

fn print_matches(controller: &SessionController, query: &str) {
    let current = controller.current_session_id();
    let matches = controller.search_sessions(query);
    if matches.is_empty() {
        println!("(no chats match `{query}`)");
        return;
    }
    for (index, record) in controller.sessions().iter().enumerate() {
        if matches.iter().any(|found| found.id == record.id) {
            let line = format_session_line(index + 1, record, current == Some(&record.id));
            println!("{line}");
        }
    }
}

fn export(controller: &SessionController, dir: Option<&Path>) {
    let Some(document) = controller.export() else {
        println!("! No chat is open.");
        return;
    };
    let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
    match document.write_to_dir(&dir) {
        Ok(path) => println!("exported {} message(s) to {}", document.messages.len(), path.display()),
        Err(error) => println!("! {error}"),
    }
}

/// Tracks what has been printed so each sync only writes what is new.
#[derive(Default)]
struct Terminal {
    session: Option<SessionId>,
    shown: usize,
    /// Bytes of the streaming reply already printed.
    live: Option<usize>,
}

impl Terminal {
    fn sync(&mut self, controller: &mut SessionController) {
        let notices = controller.take_notices();
        let session = match controller.phase() {
            counsel::Phase::Active(session_id) => Some(session_id.clone()),
            _ => None,
        };
        if session != self.session {
            self.break_live_line();
            self.session = session;
            self.shown = 0;
            if let Some(session_id) = &self.session {
                let title = controller
                    .sessions()
                    .iter()
                    .find(|record| record.id == *session_id)
                    .map(|record| record.title.clone())
                    .unwrap_or_else(|| session_id.to_string());
                println!("-- {title} --");
            }
        }
        if self.session.is_none() {
            for notice in notices {
                println!("! {notice}");
            }
            return;
        }

        let renderer = controller.renderer();
        let rows = renderer.rows();
        let finished = rows.iter().filter(|row| !row.in_progress).collect::<Vec<_>>();
        let ended = self.live.is_some() && !renderer.is_streaming();
        if ended {
            self.live = None;
            println!();
        }

        for (index, row) in finished.iter().enumerate().skip(self.shown) {
            let streamed_reply = ended && index == self.shown && is_streamed_reply(row);
            if streamed_reply {
                if let Some(suffix) = format_row_suffix(row) {
                    println!("{suffix}");
                }
            } else {
                println!("{}", format_row(row));
            }
        }
        self.shown = finished.len();

        for notice in notices {
            self.break_live_line();
            println!("! {notice}");
        }

        if let Some(text) = renderer.streaming_text() {
            let printed = self.live.get_or_insert_with(|| {
                print!("counsel> ");
                0
            });
            print!("{}", &text[*printed..]);
            *printed = text.len();
            let _ = std::io::stdout().flush();
        }
    }

    fn break_live_line(&mut self) {
        if self.live.take().is_some() {
            println!();
        }
    }
}

fn is_streamed_reply(row: &RenderedRow) -> bool {
    row.role == Role::Assistant
        && matches!(row.status, MessageStatus::Done | MessageStatus::Cancelled)
}
