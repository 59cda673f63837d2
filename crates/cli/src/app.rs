use std::io::Write;

use parley_api::{ApiClient, ModelCatalog};
use parley_protocol::{Attachment, ConversationRef};
use parley_session::{Command, EngineEvent, EngineSnapshot, Submission};
use snafu::{OptionExt, ResultExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{
    ApiSnafu, CliResult, NoConversationSnafu, SessionGoneSnafu, SessionSnafu, SettingsSnafu,
    TerminalSnafu,
};
use crate::render::Renderer;
use crate::repl::{HELP, ReplCommand};
use crate::settings::SettingsStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Interactive front end: turns prompt lines into session commands and HTTP calls.
pub struct App<W: Write> {
    commands: mpsc::UnboundedSender<Command>,
    api: ApiClient,
    store: SettingsStore,
    catalog: ModelCatalog,
    /// Re-requested after every handshake since the server starts each session on its default.
    preferred_model: Option<String>,
    pending_attachments: Vec<Attachment>,
    history_limit: u32,
    renderer: Renderer,
    out: W,
}

impl<W: Write> App<W> {
    pub fn new(
        commands: mpsc::UnboundedSender<Command>,
        api: ApiClient,
        store: SettingsStore,
        catalog: ModelCatalog,
        renderer: Renderer,
        out: W,
    ) -> Self {
        let settings = store.settings();
        let preferred_model = preferred_model(settings.default_model.as_deref(), &catalog);
        Self {
            commands,
            api,
            history_limit: settings.history_limit,
            store,
            catalog,
            preferred_model,
            pending_attachments: Vec::new(),
            renderer,
            out,
        }
    }

    pub fn on_event(&mut self, event: EngineEvent) -> CliResult<()> {
        if matches!(event, EngineEvent::SessionEstablished(_))
            && let Some(model) = &self.preferred_model
        {
            tracing::debug!(model = %model, "requesting preferred model for the new session");
            self.send(Command::SwitchModel(model.clone()))?;
        }
        if let EngineEvent::SubmissionDropped { attachments, .. } = &event
            && !attachments.is_empty()
        {
            tracing::debug!(count = attachments.len(), "keeping attachments of a dropped message");
            self.keep_attachments(attachments.clone());
        }
        self.renderer
            .event(&event, &mut self.out)
            .context(TerminalSnafu {
                stage: "render-event",
            })
    }

    pub async fn on_command(&mut self, command: ReplCommand) -> CliResult<Flow> {
        match command {
            ReplCommand::Say(text) => {
                let attachments = std::mem::take(&mut self.pending_attachments);
                if let Err(error) = self.submit(text, attachments.clone()).await {
                    self.keep_attachments(attachments);
                    return Err(error);
                }
            }
            ReplCommand::Select(conversation) => {
                self.send(Command::Select(Some(conversation)))?;
            }
            ReplCommand::New => self.send(Command::Select(None))?,
            ReplCommand::Edit { record_id, text } => {
                self.send(Command::ReplayEdit { record_id, text })?;
            }
            ReplCommand::Attach(attachment) => {
                let kind = if attachment.is_image() { "image" } else { "file" };
                let message = format!("attached {kind} {}", attachment.filename);
                self.pending_attachments.push(attachment);
                self.say(&message)?;
            }
            ReplCommand::Model(model) => self.switch_model(model)?,
            ReplCommand::Models => self.list_models().await?,
            ReplCommand::Threads => self.list_threads().await?,
            ReplCommand::Delete(conversation) => {
                self.api
                    .delete_thread(&conversation)
                    .await
                    .context(ApiSnafu {
                        stage: "delete-thread",
                    })?;
                self.say(&format!(
                    "deleted {} #{}",
                    conversation.session_id, conversation.conversation_id
                ))?;
            }
            ReplCommand::Share => self.share().await?,
            ReplCommand::OpenShare(share_id) => self.open_share(&share_id).await?,
            ReplCommand::Pause => self.send(Command::Pause)?,
            ReplCommand::Reconnect => self.send(Command::Reconnect)?,
            ReplCommand::Status => {
                let snapshot = self.snapshot().await?;
                self.renderer
                    .snapshot(&snapshot, &mut self.out)
                    .context(TerminalSnafu {
                        stage: "render-status",
                    })?;
            }
            ReplCommand::Help => self.say(HELP)?,
            ReplCommand::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Prints a line that did not come from the engine.
    pub fn say(&mut self, text: &str) -> CliResult<()> {
        self.renderer
            .line(text, &mut self.out)
            .context(TerminalSnafu { stage: "print-line" })
    }

    fn send(&self, command: Command) -> CliResult<()> {
        self.commands.send(command).ok().context(SessionGoneSnafu {
            stage: "send-command",
        })
    }

    /// Waits for the engine's verdict so a rejected message does not lose its attachments.
    async fn submit(&self, text: String, attachments: Vec<Attachment>) -> CliResult<Submission> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Submit {
            text,
            attachments,
            reply: reply_tx,
        })?;
        let outcome = reply_rx.await.ok().context(SessionGoneSnafu {
            stage: "await-submit",
        })?;
        outcome.context(SessionSnafu { stage: "submit" })
    }

    /// Puts attachments back in front of anything attached since.
    fn keep_attachments(&mut self, mut attachments: Vec<Attachment>) {
        attachments.append(&mut self.pending_attachments);
        self.pending_attachments = attachments;
    }

    async fn snapshot(&self) -> CliResult<EngineSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Snapshot(reply_tx))?;
        reply_rx.await.ok().context(SessionGoneSnafu {
            stage: "await-snapshot",
        })
    }

    fn switch_model(&mut self, model: String) -> CliResult<()> {
        if !self.catalog.contains(&model) {
            tracing::warn!(model = %model, "model is not in the catalog, sending anyway");
        }
        self.send(Command::SwitchModel(model.clone()))?;

        let mut settings = (*self.store.settings()).clone();
        settings.default_model = Some(model.clone());
        self.store.update(settings).context(SettingsSnafu {
            stage: "remember-model",
        })?;
        self.preferred_model = preferred_model(Some(&model), &self.catalog);
        Ok(())
    }

    async fn list_models(&mut self) -> CliResult<()> {
        self.catalog = self.api.fetch_models().await;
        if let Some(warning) = self.catalog.warning.clone() {
            self.say(&format!("! {warning}"))?;
        }
        let lines = self
            .catalog
            .models
            .iter()
            .map(|model| {
                let marker = if model.id == self.catalog.default_model {
                    '*'
                } else {
                    ' '
                };
                format!("{marker} {:<16} {}", model.id, model.display_name())
            })
            .collect::<Vec<_>>();
        for line in lines {
            self.say(&line)?;
        }
        Ok(())
    }

    async fn list_threads(&mut self) -> CliResult<()> {
        let threads = self
            .api
            .fetch_threads(self.history_limit)
            .await
            .context(ApiSnafu {
                stage: "list-threads",
            })?;
        if threads.is_empty() {
            return self.say("no conversations yet");
        }
        for thread in threads {
            let line = format!(
                "{} {:>4}  {:>3} msgs  {}",
                thread.session_id,
                thread.conversation_id.get(),
                thread.message_count,
                thread.title()
            );
            self.say(&line)?;
        }
        Ok(())
    }

    async fn share(&mut self) -> CliResult<()> {
        let conversation = current_conversation(&self.snapshot().await?)
            .context(NoConversationSnafu { stage: "share" })?;
        let share_id = self
            .api
            .create_share(&conversation, self.history_limit)
            .await
            .context(ApiSnafu {
                stage: "create-share",
            })?;
        let link = format!("{}api/share/s/{share_id}", self.api.base_url());
        self.say(&format!("shared as {share_id}: {link}"))
    }

    async fn open_share(&mut self, share_id: &str) -> CliResult<()> {
        let snapshot = self.api.fetch_share(share_id).await.context(ApiSnafu {
            stage: "open-share",
        })?;
        for record in snapshot.records {
            if let Some(input) = record.user_input.as_deref() {
                self.say(&format!("> {input}"))?;
            }
            if let Some(response) = record.ai_response.as_deref() {
                self.say(response)?;
            }
        }
        Ok(())
    }
}

/// Bound conversation if any, otherwise the one being resumed.
fn current_conversation(snapshot: &EngineSnapshot) -> Option<ConversationRef> {
    snapshot
        .confirmed
        .as_ref()
        .map(|binding| binding.conversation.clone())
        .or_else(|| snapshot.desired.clone())
}

/// Only a configured model that differs from the server default needs an explicit switch.
fn preferred_model(configured: Option<&str>, catalog: &ModelCatalog) -> Option<String> {
    configured
        .filter(|model| *model != catalog.default_model)
        .map(str::to_string)
}
