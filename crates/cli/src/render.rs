use std::io::{self, Write};

use parley_session::{EngineEvent, EngineSnapshot, NoticeLevel, TurnStatus};

/// Prints engine events as a transcript; response deltas stream inline.
#[derive(Debug, Default)]
pub struct Renderer {
    show_thinking: bool,
    mid_line: bool,
}

impl Renderer {
    pub fn new(show_thinking: bool) -> Self {
        Self {
            show_thinking,
            mid_line: false,
        }
    }

    pub fn event(&mut self, event: &EngineEvent, out: &mut impl Write) -> io::Result<()> {
        match event {
            EngineEvent::ResponseDelta { chunk, .. } => self.inline(chunk, out),
            EngineEvent::ThinkingDelta { chunk, .. } if self.show_thinking => {
                self.inline(chunk, out)
            }
            EngineEvent::ThinkingDelta { .. } | EngineEvent::TurnUpdated(_) => Ok(()),
            EngineEvent::TurnStarted(turn) => self.line(&format!("[{turn}]"), out),
            EngineEvent::TurnFinished { turn, status } => {
                let status = match status {
                    TurnStatus::Completed => "done",
                    TurnStatus::Failed => "failed",
                    TurnStatus::Pending | TurnStatus::Streaming => return Ok(()),
                };
                self.line(&format!("[{turn} {status}]"), out)
            }
            EngineEvent::ConnectionChanged { state, generation } => {
                self.line(&format!("* link {state} (generation {generation})"), out)
            }
            EngineEvent::Reconnecting(attempt) => self.line(
                &format!(
                    "* reconnecting in {:?} (attempt {}/{})",
                    attempt.delay, attempt.attempt, attempt.max_attempts
                ),
                out,
            ),
            EngineEvent::GaveUp { attempts } => self.line(
                &format!("* gave up after {attempts} attempts, use /reconnect"),
                out,
            ),
            EngineEvent::SessionEstablished(session_id) => {
                self.line(&format!("* session {session_id}"), out)
            }
            EngineEvent::ResumeConfirmed(conversation) => self.line(
                &format!(
                    "* resumed {} #{}",
                    conversation.session_id, conversation.conversation_id
                ),
                out,
            ),
            EngineEvent::ResumeFailed(failure) => {
                self.line(&format!("! resume failed: {failure}"), out)
            }
            EngineEvent::SubmissionDropped { text, reason, .. } => {
                self.line(&format!("! not sent ({reason}): {text}"), out)
            }
            EngineEvent::TurnsTruncated { from, removed } => self.line(
                &format!("* replaced {removed} turn(s) from record {from}"),
                out,
            ),
            EngineEvent::RecordBound { turn, record_id } => {
                self.line(&format!("* {turn} saved as record {record_id}"), out)
            }
            EngineEvent::ModelSwitched { model, reason } => {
                let reason = reason
                    .as_deref()
                    .map(|reason| format!(" ({reason})"))
                    .unwrap_or_default();
                self.line(&format!("* model {model}{reason}"), out)
            }
            EngineEvent::CreditsUpdated { remaining } => match remaining {
                Some(remaining) => self.line(&format!("* credits left: {remaining}"), out),
                None => Ok(()),
            },
            EngineEvent::Notice { level, message } => {
                let marker = match level {
                    NoticeLevel::Info => "*",
                    NoticeLevel::Warning => "!",
                    NoticeLevel::Error => "!!",
                };
                self.line(&format!("{marker} {message}"), out)
            }
            EngineEvent::HistoryRefreshRequested(_) => Ok(()),
            EngineEvent::HistoryReplaced { conversation, turns } => self.line(
                &format!(
                    "* loaded {turns} turn(s) of {} #{}",
                    conversation.session_id, conversation.conversation_id
                ),
                out,
            ),
        }
    }

    pub fn snapshot(&mut self, snapshot: &EngineSnapshot, out: &mut impl Write) -> io::Result<()> {
        self.line(
            &format!(
                "link: {} (generation {})",
                snapshot.state, snapshot.generation
            ),
            out,
        )?;
        let session = snapshot
            .session_id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        writeln!(out, "session: {session}")?;
        let conversation = |reference: Option<&parley_protocol::ConversationRef>| {
            reference
                .map(|conversation| {
                    format!("{} #{}", conversation.session_id, conversation.conversation_id)
                })
                .unwrap_or_else(|| "-".to_string())
        };
        writeln!(out, "desired: {}", conversation(snapshot.desired.as_ref()))?;
        writeln!(
            out,
            "bound: {}",
            conversation(snapshot.confirmed.as_ref().map(|binding| &binding.conversation))
        )?;
        if let Some(negotiation) = &snapshot.negotiation {
            let state = if negotiation.sent { "sent" } else { "held back" };
            writeln!(
                out,
                "resume: {} ({state})",
                conversation(Some(&negotiation.target))
            )?;
        }
        writeln!(
            out,
            "turns: {} ({})",
            snapshot.turns.len(),
            if snapshot.generating { "generating" } else { "idle" }
        )?;
        if snapshot.submission_gated {
            writeln!(out, "a message is waiting for the resume")?;
        }
        if let Some(model) = &snapshot.model {
            writeln!(out, "model: {model}")?;
        }
        if let Some(credits) = snapshot.credits {
            writeln!(out, "credits: {credits}")?;
        }
        Ok(())
    }

    /// Plain informational line outside the event stream.
    pub fn line(&mut self, text: &str, out: &mut impl Write) -> io::Result<()> {
        if self.mid_line {
            writeln!(out)?;
            self.mid_line = false;
        }
        writeln!(out, "{text}")
    }

    fn inline(&mut self, chunk: &str, out: &mut impl Write) -> io::Result<()> {
        write!(out, "{chunk}")?;
        self.mid_line = !chunk.ends_with('\n');
        out.flush()
    }
}

#[cfg(test)]
mod tests {
    use parley_session::TurnId;
    use pretty_assertions::assert_eq;

    use super::*;

    fn render(renderer: &mut Renderer, events: &[EngineEvent]) -> String {
        let mut out = Vec::new();
        for event in events {
            renderer.event(event, &mut out).unwrap();
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn deltas_stream_inline_and_close_the_line() {
        let turn = TurnId(1);
        let text = render(
            &mut Renderer::new(false),
            &[
                EngineEvent::TurnStarted(turn),
                EngineEvent::ThinkingDelta {
                    turn,
                    chunk: "hmm".to_string(),
                },
                EngineEvent::ResponseDelta {
                    turn,
                    chunk: "Hel".to_string(),
                },
                EngineEvent::ResponseDelta {
                    turn,
                    chunk: "lo".to_string(),
                },
                EngineEvent::TurnFinished {
                    turn,
                    status: TurnStatus::Completed,
                },
            ],
        );

        assert_eq!(text, "[turn-1]\nHello\n[turn-1 done]\n");
    }

    #[test]
    fn thinking_is_shown_on_request() {
        let text = render(
            &mut Renderer::new(true),
            &[EngineEvent::ThinkingDelta {
                turn: TurnId(2),
                chunk: "hmm".to_string(),
            }],
        );

        assert_eq!(text, "hmm");
    }

    #[test]
    fn notices_carry_their_level() {
        let text = render(
            &mut Renderer::default(),
            &[EngineEvent::Notice {
                level: NoticeLevel::Error,
                message: "insufficient credits".to_string(),
            }],
        );

        assert_eq!(text, "!! insufficient credits\n");
    }
}
