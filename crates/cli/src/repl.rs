//! Line grammar of the interactive prompt.
use parley_protocol::{Attachment, ConversationId, ConversationRef, RecordId, SessionId};
use snafu::{OptionExt, ResultExt};

use crate::error::{CliResult, InvalidIdSnafu, UsageSnafu};

pub const HELP: &str = "\
commands:
  <text>                      send a message (pending attachments ride along)
  /select <session> <conv>    resume a persisted conversation
  /new                        start a fresh conversation
  /edit <record> <text>       replace an earlier message and regenerate from there
  /attach <filename> <url>    attach an uploaded file to the next message
  /model <id>                 switch model and remember it
  /models                     list available models
  /threads                    list persisted conversations
  /delete <session> <conv>    delete a persisted conversation
  /share                      publish the current conversation read-only
  /open <share-id>            print a shared conversation
  /pause                      stop the response in flight
  /reconnect                  force a fresh connection
  /status                     show connection and binding state
  /quit                       leave";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand {
    Say(String),
    Select(ConversationRef),
    New,
    Edit { record_id: RecordId, text: String },
    Attach(Attachment),
    Model(String),
    Models,
    Threads,
    Delete(ConversationRef),
    Share,
    OpenShare(String),
    Pause,
    Reconnect,
    Status,
    Help,
    Quit,
}

/// `Ok(None)` for blank lines.
pub fn parse(line: &str) -> CliResult<Option<ReplCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(ReplCommand::Say(line.to_string())));
    };

    let (name, args) = rest
        .split_once(char::is_whitespace)
        .map(|(name, args)| (name, args.trim()))
        .unwrap_or((rest, ""));

    let command = match name {
        "select" => ReplCommand::Select(conversation_arg(args, "/select <session> <conv>")?),
        "new" => ReplCommand::New,
        "edit" => {
            let (record, text) = two_args(args, "/edit <record> <text>")?;
            ReplCommand::Edit {
                record_id: RecordId::parse(record).context(InvalidIdSnafu {
                    stage: "parse-edit-record",
                })?,
                text: text.to_string(),
            }
        }
        "attach" => {
            let (filename, url) = two_args(args, "/attach <filename> <url>")?;
            ReplCommand::Attach(Attachment::new(filename, url))
        }
        "model" => ReplCommand::Model(one_arg(args, "/model <id>")?.to_string()),
        "models" => ReplCommand::Models,
        "threads" => ReplCommand::Threads,
        "delete" => ReplCommand::Delete(conversation_arg(args, "/delete <session> <conv>")?),
        "share" => ReplCommand::Share,
        "open" => ReplCommand::OpenShare(one_arg(args, "/open <share-id>")?.to_string()),
        "pause" => ReplCommand::Pause,
        "reconnect" => ReplCommand::Reconnect,
        "status" => ReplCommand::Status,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" => ReplCommand::Quit,
        _ => {
            return UsageSnafu {
                stage: "parse-command",
                usage: "unknown command, try /help",
            }
            .fail();
        }
    };
    Ok(Some(command))
}

fn one_arg<'a>(args: &'a str, usage: &'static str) -> CliResult<&'a str> {
    Some(args)
        .filter(|args| !args.is_empty() && !args.contains(char::is_whitespace))
        .context(UsageSnafu {
            stage: "parse-arguments",
            usage,
        })
}

/// First word, then the untouched remainder.
fn two_args<'a>(args: &'a str, usage: &'static str) -> CliResult<(&'a str, &'a str)> {
    args.split_once(char::is_whitespace)
        .map(|(first, rest)| (first, rest.trim()))
        .filter(|(_, rest)| !rest.is_empty())
        .context(UsageSnafu {
            stage: "parse-arguments",
            usage,
        })
}

fn conversation_arg(args: &str, usage: &'static str) -> CliResult<ConversationRef> {
    let (session, conversation) = two_args(args, usage)?;
    let session_id = SessionId::parse(session).context(InvalidIdSnafu {
        stage: "parse-session-id",
    })?;
    let conversation_id = ConversationId::parse(conversation).context(InvalidIdSnafu {
        stage: "parse-conversation-id",
    })?;
    Ok(ConversationRef::new(session_id, conversation_id))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::CliError;

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            parse("  hello there ").unwrap(),
            Some(ReplCommand::Say("hello there".to_string()))
        );
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn select_parses_both_ids() {
        assert_eq!(
            parse("/select S0 7").unwrap(),
            Some(ReplCommand::Select(ConversationRef::new(
                SessionId::parse("S0").unwrap(),
                ConversationId::new(7)
            )))
        );
    }

    #[test]
    fn edit_keeps_the_whole_replacement_text() {
        assert_eq!(
            parse("/edit 42 what about   tomorrow?").unwrap(),
            Some(ReplCommand::Edit {
                record_id: RecordId::new(42),
                text: "what about   tomorrow?".to_string(),
            })
        );
    }

    #[test]
    fn malformed_arguments_report_usage() {
        assert!(matches!(
            parse("/select S0").unwrap_err(),
            CliError::Usage { usage: "/select <session> <conv>", .. }
        ));
        assert!(matches!(
            parse("/edit abc new text").unwrap_err(),
            CliError::InvalidId { .. }
        ));
        assert!(matches!(parse("/model").unwrap_err(), CliError::Usage { .. }));
        assert!(matches!(parse("/bogus").unwrap_err(), CliError::Usage { .. }));
    }
}
