//! Tokenizer for Twitch's chat-over-IRC line format.
//!
//! Inbound lines arrive in a handful of irregular shapes:
//!
//! ```text
//! @tag1=val1;tag2=val2 :user!user@user.tmi.twitch.tv TYPE params :body
//! :tmi.twitch.tv TYPE params
//! :jtv MODE #channel params
//! PING :tmi.twitch.tv
//! ```
//!
//! Each capture stage (segments, tags, command, user, type, params,
//! channel, body) is its own function so the two irregular cases, the
//! atomic `CAP * ACK` type and the `PING`/`PONG` short-circuit, stay
//! isolated and individually testable.

use std::collections::HashMap;

use crate::error::{ChatError, Result};
use crate::types::Message;

/// Separator between the tag/command section and the trailing free-text
/// body. The body may itself contain the separator, so segments after the
/// first are rejoined verbatim.
const TRAILING_SEP: &str = " :";

/// Control byte delimiting the wire encoding of a `/me` action message.
const ACTION_MARKER: char = '\u{1}';

const CAP_ACK: &str = "CAP * ACK";

/// Parses one raw protocol line into a [`Message`].
///
/// Pure function: no I/O, no state. Any line whose expected delimiters
/// cannot be located fails with [`ChatError::MalformedMessage`] carrying
/// the original text; the caller decides whether to skip or propagate.
pub fn parse(raw_line: &str) -> Result<Message> {
    let mut segments = split_segments(raw_line);
    let mut message = Message::empty(raw_line);

    let mut tags = HashMap::new();
    if segments.first().is_some_and(|s| s.starts_with('@')) {
        tags = parse_tags(segments.remove(0), raw_line)?;
    }

    let Some(&command) = segments.first() else {
        return Err(malformed(raw_line));
    };
    let command = command.strip_prefix(':').unwrap_or(command);
    segments.remove(0);

    // PING and PONG use a different wire format than everything else
    // Twitch sends; no field beyond the type is populated for them, tag
    // prefix or not.
    if command.starts_with("PING") || command.starts_with("PONG") {
        message.command_type = command[..4].to_string();
        return Ok(message);
    }

    message.tags = tags;
    message.user = parse_user(command);
    message.command_type = parse_type(command, raw_line)?;
    message.params = parse_params(command, &message.command_type);
    message.channel = parse_channel(&message.params);
    message.body = parse_body(&segments);

    Ok(message)
}

fn malformed(raw_line: &str) -> ChatError {
    ChatError::MalformedMessage {
        line: raw_line.to_string(),
    }
}

/// Segments stage: split on ` :`, dropping empty segments. The first
/// segment is the tag+command section; the rest belong to the body.
fn split_segments(raw_line: &str) -> Vec<&str> {
    raw_line
        .split(TRAILING_SEP)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Tags stage: `@key=value;key=value;...`. Pairs split on the first `=`
/// only, since values may themselves contain `=`. A pair with no `=` at
/// all is malformed.
fn parse_tags(block: &str, raw_line: &str) -> Result<HashMap<String, String>> {
    let block = block.strip_prefix('@').unwrap_or(block);
    let mut tags = HashMap::new();
    for pair in block.split(';') {
        let (key, value) = pair.split_once('=').ok_or_else(|| malformed(raw_line))?;
        tags.insert(key.to_string(), value.to_string());
    }
    Ok(tags)
}

/// User stage: everything before `tmi.twitch.tv`, truncated at the first
/// `!`. Server-origin lines (`jtv` or the bare hostname) carry no user.
fn parse_user(command: &str) -> Option<String> {
    if command.starts_with("jtv ") || command.starts_with("tmi.twitch.tv ") {
        return None;
    }
    let before_host = command.split("tmi.twitch.tv").next().unwrap_or(command);
    let nick = before_host.split('!').next().unwrap_or(before_host);
    Some(nick.to_string())
}

/// Type stage: the second whitespace-delimited token of the command line,
/// except the three-token `CAP * ACK` which is one atomic type value.
fn parse_type(command: &str, raw_line: &str) -> Result<String> {
    if command.contains(CAP_ACK) {
        return Ok(CAP_ACK.to_string());
    }
    command
        .split(' ')
        .nth(1)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed(raw_line))
}

/// Params stage: everything following the type token and one separating
/// space; empty when nothing follows.
fn parse_params(command: &str, command_type: &str) -> String {
    let Some(idx) = command.find(command_type) else {
        return String::new();
    };
    let after = &command[idx + command_type.len()..];
    after.strip_prefix(' ').unwrap_or(after).to_string()
}

/// Channel stage: the first `#`-prefixed token in `params`, running to the
/// next space or end of string.
fn parse_channel(params: &str) -> Option<String> {
    let start = params.find('#')? + 1;
    let rest = &params[start..];
    let end = rest.find(' ').unwrap_or(rest.len());
    Some(rest[..end].to_string())
}

/// Body stage: rejoin the remaining segments so a body containing ` :`
/// survives losslessly, then undo the action encoding if present.
fn parse_body(segments: &[&str]) -> String {
    if segments.is_empty() {
        return String::new();
    }
    let joined = segments.join(TRAILING_SEP);
    rewrite_action(&joined).unwrap_or(joined)
}

/// A `/me` message arrives as `<0x01>ACTION <text><0x01>`; rewrite it to
/// the `/me <text>` form the sender typed.
fn rewrite_action(body: &str) -> Option<String> {
    let rest = body.strip_prefix(ACTION_MARKER)?;
    let rest = rest.strip_prefix("ACTION")?;
    let rest = rest.strip_suffix(ACTION_MARKER).unwrap_or(rest);
    Some(format!("/me{rest}"))
}
