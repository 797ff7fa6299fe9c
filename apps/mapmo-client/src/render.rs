//! Line-oriented terminal front end. Every [`UiUpdate`] becomes at most one
//! printed entry; countdown ticks only print when the minute changes or the
//! timer is in its urgent window.

use std::io::{self, Write};
use std::sync::Mutex;

use mapmo_proto::rest::MAX_INTERESTS;

use crate::connection::{ConnectionState, TerminalReason};
use crate::countdown::{CountdownDisplay, Urgency};
use crate::ui::{NoticeLevel, RenderedMessage, Screen, UiSink, UiUpdate};

pub struct TerminalUi<W = io::Stdout> {
    out: Mutex<Output<W>>,
}

struct Output<W> {
    writer: W,
    last_countdown: Option<CountdownDisplay>,
    partner_typing: bool,
    /// The pending line was already printed; skip the confirmed copy.
    echo_confirmed: bool,
}

impl TerminalUi<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalUi<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: Mutex::new(Output {
                writer,
                last_countdown: None,
                partner_typing: false,
                echo_confirmed: false,
            }),
        }
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out.writer,
            Err(poisoned) => poisoned.into_inner().writer,
        }
    }
}

impl<W: Write + Send> UiSink for TerminalUi<W> {
    fn apply(&self, update: UiUpdate) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(line) = out.line_for(update) else {
            return;
        };
        // Write errors, e.g. a closed stdout, are ignored.
        let _ = writeln!(out.writer, "{line}");
        let _ = out.writer.flush();
    }
}

impl<W> Output<W> {
    fn line_for(&mut self, update: UiUpdate) -> Option<String> {
        match update {
            UiUpdate::Screen(screen) => {
                self.last_countdown = None;
                self.partner_typing = false;
                Some(screen_line(&screen))
            }
            UiUpdate::Connection(state) => connection_line(state),
            UiUpdate::MessageRendered(message) => {
                if message.own && !message.pending && std::mem::take(&mut self.echo_confirmed) {
                    return None;
                }
                Some(message_line(&message))
            }
            UiUpdate::MessageRetracted(_) => {
                self.echo_confirmed = true;
                None
            }
            UiUpdate::PartnerTyping(typing) => {
                if typing == self.partner_typing {
                    return None;
                }
                self.partner_typing = typing;
                typing.then(|| "… partner is typing".to_string())
            }
            UiUpdate::Keep(keep) => Some(if keep.both {
                "[keep] both kept, the timer is stopped".to_string()
            } else {
                format!(
                    "[keep] you: {} / partner: {}",
                    yes_no(keep.mine),
                    yes_no(keep.partner)
                )
            }),
            UiUpdate::Countdown(display) => self.countdown_line(display),
            UiUpdate::SearchingCount(count) => {
                count.map(|count| format!("[search] {count} people searching"))
            }
            UiUpdate::Profile(profile) => Some(format!(
                "[profile] {} (#{}): {}",
                profile.username,
                profile.id,
                profile.nickname.as_deref().unwrap_or("no nickname yet")
            )),
            UiUpdate::ProfileOptions(options) => Some(format!(
                "[profile] goals: {}\n[profile] interests (up to {MAX_INTERESTS}): {}",
                options.goals.join(" | "),
                options.interests.join(" | ")
            )),
            UiUpdate::Notice(notice) => Some(match notice.level {
                NoticeLevel::Success => format!("[ok] {}", notice.text),
                NoticeLevel::Error => format!("[error] {}", notice.text),
                NoticeLevel::Fatal => format!("[fatal] {}", notice.text),
            }),
            UiUpdate::ConversationEnded {
                redirect_url,
                reason,
            } => Some(match reason {
                Some(reason) => format!("[ended] {reason} (back to {redirect_url})"),
                None => format!("[ended] conversation over (back to {redirect_url})"),
            }),
        }
    }

    fn countdown_line(&mut self, display: CountdownDisplay) -> Option<String> {
        let previous = self.last_countdown.replace(display);
        let print = match (previous, display) {
            (_, CountdownDisplay::Connected) => previous != Some(display),
            (_, CountdownDisplay::Remaining { urgency, .. }) if urgency != Urgency::Normal => {
                previous != Some(display)
            }
            (
                Some(CountdownDisplay::Remaining { seconds: before, .. }),
                CountdownDisplay::Remaining { seconds, .. },
            ) => before / 60 != seconds / 60 || seconds > before,
            (_, CountdownDisplay::Remaining { .. }) => true,
        };
        if !print {
            return None;
        }
        Some(match display {
            CountdownDisplay::Connected => "[timer] connected for good".to_string(),
            CountdownDisplay::Remaining { urgency, .. } => match urgency {
                Urgency::Danger => format!("[timer] {display} !!"),
                Urgency::Warning => format!("[timer] {display} !"),
                Urgency::Normal => format!("[timer] {display}"),
            },
        })
    }
}

fn screen_line(screen: &Screen) -> String {
    match screen {
        Screen::Login => "== login: /login <username> or /register <username> ==".to_string(),
        Screen::ProfileSetup => {
            "== profile: /profile options, then /profile set nickname=...; dob=YYYY-MM-DD; gender=...; preference=...; goal=...; interests=a, b ==".to_string()
        }
        Screen::Lobby => "== lobby: /search [chat|voice], /logout, /quit ==".to_string(),
        Screen::Searching(kind) => format!("== searching ({kind:?}), /cancel to stop =="),
        Screen::Chat {
            conversation_id,
            partner,
        } => {
            let name = partner
                .as_ref()
                .and_then(|partner| partner.nickname.clone())
                .unwrap_or_else(|| "a stranger".to_string());
            format!("== chatting with {name} (#{conversation_id}): /keep, /end ==")
        }
    }
}

fn connection_line(state: ConnectionState) -> Option<String> {
    match state {
        ConnectionState::Idle | ConnectionState::Connecting => None,
        ConnectionState::Open => Some("[link] connected".to_string()),
        ConnectionState::Reconnecting => Some("[link] reconnecting…".to_string()),
        ConnectionState::Closed(TerminalReason::GaveUp) => Some("[link] offline".to_string()),
        ConnectionState::Closed(_) => None,
    }
}

fn message_line(message: &RenderedMessage) -> String {
    let time = message.created_at.format("%H:%M");
    let who = if message.own { "you" } else { "them" };
    format!("{time} {who}: {}", message.content)
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}
