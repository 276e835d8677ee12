//! Domain types shared by the stream state machine, the ingestors and the
//! broadcast pipeline.

use std::fmt;
use std::sync::Arc;

/// Lifecycle of the single upstream filtered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// No upstream connection is open.
    #[default]
    Stopped,
    /// The upstream connection is open and tweets are delivered.
    Running,
    /// The upstream connection is open but tweets are discarded.
    Paused,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Stopped => "stopped",
            StreamState::Running => "running",
            StreamState::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// A tweet as delivered by the upstream source.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tweet {
    pub id: String,
    pub text: String,
    /// Set by the upstream when the content may be sensitive. Only these
    /// tweets are sent to the sentiment scorer.
    pub possibly_sensitive: bool,
    pub author_screen_name: String,
}

impl Tweet {
    /// Canonical status URL, the input of the oEmbed renderer.
    pub fn status_url(&self) -> String {
        let author = if self.author_screen_name.is_empty() {
            "i/web"
        } else {
            self.author_screen_name.as_str()
        };
        format!("https://twitter.com/{}/status/{}", author, self.id)
    }
}

/// One message read from an open upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamMessage {
    Tweet(Tweet),
    /// Stall warning, e.g. the consumer is falling behind.
    Warning(String),
    /// The upstream announced it is closing the connection.
    Disconnect(String),
}

/// Kind of a lifecycle transition of the filtered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleKind {
    Started,
    Resumed,
    Paused,
    Stopped,
    /// Opening the connection failed; the state did not change.
    StartFailed,
}

/// Everything the filtered stream reports to its registered handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum RawStreamItem {
    /// A tweet that matches at least one track.
    Matching(Arc<Tweet>),
    /// A tweet delivered by the upstream that matches none of the tracks.
    NonMatching(Arc<Tweet>),
    Lifecycle {
        kind: LifecycleKind,
        detail: Option<String>,
    },
    Warning(String),
    Disconnect(String),
}

impl RawStreamItem {
    pub(crate) fn lifecycle(kind: LifecycleKind) -> Self {
        RawStreamItem::Lifecycle { kind, detail: None }
    }
}

/// Twitter track semantics: a track matches when every whitespace separated
/// term occurs in the text, compared case-insensitively.
pub fn track_matches(track: &str, text_lowercase: &str) -> bool {
    let mut terms = track.split_whitespace().peekable();
    if terms.peek().is_none() {
        return false;
    }
    terms.all(|term| text_lowercase.contains(&term.to_lowercase()))
}

/// True when the text matches any of the tracks.
pub fn matches_any<'a, I>(tracks: I, text: &str) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let lowered = text.to_lowercase();
    tracks.into_iter().any(|track| track_matches(track, &lowered))
}
