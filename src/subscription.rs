use std::collections::BTreeSet;
use std::str::FromStr;

use strum_macros::{AsRefStr, EnumString};
use tokio::sync::mpsc;

use crate::command::Command;
use crate::frame::Frame;

/// Receives every array pushed by the server while a connection is in subscription mode.
///
/// The read loop waits for room in the channel before it decodes the next frame, so a slow
/// consumer stalls the whole connection.
pub type Sink = mpsc::Sender<Frame>;

/// Event tag carried in the first element of a pushed array.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum PushKind {
    Subscribe,
    Psubscribe,
    Unsubscribe,
    Punsubscribe,
    Message,
    Pmessage,
}

impl PushKind {
    /// Whether the event confirms a subscribe-class command rather than carrying a message.
    pub fn is_confirmation(self) -> bool {
        !matches!(self, PushKind::Message | PushKind::Pmessage)
    }

    /// Reads the event tag of a pushed array, if it carries a known one.
    pub fn of(frame: &Frame) -> Option<PushKind> {
        match frame {
            Frame::Array(Some(items)) => items
                .first()
                .and_then(Frame::as_str)
                .and_then(|kind| PushKind::from_str(kind).ok()),
            _ => None,
        }
    }
}

/// How many confirmations a subscribe-class command is answered with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Expect {
    Exactly(usize),
    /// `UNSUBSCRIBE` without arguments: one per subscribed channel, resolved when the read loop
    /// reaches it.
    AllChannels,
    /// `PUNSUBSCRIBE` without arguments.
    AllPatterns,
}

/// Classifies a subscribe-class command. Returns `None` for every other verb.
pub(crate) fn confirmations(command: &Command) -> Option<(PushKind, Expect)> {
    let kind = PushKind::from_str(&command.name()).ok()?;
    let names = command.len() - 1;

    let expect = match kind {
        PushKind::Message | PushKind::Pmessage => return None,
        PushKind::Unsubscribe if names == 0 => Expect::AllChannels,
        PushKind::Punsubscribe if names == 0 => Expect::AllPatterns,
        _ => Expect::Exactly(names),
    };

    Some((kind, expect))
}

/// Present while the connection is subscribed. Only the read loop mutates it.
#[derive(Debug)]
pub(crate) struct SubscriptionState {
    sink: Sink,
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
    // Confirmations still owed to the subscribe-class command being answered.
    awaiting: usize,
    // Subscription count reported by the latest confirmation.
    remaining: Option<i64>,
}

impl SubscriptionState {
    pub(crate) fn new(sink: Sink) -> SubscriptionState {
        SubscriptionState {
            sink,
            channels: BTreeSet::new(),
            patterns: BTreeSet::new(),
            awaiting: 0,
            remaining: None,
        }
    }

    pub(crate) fn awaiting(&self) -> usize {
        self.awaiting
    }

    /// Starts counting the confirmations of the next queued subscribe-class command.
    pub(crate) fn begin(&mut self, expect: Expect) {
        // The server always answers with at least one frame, an error if nothing else.
        self.awaiting = match expect {
            Expect::Exactly(n) => n.max(1),
            Expect::AllChannels => self.channels.len().max(1),
            Expect::AllPatterns => self.patterns.len().max(1),
        };
    }

    /// No subscription is left and no confirmation is outstanding for the current command.
    pub(crate) fn is_finished(&self) -> bool {
        self.awaiting == 0 && self.remaining == Some(0)
    }

    pub(crate) fn sink(&self) -> Sink {
        self.sink.clone()
    }

    /// Accounts for one pushed frame: confirmations update the tracked names and the outstanding
    /// count, an error reply ends the command being confirmed.
    pub(crate) fn observe(&mut self, frame: &Frame) {
        if let Frame::Error(_) = frame {
            self.awaiting = 0;
            return;
        }

        let Frame::Array(Some(items)) = frame else {
            return;
        };
        let Some(kind) = PushKind::of(frame).filter(|kind| kind.is_confirmation()) else {
            return;
        };

        let name = items.get(1).and_then(Frame::as_str).map(str::to_string);
        if let Some(Frame::Integer(count)) = items.get(2) {
            self.remaining = Some(*count);
        }
        self.awaiting = self.awaiting.saturating_sub(1);

        match (kind, name) {
            (PushKind::Subscribe, Some(name)) => {
                self.channels.insert(name);
            }
            (PushKind::Psubscribe, Some(name)) => {
                self.patterns.insert(name);
            }
            (PushKind::Unsubscribe, Some(name)) => {
                self.channels.remove(&name);
            }
            (PushKind::Punsubscribe, Some(name)) => {
                self.patterns.remove(&name);
            }
            _ => {}
        }

        if self.remaining == Some(0) {
            self.channels.clear();
            self.patterns.clear();
        }
    }

    /// Subscribed channel names followed by pattern names.
    pub(crate) fn names(&self) -> Vec<String> {
        self.channels
            .iter()
            .chain(self.patterns.iter())
            .cloned()
            .collect()
    }
}
