//! Best-effort side channels triggered by state transitions
//!
//! Cue playback, OS notifications, and clipboard writes must never block or
//! fail signaling, so every method here is infallible by signature and the
//! implementations swallow their own errors.

use tracing::trace;

/// Audible cue tied to a call lifecycle edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    /// Outbound ring-back while waiting for the callee
    Dialing,
    /// Inbound ringtone
    Ringing,
    /// Short chirp on connection
    Connected,
    /// Short chirp on teardown
    Ended,
}

/// Sink for user-facing feedback
pub trait FeedbackSink: Send + Sync {
    /// Start playing a cue (looping where the cue calls for it)
    fn play(&self, cue: Cue);

    /// Stop a playing cue; a no-op if it is not playing
    fn stop(&self, cue: Cue);

    /// Raise an OS-level notification
    fn notify(&self, title: &str, body: &str);

    /// Put an invite link on the clipboard
    fn copy_invite_link(&self, url: &str);
}

/// Sink that traces and discards everything
pub struct NullFeedback;

impl FeedbackSink for NullFeedback {
    fn play(&self, cue: Cue) {
        trace!(?cue, "feedback play");
    }

    fn stop(&self, cue: Cue) {
        trace!(?cue, "feedback stop");
    }

    fn notify(&self, title: &str, body: &str) {
        trace!(title, body, "feedback notify");
    }

    fn copy_invite_link(&self, url: &str) {
        trace!(url, "feedback copy invite link");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_accepts_everything() {
        let sink = NullFeedback;
        sink.play(Cue::Dialing);
        sink.stop(Cue::Dialing);
        sink.notify("Incoming call", "Alice");
        sink.copy_invite_link("https://example.test/room/r1");
    }
}
