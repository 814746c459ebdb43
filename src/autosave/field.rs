use tracing::warn;

use super::SaveStatus;

pub type VersionNumber = u32;

/// Local version tracker for one field, with a single save in flight at a time.
///
/// The server keeps no version numbers. These only tell the engine *which* local
/// edit a save response belongs to, since the operator may already have typed
/// the next value while the previous one was on its way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldVersion {
    /// version of the value currently shown
    pub local: VersionNumber,
    /// last version the server confirmed
    pub saved: VersionNumber,
    /// version currently being saved
    pub sent: Option<VersionNumber>,
}

impl FieldVersion {
    pub fn touch(&mut self) {
        // An unsent dirty version absorbs further edits; anything already sent
        // or saved needs a fresh number so its response can be told apart.
        if !self.is_dirty() || self.sent == Some(self.local) {
            self.local += 1;
        }
    }

    pub fn mark_sent(&mut self) {
        self.sent = Some(self.local);
    }

    pub fn notify_saved(&mut self, saved_version: VersionNumber) {
        if saved_version <= self.saved {
            warn!("Out-of-order save notification {saved_version} (saved {})", self.saved);
            return;
        }
        self.saved = saved_version;
        if self.sent == Some(saved_version) {
            self.sent = None;
        }
    }

    pub fn settle_failed(&mut self) {
        self.sent = None;
    }

    /// Whether a response for `sent` still describes what the operator sees.
    pub fn is_current(&self, sent: VersionNumber) -> bool {
        self.local == sent
    }

    pub fn is_dirty(&self) -> bool {
        self.saved != self.local
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldState {
    pub value: Option<u32>,
    pub editing: bool,
    pub status: SaveStatus,
    pub version: FieldVersion,
    pub in_flight: bool,
    /// A save was requested while another one was in flight.
    pub resave: bool,
}
