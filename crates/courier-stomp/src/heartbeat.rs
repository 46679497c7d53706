//! `heart-beat` header negotiation.
//!
//! The header carries `<cx>,<cy>` in milliseconds: the sender of the header
//! promises to emit traffic at least every `cx` and wants the peer to emit
//! traffic every `cy`. `0` disables the respective direction.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use courier_core::constants::GRACE_PERIOD_FACTOR;

use crate::errors::StompError;

/// A parsed `heart-beat` header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// Interval (ms) the header's sender promises to send at. `0` means never.
    pub cx: u64,
    /// Interval (ms) the header's sender wants to receive at. `0` means never.
    pub cy: u64,
}

impl HeartBeat {
    /// Create a pair from raw millisecond values.
    pub fn new(cx: u64, cy: u64) -> Self {
        Self { cx, cy }
    }

    /// The pair a client advertises at CONNECT.
    ///
    /// The promised outgoing interval is widened and the requested incoming
    /// interval narrowed by [`GRACE_PERIOD_FACTOR`], so that a peer running
    /// exactly on schedule never trips the other side's deadline.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn for_client(outgoing_ms: u64, incoming_ms: u64) -> Self {
        let cx = (outgoing_ms as f64 * (1.0 + GRACE_PERIOD_FACTOR)).round() as u64;
        let cy = (incoming_ms as f64 * (1.0 - GRACE_PERIOD_FACTOR)).round() as u64;
        Self { cx, cy }
    }

    /// The pair a server answers with in CONNECTED for a client's `self`.
    ///
    /// The server sends as often as the client asked and expects what the
    /// client promised.
    pub fn server_reply(self) -> Self {
        Self {
            cx: self.cy,
            cy: self.cx,
        }
    }

    /// How often the header's sender will emit heart-beats.
    pub fn send_interval(self) -> Option<Duration> {
        (self.cx > 0).then(|| Duration::from_millis(self.cx))
    }

    /// How long the header's sender tolerates silence from its peer.
    pub fn receive_interval(self) -> Option<Duration> {
        (self.cy > 0).then(|| Duration::from_millis(self.cy))
    }
}

impl FromStr for HeartBeat {
    type Err = StompError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StompError::InvalidHeartBeat(s.to_owned());
        let (cx, cy) = s.split_once(',').ok_or_else(invalid)?;
        let cx = cx.trim().parse().map_err(|_| invalid())?;
        let cy = cy.trim().parse().map_err(|_| invalid())?;
        Ok(Self { cx, cy })
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.cx, self.cy)
    }
}
