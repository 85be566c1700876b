use std::time::Duration;

/// Statistics of a control channel, owned by the [`ControlChannel`](crate::ControlChannel).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChannelStats {
    /// Number of completed exchanges.
    exchanges: u64,
    /// Round-trip time of the latest exchange.
    last_rtt: Duration,
}

impl ChannelStats {
    #[inline]
    pub(crate) fn record(&mut self, rtt: Duration) {
        self.exchanges = self.exchanges.saturating_add(1);
        self.last_rtt = rtt;
    }

    #[inline]
    pub fn exchanges(&self) -> u64 {
        self.exchanges
    }

    #[inline]
    pub fn last_rtt(&self) -> Duration {
        self.last_rtt
    }
}
