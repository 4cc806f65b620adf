//! Channel configuration for the stats pipeline and master client

use boomer_protocol::client::MIN_OUTBOUND_BUFFER;

/// Buffer sizes for the bounded channels between workers, the stats
/// collector, the runner, and the master client.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Sample ingress buffer (workers -> stats collector), per channel.
    /// Saturation sheds samples instead of blocking workers.
    pub stats_buffer: usize,

    /// Report buffer (stats collector -> runner).
    pub report_buffer: usize,

    /// Control buffer (runner -> stats collector).
    pub control_buffer: usize,

    /// Outbound message buffer of the master client. Clamped up to
    /// [`MIN_OUTBOUND_BUFFER`] by the client.
    pub outbound_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            stats_buffer: 10_000,
            report_buffer: 16,
            control_buffer: 8,
            outbound_buffer: MIN_OUTBOUND_BUFFER,
        }
    }
}

impl ChannelConfig {
    /// Override the sample ingress buffer size.
    pub fn with_stats_buffer(mut self, size: usize) -> Self {
        self.stats_buffer = size;
        self
    }

    /// Override the outbound message buffer size.
    pub fn with_outbound_buffer(mut self, size: usize) -> Self {
        self.outbound_buffer = size;
        self
    }
}
