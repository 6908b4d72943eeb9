use service::{DropReason, ServiceHandler, transport::PortId};

use crate::statistics::{Statistics, Stats};

/// Engine event observer: structured logging plus channel accounting.
#[derive(Clone)]
pub struct Observer {
    statistics: Statistics,
}

impl Observer {
    pub fn new(statistics: Statistics) -> Self {
        Self { statistics }
    }
}

impl ServiceHandler for Observer {
    fn on_bind(&self, channel: u16, port: PortId) {
        log::info!("bind: channel={}, port={}", channel, port);
    }

    fn on_listen(&self, channel: u16) {
        log::info!("listen: channel={}", channel);
    }

    fn on_connected(&self, channel: u16, remote_destid: u32, remote_ch: u16) {
        log::info!(
            "connected: channel={}, remote-destid={:#x}, remote-channel={}",
            channel,
            remote_destid,
            remote_ch
        );

        self.statistics.add(&Stats::Connected(1));
    }

    fn on_accepted(&self, parent: u16, channel: u16, remote_destid: u32) {
        log::info!(
            "accepted: listener={}, channel={}, remote-destid={:#x}",
            parent,
            channel,
            remote_destid
        );

        self.statistics.add(&Stats::Accepted(1));
    }

    fn on_close(&self, channel: u16) {
        log::info!("close: channel={}", channel);
        self.statistics.add(&Stats::Closed(1));
    }

    fn on_message_dropped(&self, channel: u16, reason: DropReason) {
        log::warn!("message dropped: channel={}, reason={:?}", channel, reason);
        self.statistics.add(&Stats::DroppedPkts(1));
    }
}
