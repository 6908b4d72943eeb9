pub mod config;
pub mod observer;
pub mod statistics;

use std::{sync::Arc, time::Duration};

use self::{config::Config, observer::Observer, statistics::Statistics};

use service::{Service, ServiceOptions, transport::Transport};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "chanmux.",
    env!("CARGO_PKG_VERSION")
);

/// Assemble the channel engine from a configuration and a mailbox
/// transport.
///
/// The caller (the character-device adaptor, or an integration test) keeps
/// driving the engine afterwards: lifecycle events go to `add_port`/
/// `add_peer` and friends, channel operations to the `channel_*` calls.
pub fn startup<T>(config: Arc<Config>, transport: T) -> anyhow::Result<Service<T, Observer>>
where
    T: Transport,
{
    let statistics = Statistics::default();
    let service = Service::new(
        ServiceOptions {
            mbox: config.mailbox.number,
            tx_ring_size: config.rings.tx,
            rx_ring_size: config.rings.rx,
            dynamic_range: config.channel.dynamic_range,
            connect_timeout: Duration::from_millis(config.timeouts.connect_ms),
        },
        transport,
        Observer::new(statistics),
    );

    log::info!("{} engine started, mailbox={}", SOFTWARE, config.mailbox.number);

    Ok(service)
}
