use std::sync::Arc;

use bytes::Bytes;
use codec::{ChanOp, Header};

use crate::{
    ServiceHandler,
    channel::{ConnReq, State},
    port::PortCtx,
    registry::Registry,
    transport::Transport,
};

/// Entry point of the serialized control worker: one handshake datagram at
/// a time, across every port.
pub(crate) fn process<T, H>(registry: &Registry<T>, handler: &H, port: Arc<PortCtx<T>>, bytes: Bytes)
where
    T: Transport,
    H: ServiceHandler,
{
    let header = match Header::decode(&bytes) {
        Ok(header) => header,
        Err(e) => {
            log::debug!("port {}: undecodable control datagram: {}", port.id(), e);
            return;
        }
    };

    match header.ch_op {
        ChanOp::ConnReq => conn_req(registry, port, &header),
        ChanOp::ConnAck => conn_ack(registry, handler, &header),
        ChanOp::ConnClose => conn_close(registry, handler, &header),
        ChanOp::Data => {
            // Data is routed by the dispatcher; seeing it here means a
            // misbehaving peer mixed the op into a control submission.
            log::debug!("port {}: data datagram on the control path", port.id());
        }
    }
}

/// A remote endpoint wants a channel to `dst_ch`. Parked on the listening
/// channel's accept queue; anything else about the target state means the
/// request is dropped and the requester times out.
fn conn_req<T: Transport>(registry: &Registry<T>, port: Arc<PortCtx<T>>, header: &Header) {
    let Some(channel) = registry.lookup(header.dst_ch) else {
        log::debug!(
            "CONN_REQ from destid {:#x} for unknown channel {}",
            header.src_destid,
            header.dst_ch
        );
        return;
    };

    let queued = channel.enqueue_conn_req(ConnReq {
        destid: header.src_destid,
        channel: header.src_ch,
        port,
    });

    if !queued {
        log::debug!(
            "CONN_REQ from destid {:#x}: channel {} is not listening",
            header.src_destid,
            header.dst_ch
        );
    }
}

/// The remote side accepted our CONN_REQ; its own channel number arrives in
/// `src_ch`.
fn conn_ack<T, H>(registry: &Registry<T>, handler: &H, header: &Header)
where
    T: Transport,
    H: ServiceHandler,
{
    let Some(channel) = registry.lookup(header.dst_ch) else {
        log::debug!("CONN_ACK for unknown channel {}", header.dst_ch);
        return;
    };

    if channel.complete_connect(header.src_ch) {
        handler.on_connected(channel.id(), header.src_destid, header.src_ch);
    } else {
        // The connector gave up (timeout or close) before the ack landed.
        log::debug!("stale CONN_ACK for channel {}", header.dst_ch);
    }
}

/// The remote endpoint hung up. The channel leaves the registry inside the
/// same registry critical section as the lookup, so a data message racing
/// the close finds nothing and is silently dropped.
fn conn_close<T, H>(registry: &Registry<T>, handler: &H, header: &Header)
where
    T: Transport,
    H: ServiceHandler,
{
    let Some(channel) = registry.unpublish(header.dst_ch) else {
        return;
    };

    channel.set_state(State::Disconnect);
    channel.shut_down(false);
    handler.on_close(channel.id());
}
