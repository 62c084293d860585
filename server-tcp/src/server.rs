use crate::protocol::{Request, bridge_error, encode_reply, frame_codec};
use carbon::bus::EventBus;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Accepts connections forever, one task per client.
pub async fn serve(listener: TcpListener, bus: EventBus, reply_timeout: Duration) -> std::io::Result<()> {
    if let Ok(local) = listener.local_addr() {
        info!("TCP bridge listening on tcp://{}", local);
    }

    loop {
        let (socket, addr) = listener.accept().await?;
        let bus = bus.clone();
        tokio::spawn(async move {
            info!("Connection {addr} successful.");

            if let Err(err) = process_connection(socket, bus, reply_timeout).await {
                warn!("Connection {addr} error: {err:?}");
            }
        });
    }
}

/// Relays each frame onto the bus and writes the handler's reply back.
/// Requests on one connection are answered in order.
pub async fn process_connection(
    socket: TcpStream,
    bus: EventBus,
    reply_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    socket.set_nodelay(true).ok();

    let mut framed = Framed::new(socket, frame_codec());

    while let Some(frame_result) = framed.next().await {
        let frame = frame_result?;

        let request = match Request::decode(frame.freeze()) {
            Ok(req) => req,
            Err(e) => {
                error!("Failed to decode request: {}", e);
                framed.send(encode_reply(&bridge_error(e))).await?;
                continue;
            }
        };

        debug!("Relaying to '{}': {}", request.address, request.body);

        if !request.reply {
            if let Err(e) = bus.send(&request.address, request.body).await {
                warn!("Dropped message for '{}': {}", request.address, e);
            }
            continue;
        }

        let reply = match bus
            .request_timeout(&request.address, request.body, reply_timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => bridge_error(e.to_string()),
        };

        framed.send(encode_reply(&reply)).await?;
    }

    Ok(())
}
