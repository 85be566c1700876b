use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use xdpcheck_channel::{AgentOptions, CaptureAgent, ChannelError, ChannelOptions, ControlChannel};
use xdpcheck_packet::MemoryLink;
use xdpcheck_wire::{
    control::{CaptureFilter, Response},
    frame::{Codec, Message},
};

/// An address nothing listens on.
fn closed_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn connect_gives_up_at_the_deadline() {
    let _ = tracing_subscriber::fmt::try_init();

    let options = ChannelOptions::default().connect_timeout(Duration::from_millis(300));
    let start = std::time::Instant::now();
    let err = ControlChannel::connect(closed_addr(), options).await.unwrap_err();

    assert!(matches!(err, ChannelError::Unavailable { .. }), "{err}");
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn connect_retries_until_the_agent_listens() {
    let _ = tracing_subscriber::fmt::try_init();

    let addr = closed_addr();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let agent =
            CaptureAgent::bind(addr, MemoryLink::new(), AgentOptions::default()).await.unwrap();
        agent.run().await.unwrap();
    });

    let options = ChannelOptions::default().connect_timeout(Duration::from_secs(5));
    let mut channel = ControlChannel::connect(addr, options).await.unwrap();

    assert_eq!(channel.peer_addr(), addr);
    channel.ping().await.unwrap();
}

#[tokio::test]
async fn dropped_connection_loses_the_channel() {
    let _ = tracing_subscriber::fmt::try_init();

    // Answers the initial ping, then hangs up.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, Codec::new());
        let ping = framed.next().await.unwrap().unwrap();
        framed.send(Message::new(ping.id(), Response::Pong.encode().unwrap())).await.unwrap();
    });

    let mut channel = ControlChannel::connect(addr, ChannelOptions::default()).await.unwrap();

    let err = channel.arm_capture("a_to_b", CaptureFilter::any(), None).await.unwrap_err();
    assert!(matches!(err, ChannelError::Lost { .. }), "{err}");
    assert!(channel.is_lost());

    // Never retried.
    let err = channel.ping().await.unwrap_err();
    assert!(matches!(err, ChannelError::Lost { .. }));
}

#[tokio::test]
async fn silent_agent_times_out() {
    let _ = tracing_subscriber::fmt::try_init();

    // Accepts, answers the ping, then never answers again.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, Codec::new());
        let ping = framed.next().await.unwrap().unwrap();
        framed.send(Message::new(ping.id(), Response::Pong.encode().unwrap())).await.unwrap();
        let _ = done_rx.await;
    });

    let options = ChannelOptions::default().request_timeout(Duration::from_millis(100));
    let mut channel = ControlChannel::connect(addr, options).await.unwrap();

    let err = channel.ping().await.unwrap_err();
    assert!(matches!(err, ChannelError::Lost { .. }), "{err}");
    drop(done_tx);
}
