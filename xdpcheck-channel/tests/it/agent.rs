use std::{net::Ipv4Addr, time::Duration};

use bytes::Bytes;
use pnet::util::MacAddr;
use xdpcheck_channel::{AgentOptions, CaptureAgent, ChannelError, ChannelOptions, ControlChannel};
use xdpcheck_packet::{
    fixture::{build_packet, default_payload, Headers},
    MemoryLink,
};
use xdpcheck_wire::control::{CaptureFilter, ErrorCode, TransportProtocol};

fn frames(amount: usize, dst_port: u16) -> Vec<Bytes> {
    let headers = Headers {
        src_ether: MacAddr::new(2, 0, 0, 0, 0, 2),
        dst_ether: MacAddr::new(2, 0, 0, 0, 0, 1),
        src_ip: Ipv4Addr::new(192, 168, 1, 2).into(),
        dst_ip: Ipv4Addr::new(192, 168, 1, 1).into(),
        protocol: TransportProtocol::Udp,
        src_port: 50000,
        dst_port,
    };

    (0..amount)
        .map(|n| {
            let packet = build_packet(&headers, n as u32, default_payload(n).as_bytes()).unwrap();
            packet.data().clone()
        })
        .collect()
}

async fn spawn_agent(link: MemoryLink) -> ControlChannel {
    let options = AgentOptions::default().inject_gap(Duration::ZERO);
    let agent = CaptureAgent::bind("127.0.0.1:0", link, options).await.unwrap();
    let addr = agent.local_addr().unwrap();
    tokio::spawn(agent.run());

    ControlChannel::connect(addr, ChannelOptions::default()).await.unwrap()
}

fn pair() -> MemoryLink {
    let link = MemoryLink::new();
    link.connect("a_to_b", "b_to_a");
    link
}

#[tokio::test]
async fn injected_frames_are_captured_on_the_peer() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut channel = spawn_agent(pair()).await;
    let filter =
        CaptureFilter::any().protocol(TransportProtocol::Udp).src_port(50000).dst_port(60000);

    let local = channel.arm_capture("a_to_b", filter, Some(5)).await.unwrap();
    let remote = channel.arm_capture("b_to_a", filter, Some(5)).await.unwrap();

    let count = channel.inject("b_to_a", frames(5, 60000)).await.unwrap();
    assert_eq!(count, 5);
    // Filtered out by the destination port.
    channel.inject("b_to_a", frames(2, 60001)).await.unwrap();

    let collected = channel.collect_capture(local, Duration::from_secs(5)).await.unwrap();
    assert!(collected.complete);
    assert_eq!(collected.frames.len(), 5);
    let data = collected.frames.iter().map(|f| f.data.clone()).collect::<Vec<_>>();
    assert_eq!(data, frames(5, 60000));

    let collected = channel.collect_capture(remote, Duration::from_millis(50)).await.unwrap();
    assert!(!collected.complete);
    assert!(collected.frames.is_empty());
}

#[tokio::test]
async fn arming_twice_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut channel = spawn_agent(pair()).await;

    let handle = channel.arm_capture("a_to_b", CaptureFilter::any(), Some(1)).await.unwrap();
    let err = channel.arm_capture("a_to_b", CaptureFilter::any(), Some(1)).await.unwrap_err();
    assert!(err.is_already_armed(), "{err}");

    channel.inject("b_to_a", frames(1, 60000)).await.unwrap();
    let collected = channel.collect_capture(handle, Duration::from_secs(5)).await.unwrap();
    assert_eq!(collected.frames.len(), 1, "a frame must never be recorded twice");

    // Collecting released the interface.
    let handle = channel.arm_capture("a_to_b", CaptureFilter::any(), None).await.unwrap();
    channel.collect_capture(handle, Duration::ZERO).await.unwrap();
    assert!(!channel.is_lost());
}

#[tokio::test]
async fn agent_errors_keep_the_channel_usable() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut channel = spawn_agent(pair()).await;

    let err = channel.arm_capture("nope", CaptureFilter::any(), None).await.unwrap_err();
    assert!(matches!(err, ChannelError::Remote { code: ErrorCode::Interface, .. }));

    let err = channel.inject("nope", frames(1, 60000)).await.unwrap_err();
    assert!(matches!(err, ChannelError::Remote { code: ErrorCode::Interface, .. }));

    assert!(!channel.is_lost());
    channel.ping().await.unwrap();
    assert!(channel.stats().exchanges() >= 4);
}

#[tokio::test]
async fn captures_are_shared_between_connections() {
    let _ = tracing_subscriber::fmt::try_init();

    let agent = CaptureAgent::bind("127.0.0.1:0", pair(), AgentOptions::default()).await.unwrap();
    let addr = agent.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(agent.run_until(async move {
        let _ = rx.await;
    }));

    let mut first = ControlChannel::connect(addr, ChannelOptions::default()).await.unwrap();
    let mut second = ControlChannel::connect(addr, ChannelOptions::default()).await.unwrap();

    let _handle = first.arm_capture("a_to_b", CaptureFilter::any(), None).await.unwrap();
    let err = second.arm_capture("a_to_b", CaptureFilter::any(), None).await.unwrap_err();
    assert!(err.is_already_armed());

    tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn closing_a_connection_releases_its_captures() {
    let _ = tracing_subscriber::fmt::try_init();

    let options = AgentOptions::default().inject_gap(Duration::ZERO);
    let agent = CaptureAgent::bind("127.0.0.1:0", pair(), options).await.unwrap();
    let addr = agent.local_addr().unwrap();
    tokio::spawn(agent.run());

    let mut first = ControlChannel::connect(addr, ChannelOptions::default()).await.unwrap();
    first.arm_capture("b_to_a", CaptureFilter::any(), None).await.unwrap();
    drop(first);

    let mut second = ControlChannel::connect(addr, ChannelOptions::default()).await.unwrap();
    let mut handle = None;
    for _ in 0..50 {
        match second.arm_capture("b_to_a", CaptureFilter::any(), Some(1)).await {
            Ok(armed) => {
                handle = Some(armed);
                break;
            }
            Err(e) if e.is_already_armed() => tokio::time::sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    let handle = handle.expect("interface never released after its connection closed");

    second.inject("a_to_b", frames(1, 60000)).await.unwrap();
    let collected = second.collect_capture(handle, Duration::from_secs(5)).await.unwrap();
    assert!(collected.complete);
    assert_eq!(collected.frames.len(), 1);
}

#[tokio::test]
async fn concurrent_arms_of_one_interface_admit_one() {
    let _ = tracing_subscriber::fmt::try_init();

    let agent = CaptureAgent::bind("127.0.0.1:0", pair(), AgentOptions::default()).await.unwrap();
    let addr = agent.local_addr().unwrap();
    tokio::spawn(agent.run());

    let mut channels = Vec::new();
    for _ in 0..4 {
        channels.push(ControlChannel::connect(addr, ChannelOptions::default()).await.unwrap());
    }

    let arms = channels.iter_mut().map(|channel| async move {
        channel.arm_capture("a_to_b", CaptureFilter::any(), None).await
    });
    let results = futures::future::join_all(arms).await;

    let armed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(armed, 1, "{results:?}");
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(ChannelError::is_already_armed));
}

#[tokio::test]
async fn over_long_strings_never_reach_the_wire() {
    let _ = tracing_subscriber::fmt::try_init();

    let mut channel = spawn_agent(pair()).await;

    let err = channel.arm_capture(&"x".repeat(70_000), CaptureFilter::any(), None).await;
    assert!(matches!(err, Err(ChannelError::Encode(_))), "{err:?}");
    assert!(!channel.is_lost());

    // The request fits, the agent's error message naming the interface does not.
    let err = channel.arm_capture(&"\u{e9}".repeat(32_765), CaptureFilter::any(), None).await;
    assert!(matches!(err, Err(ChannelError::Remote { code: ErrorCode::Internal, .. })), "{err:?}");
    assert!(!channel.is_lost());
    channel.ping().await.unwrap();
}
