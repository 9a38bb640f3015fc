//! End-to-end runs of the public API against loopback peers.

use std::sync::Arc;
use std::time::Duration;

use motionbridge::codec::{decode_telemetry, encode_telemetry};
use motionbridge::{
    BridgeConfig, ConnectionState, IdlePolicy, LinkId, MotionBridge, RobotTransportKind, StatusFlags, Telemetry,
    TracingSink,
};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UdpSocket};

const DEADLINE: Duration = Duration::from_secs(5);

fn three_axis_config(animation: String, robot: String) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.axis_count = 3;
    config.animation.address = animation;
    config.robot.address = robot;
    config.robot.bind_address = "127.0.0.1:0".into();
    config.robot.liveness = None;
    config.governor.idle_policy = IdlePolicy::Skip;
    config
}

#[tokio::test]
async fn move_command_reaches_udp_robot() {
    let tool = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let robot = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = three_axis_config(tool.local_addr().unwrap().to_string(), robot.local_addr().unwrap().to_string());

    let bridge = MotionBridge::connect(config, Arc::new(TracingSink)).unwrap();
    let session = bridge.session();

    let run = async {
        let (mut animation, _) = tool.accept().await.unwrap();
        session.wait_until(|s| s.robot.is_up()).await.unwrap();
        animation.write_all(b"move 10.0 20.0 30.0\n").await.unwrap();

        let mut buf = [0u8; 1024];
        let (len, _) = robot.recv_from(&mut buf).await.unwrap();
        // sequence | axis count | 3 x f64 | crc
        assert_eq!(len, 4 + 2 + 3 * 8 + 4);
        let packet = decode_telemetry(&buf[..len]).unwrap();
        assert_eq!(packet.sequence_echoed, 1);
        assert_eq!(packet.actual_axis_values, vec![10.0, 20.0, 30.0]);

        session.wait_until(|s| s.last_frame.is_some()).await.unwrap()
    };
    let state = tokio::time::timeout(DEADLINE, run).await.unwrap();

    let frame = state.last_frame.unwrap();
    assert_eq!(frame.sequence, 1);
    assert_eq!(frame.axis_values, vec![10.0, 20.0, 30.0]);
    assert_eq!(state.counters.frames_received, 1);
    assert_eq!(state.animation.state, ConnectionState::Connected);

    bridge.shutdown().await;
    assert_eq!(session.link_state(LinkId::Robot), ConnectionState::Disconnected);
}

#[tokio::test]
async fn tcp_robot_gets_length_prefixed_packets_and_acks_flow_back() {
    let tool = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let robot = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = three_axis_config(tool.local_addr().unwrap().to_string(), robot.local_addr().unwrap().to_string());
    config.robot.transport = RobotTransportKind::Tcp;
    config.echo_telemetry = true;

    let bridge = MotionBridge::connect(config, Arc::new(TracingSink)).unwrap();
    let session = bridge.session();

    let run = async {
        let (animation, _) = tool.accept().await.unwrap();
        let (mut controller, _) = robot.accept().await.unwrap();
        let mut animation = BufReader::new(animation);

        session.wait_until(|s| s.animation.is_up() && s.robot.is_up()).await.unwrap();
        animation.get_mut().write_all(b"pose 1.5 -2.5 0\n").await.unwrap();

        let len = controller.read_u32().await.unwrap() as usize;
        let mut packet = vec![0u8; len];
        controller.read_exact(&mut packet).await.unwrap();
        let commanded = decode_telemetry(&packet).unwrap();
        assert_eq!(commanded.actual_axis_values, vec![1.5, -2.5, 0.0]);
        session.wait_until(|s| s.last_frame.is_some()).await.unwrap();

        let reply = encode_telemetry(&Telemetry::new(
            commanded.sequence_echoed,
            vec![1.5, -2.5, 0.25],
            StatusFlags::new(StatusFlags::MOVING | StatusFlags::MOTORS_ON),
        ));
        controller.write_u32(reply.len() as u32).await.unwrap();
        controller.write_all(&reply).await.unwrap();

        let mut ack = String::new();
        animation.read_line(&mut ack).await.unwrap();
        assert_eq!(ack, "ack 1 12 1.5 -2.5 0.25\n");

        session.wait_until(|s| s.counters.acks_sent == 1).await.unwrap()
    };
    let state = tokio::time::timeout(DEADLINE, run).await.unwrap();

    assert_eq!(state.counters.telemetry_received, 1);
    assert_eq!(state.drift, Some(0.25));
    assert!(state.last_telemetry.unwrap().status_flags.has_flag(StatusFlags::MOVING));

    bridge.shutdown().await;
}

#[tokio::test]
async fn invalid_configuration_is_rejected_before_start() {
    let mut config = BridgeConfig::default();
    config.axis_count = 0;

    let err = MotionBridge::connect(config, Arc::new(TracingSink)).err().unwrap();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("axis_count"));
}
