//! End-to-end tests over real localhost UDP sockets, with a scripted target
//! emulator standing in for the hardware.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;

use ipbus_client::config::ClientConfig;
use ipbus_client::device_client::ErrorCode;
use ipbus_client::registry::ClientRegistry;
use ipbus_client::target::TargetAddr;

const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn fast_config() -> ClientConfig {
    ClientConfig {
        response_timeout: Duration::from_millis(200),
        status_attempts: 2,
    }
}

/// The three consecutive sockets of an emulated target.
struct TargetSockets {
    target: TargetAddr,
    control: UdpSocket,
    status: UdpSocket,
    resend: UdpSocket,
}

/// Bind a triple of consecutive localhost ports. Ephemeral ports cannot be
///  used here because the protocol fixes the status and resend ports
///  relative to the control port.
async fn bind_target() -> TargetSockets {
    for base in (42000u16..52000).step_by(23) {
        let control = match UdpSocket::bind((Ipv4Addr::LOCALHOST, base)).await {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        let status = match UdpSocket::bind((Ipv4Addr::LOCALHOST, base + 1)).await {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        let resend = match UdpSocket::bind((Ipv4Addr::LOCALHOST, base + 2)).await {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        return TargetSockets {
            target: TargetAddr::new(Ipv4Addr::LOCALHOST, base).unwrap(),
            control,
            status,
            resend,
        };
    }
    panic!("no free consecutive port triple on localhost");
}

/// A status reply reporting `next_expected_id`, as the hardware would send it.
fn status_reply(next_expected_id: u16) -> Vec<u8> {
    let mut reply = vec![0x20, 0x00, 0x00, 0xF1, 0, 0, 0, 0, 0, 0, 0, 4, 0x20];
    reply.extend_from_slice(&next_expected_id.to_be_bytes());
    reply.push(0xF0);
    reply
}

async fn answer_status_probe(status: &UdpSocket, next_expected_id: u16) {
    let mut buf = [0u8; 1024];
    let (n, from) = status.recv_from(&mut buf).await.unwrap();
    assert_eq!(n, 64);
    assert_eq!(&buf[..4], [0x20, 0x00, 0x00, 0xF1]);
    status.send_to(&status_reply(next_expected_id), from).await.unwrap();
}

#[tokio::test]
async fn test_round_trip_through_registry() {
    timeout(TEST_TIMEOUT, async {
        let sockets = bind_target().await;
        let target = sockets.target;

        let emulator = tokio::spawn(async move {
            // the first v2 exchange starts with a probe for the next id
            answer_status_probe(&sockets.status, 0x10).await;

            let mut buf = [0u8; 1024];
            let (n, from) = sockets.control.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..4], [0x20, 0x00, 0x10, 0xF0]);
            assert_eq!(&buf[4..n], [0x00, 0x00, 0x00, 0x01]);

            let mut reply = buf[..4].to_vec();
            reply.extend_from_slice(&[0xDE, 0xCA, 0xFB, 0xAD]);
            sockets.control.send_to(&reply, from).await.unwrap();
        });

        let registry = ClientRegistry::new(fast_config());
        let (reply_tx, reply_rx) = oneshot::channel();
        registry
            .enqueue(
                target,
                vec![0x20, 0x00, 0x05, 0xF0, 0x00, 0x00, 0x00, 0x01],
                reply_tx,
            )
            .await
            .unwrap();

        let response = reply_rx.await.unwrap();
        assert_eq!(response.target, target);
        assert_eq!(response.error_code, ErrorCode::Success);
        // the requester gets its own header back, followed by the reply body
        assert_eq!(
            response.payload,
            vec![0x20, 0x00, 0x05, 0xF0, 0xDE, 0xCA, 0xFB, 0xAD]
        );

        emulator.await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_lost_request_is_recovered() {
    timeout(TEST_TIMEOUT, async {
        let sockets = bind_target().await;
        let target = sockets.target;

        let emulator = tokio::spawn(async move {
            answer_status_probe(&sockets.status, 0x10).await;

            // swallow the first control packet: "request lost"
            let mut buf = [0u8; 1024];
            let (first_n, _) = sockets.control.recv_from(&mut buf).await.unwrap();
            let first = buf[..first_n].to_vec();

            // the client times out and probes again; we still expect its id
            answer_status_probe(&sockets.status, 0x10).await;

            // the identical packet arrives again; this time answer it
            let (n, from) = sockets.control.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], &first[..]);

            let mut reply = buf[..4].to_vec();
            reply.push(0x42);
            sockets.control.send_to(&reply, from).await.unwrap();
        });

        let client = ipbus_client::device_client::DeviceClient::start(target, fast_config())
            .await
            .unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        client
            .enqueue(vec![0x20, 0x00, 0x05, 0xF0, 0x07], reply_tx)
            .unwrap();

        let response = reply_rx.await.unwrap();
        assert_eq!(response.error_code, ErrorCode::Success);
        assert_eq!(response.payload, vec![0x20, 0x00, 0x05, 0xF0, 0x42]);

        emulator.await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_lost_reply_is_recovered() {
    timeout(TEST_TIMEOUT, async {
        let sockets = bind_target().await;
        let target = sockets.target;

        let emulator = tokio::spawn(async move {
            answer_status_probe(&sockets.status, 0x10).await;

            // consume the request but "lose" the reply
            let mut buf = [0u8; 1024];
            let (_, from) = sockets.control.recv_from(&mut buf).await.unwrap();
            let header = buf[..4].to_vec();
            assert_eq!(header, [0x20, 0x00, 0x10, 0xF0]);

            // the request was processed, so the next expected id moved on
            answer_status_probe(&sockets.status, 0x11).await;

            // the client asks the resend port for a retransmission
            let (n, _) = sockets.resend.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], [0xDE, 0xAD, 0xBE, 0xEF]);

            let mut reply = header;
            reply.push(0x42);
            sockets.control.send_to(&reply, from).await.unwrap();
        });

        let client = ipbus_client::device_client::DeviceClient::start(target, fast_config())
            .await
            .unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        client
            .enqueue(vec![0x20, 0x00, 0x05, 0xF0, 0x07], reply_tx)
            .unwrap();

        let response = reply_rx.await.unwrap();
        assert_eq!(response.error_code, ErrorCode::Success);
        assert_eq!(response.payload, vec![0x20, 0x00, 0x05, 0xF0, 0x42]);

        emulator.await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_unresponsive_target_reports_status_timeout() {
    timeout(TEST_TIMEOUT, async {
        let sockets = bind_target().await;
        let target = sockets.target;
        // the sockets stay bound but never answer anything

        let client = ipbus_client::device_client::DeviceClient::start(target, fast_config())
            .await
            .unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        client
            .enqueue(vec![0x20, 0x00, 0x05, 0xF0], reply_tx)
            .unwrap();

        // the id probe itself goes unanswered
        let response = reply_rx.await.unwrap();
        assert_eq!(response.error_code, ErrorCode::StatusTimeout);
        assert!(response.payload.is_empty());
    })
    .await
    .unwrap();
}
