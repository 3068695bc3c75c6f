//! Modem Lifecycle Integration Tests
//!
//! Runs the service against scripted fake modems:
//! - AT modem over TCP: init, activation, network deactivation, shutdown
//! - QMI modem over an in-memory stream: keyed activation and stop
//! - Configuration files loaded from disk

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use modem_protocols::qmi::{encode_service_frame, result_tlv, service, wds, MessageKind, Tlv};
use modemsrv::core::config::{
    DataContextConfig, ModemConfig, PdpType, ProtocolKind, QmiClientConfig, TransportConfig,
};
use modemsrv::core::registry::{Launch, ModemDriver, QmiDriver};
use modemsrv::facade::{DataContextRequest, DeactivationReason, NotifyHook};
use modemsrv::{DriverRegistry, GprsError, ModemEvent, ModemService, ModemsrvConfig};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn recorder() -> (NotifyHook, Arc<Mutex<Vec<ModemEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    (Arc::new(move |event| sink.lock().push(event)), events)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn data_context(cid: u8) -> Option<DataContextConfig> {
    Some(DataContextConfig {
        cid,
        apn: "internet".to_string(),
        pdp_type: PdpType::Ip,
        auto_activate: false,
    })
}

// ============================================================================
// AT Modem
// ============================================================================

/// Scripted AT modem: answers each expected command with its reply
async fn at_modem<S>(stream: S, script: Vec<(&'static str, &'static str)>) -> S
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut device = BufReader::new(stream);
    for (expected, reply) in script {
        let mut raw = Vec::new();
        device.read_until(b'\r', &mut raw).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&raw).trim(), expected);
        device.write_all(reply.as_bytes()).await.unwrap();
    }
    device.into_inner()
}

#[tokio::test]
async fn test_at_modem_activation_and_revocation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let modem = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        at_modem(
            stream,
            vec![
                ("ATE0", "ATE0\r\r\nOK\r\n"),
                ("AT+CMEE=1", "\r\nOK\r\n"),
                ("AT+CGDCONT=1,\"IP\",\"internet\"", "\r\nOK\r\n"),
                ("AT+CGACT=1,1", "\r\nOK\r\n"),
                (
                    "AT+CGCONTRDP=1",
                    "\r\n+CGCONTRDP: 1,5,\"internet\",\"10.64.0.7.255.255.255.0\",\"10.64.0.1\",\"9.9.9.9\"\r\n\r\nOK\r\n",
                ),
            ],
        )
        .await
    });

    let config = ModemsrvConfig {
        modems: vec![ModemConfig {
            name: "lab".to_string(),
            protocol: ProtocolKind::At,
            transport: TransportConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            max_in_flight: 1,
            qmi: QmiClientConfig::default(),
            data_context: data_context(1),
        }],
        ..Default::default()
    };

    let (hook, events) = recorder();
    let service = ModemService::start(&config, &DriverRegistry::with_defaults(), hook)
        .await
        .unwrap();
    let gprs = service.data_context("lab").unwrap();

    let active = gprs
        .activate_and_wait(DataContextRequest::new(1, "internet"))
        .await
        .unwrap();
    assert_eq!(active.settings.address, Some("10.64.0.7".parse().unwrap()));
    assert_eq!(active.settings.dns, vec!["9.9.9.9".parse::<std::net::IpAddr>().unwrap()]);

    // Network tears the context down
    let mut stream = modem.await.unwrap();
    stream.write_all(b"\r\n+CGEV: NW PDN DEACT 1\r\n").await.unwrap();
    eventually(|| gprs.active_context().is_none()).await;

    let recorded = events.lock().clone();
    assert!(recorded.contains(&ModemEvent::ContextDeactivated {
        modem: "lab".to_string(),
        cid: 1,
        reason: DeactivationReason::Network,
    }));
    assert!(recorded
        .iter()
        .any(|e| matches!(e, ModemEvent::Indication { summary, .. } if summary.starts_with("+CGEV:"))));

    assert_eq!(gprs.deactivate_and_wait(1).await, Err(GprsError::NotActive(1)));

    let stopped = service.shutdown().await;
    assert_eq!(stopped[0].1.completed, 5);
    assert_eq!(stopped[0].1.closed, 0);
}

#[tokio::test]
async fn test_shutdown_fails_pending_activation() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Answers the init commands, then stays silent
    let modem = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut stream = at_modem(stream, vec![("ATE0", "\r\nOK\r\n"), ("AT+CMEE=1", "\r\nOK\r\n")]).await;
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
        rest
    });

    let config = ModemsrvConfig {
        modems: vec![ModemConfig {
            name: "silent".to_string(),
            protocol: ProtocolKind::At,
            transport: TransportConfig::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            },
            max_in_flight: 1,
            qmi: QmiClientConfig::default(),
            data_context: data_context(2),
        }],
        ..Default::default()
    };

    let (hook, _) = recorder();
    let service = ModemService::start(&config, &DriverRegistry::with_defaults(), hook)
        .await
        .unwrap();
    let gprs = service.data_context("silent").unwrap();

    let activation = {
        let gprs = gprs.clone();
        tokio::spawn(async move { gprs.activate_and_wait(DataContextRequest::new(2, "internet")).await })
    };

    // Give the define command time to reach the modem
    tokio::time::sleep(Duration::from_millis(50)).await;
    let token = service.token();
    service.shutdown().await;
    assert!(token.is_cancelled());

    assert_eq!(activation.await.unwrap(), Err(GprsError::ChannelClosed));
    let rest = String::from_utf8(modem.await.unwrap()).unwrap();
    assert!(rest.starts_with("AT+CGDCONT=2,\"IP\",\"internet\"\r"));
}

// ============================================================================
// QMI Modem
// ============================================================================

const WDS_CLIENT: u8 = 4;

/// Read one QMUX frame; returns (transaction id, message id)
async fn read_qmux<R: AsyncReadExt + Unpin>(reader: &mut R) -> (u16, u16) {
    let mut header = [0u8; 3];
    reader.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x01);
    let length = usize::from(u16::from_le_bytes([header[1], header[2]]));
    let mut rest = vec![0u8; length - 2];
    reader.read_exact(&mut rest).await.unwrap();
    // rest: flags, service, client, sdu flags, tid (2), message id (2), ...
    assert_eq!(rest[1], service::WDS);
    assert_eq!(rest[2], WDS_CLIENT);
    (
        u16::from_le_bytes([rest[4], rest[5]]),
        u16::from_le_bytes([rest[6], rest[7]]),
    )
}

#[tokio::test]
async fn test_qmi_modem_activation_and_stop() {
    let (device, host) = tokio::io::duplex(4096);
    let config = ModemConfig {
        name: "wwan1".to_string(),
        protocol: ProtocolKind::Qmi,
        transport: TransportConfig::Unix {
            path: "/dev/null".into(),
        },
        max_in_flight: 4,
        qmi: QmiClientConfig {
            wds_client_id: Some(WDS_CLIENT),
        },
        data_context: data_context(1),
    };

    let modem = tokio::spawn(async move {
        let mut device = device;
        let mut seen = Vec::new();
        for _ in 0..4 {
            let (tid, message_id) = read_qmux(&mut device).await;
            seen.push(message_id);
            let mut tlvs = vec![result_tlv(0, 0)];
            match message_id {
                wds::START_NETWORK_INTERFACE => tlvs.push(Tlv::u32(wds::TLV_PACKET_DATA_HANDLE, 0xBEEF)),
                wds::GET_CURRENT_SETTINGS => tlvs.push(Tlv::u32(wds::TLV_IPV4_ADDRESS, 0xC0A8_0102)),
                _ => {},
            }
            let reply = encode_service_frame(service::WDS, WDS_CLIENT, MessageKind::Response, tid, message_id, &tlvs);
            device.write_all(&reply).await.unwrap();
        }
        seen
    });

    let (hook, events) = recorder();
    let token = CancellationToken::new();
    let instance = QmiDriver
        .launch(Launch {
            id: 7,
            modem: &config,
            io: Box::new(host),
            notify: hook,
            token: token.clone(),
        })
        .unwrap();
    let gprs = instance.data_context.clone().unwrap();

    let active = gprs
        .activate_and_wait(DataContextRequest::new(1, "internet"))
        .await
        .unwrap();
    assert_eq!(active.packet_data_handle, Some(0xBEEF));
    assert_eq!(active.settings.address, Some("192.168.1.2".parse().unwrap()));

    gprs.deactivate_and_wait(1).await.unwrap();
    assert!(gprs.active_context().is_none());

    assert_eq!(
        modem.await.unwrap(),
        vec![
            wds::MODIFY_PROFILE,
            wds::START_NETWORK_INTERFACE,
            wds::GET_CURRENT_SETTINGS,
            wds::STOP_NETWORK_INTERFACE,
        ]
    );
    assert!(matches!(
        events.lock().last(),
        Some(ModemEvent::ContextDeactivated {
            reason: DeactivationReason::Local,
            ..
        })
    ));

    token.cancel();
    assert_eq!(instance.task.await.unwrap().completed, 4);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_yaml_configuration_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    write!(
        file,
        r#"
service:
  name: modemsrv-lab
  log_level: debug
modems:
  - name: wwan0
    protocol: qmi
    transport:
      type: serial
      device: /dev/cdc-wdm0
    qmi:
      wds_client_id: 3
    data_context:
      cid: 1
      apn: internet
      pdp_type: IPV4V6
      auto_activate: true
"#
    )
    .unwrap();

    let config = ModemsrvConfig::load_from_file(file.path()).unwrap();
    config.validate().unwrap();

    let modem = config.modem("wwan0").unwrap();
    assert_eq!(modem.protocol, ProtocolKind::Qmi);
    assert_eq!(modem.qmi.wds_client_id, Some(3));
    assert_eq!(
        modem.transport,
        TransportConfig::Serial {
            device: "/dev/cdc-wdm0".to_string(),
            baud_rate: 115_200,
        }
    );
    let context = modem.data_context.as_ref().unwrap();
    assert_eq!(context.pdp_type, PdpType::Ipv4v6);
    assert!(context.auto_activate);
    assert_eq!(config.service.name, "modemsrv-lab");
}

#[test]
fn test_mbim_data_context_rejected() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    write!(
        file,
        r#"
[[modems]]
name = "mbim0"
protocol = "mbim"
transport = {{ type = "unix", path = "/run/mbim.sock" }}
data_context = {{ cid = 1, apn = "internet" }}
"#
    )
    .unwrap();

    let config = ModemsrvConfig::load_from_file(file.path()).unwrap();
    assert!(config.validate().is_err());
}
