//! SCPI transport against a fake sink on a local TCP listener.
//!
//! The fake sink answers `*IDN?` and `MEAS:POW?` and stays silent for setters,
//! like the real device.

use load_bench::scpi::mock::MockScpiConnector;
use load_bench::scpi::{
    ScpiConnector, SinkController, TcpScpiConnector, NO_DATA_MSG, RESPONSE_TIMEOUT_MS, SCPI_PORT,
};
use load_bench::telemetry::TelemetrySample;
use load_bench::BenchError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WINDOW: Duration = Duration::from_millis(100);

#[derive(Clone, Copy)]
enum Peer {
    /// Answers queries, ignores setters
    Sink,
    /// Hangs up right after identifying
    HangUpAfterIdn,
}

struct FakeSink {
    port: u16,
    received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeSink {
    async fn spawn(peer: Peer) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);

        let task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                let (reader, mut writer) = socket.into_split();
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    log.lock().unwrap().push(line.clone());
                    match line.as_str() {
                        "*IDN?" => {
                            writer.write_all(b"Fake,Sink,0,1.0\n").await.unwrap();
                            if matches!(peer, Peer::HangUpAfterIdn) {
                                break;
                            }
                        }
                        "MEAS:POW?" => writer.write_all(b"1.5E+03\n").await.unwrap(),
                        _ => {}
                    }
                }
            }
        });

        Self {
            port,
            received,
            task,
        }
    }

    fn connector(&self) -> TcpScpiConnector {
        TcpScpiConnector::new(self.port, WINDOW)
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for FakeSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Link-level behavior
// =============================================================================

#[test]
fn test_default_connector_targets_raw_socket_port() {
    let connector = TcpScpiConnector::default();
    assert_eq!(connector.port(), SCPI_PORT);
    assert_eq!(
        connector.response_timeout(),
        Duration::from_millis(RESPONSE_TIMEOUT_MS)
    );

    let sink = TcpScpiConnector::new(15025, WINDOW);
    assert_eq!(sink.port(), 15025);
    assert_eq!(sink.response_timeout(), WINDOW);
}

#[tokio::test]
async fn test_open_identifies_peer() {
    let sink = FakeSink::spawn(Peer::Sink).await;
    let mut link = sink.connector().open("127.0.0.1").await.unwrap();
    link.close().await;

    assert_eq!(sink.received(), vec!["*IDN?"]);
}

#[tokio::test]
async fn test_silent_setter_is_successful_no_data() {
    let sink = FakeSink::spawn(Peer::Sink).await;
    let mut link = sink.connector().open("127.0.0.1").await.unwrap();

    let response = link.send("OUTP ON").await.unwrap();
    assert!(response.successful);
    assert_eq!(response.msg, NO_DATA_MSG);
    link.close().await;
}

#[tokio::test]
async fn test_query_returns_trimmed_data() {
    let sink = FakeSink::spawn(Peer::Sink).await;
    let mut link = sink.connector().open("127.0.0.1").await.unwrap();

    let response = link.send("MEAS:POW?").await.unwrap();
    assert!(response.successful);
    assert_eq!(response.msg, "1.5E+03");
    link.close().await;
}

#[tokio::test]
async fn test_peer_hang_up_is_an_error() {
    let sink = FakeSink::spawn(Peer::HangUpAfterIdn).await;
    let mut link = sink.connector().open("127.0.0.1").await.unwrap();

    let err = link.send("MEAS:POW?").await.unwrap_err();
    assert!(err.is_transport(), "unexpected error: {err}");
    link.close().await;
}

#[tokio::test]
async fn test_connection_refused() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = TcpScpiConnector::new(port, WINDOW).open("127.0.0.1").await;
    assert!(matches!(result, Err(BenchError::Connect { .. })));
}

#[tokio::test]
async fn test_blank_host_rejected_before_dialing() {
    let result = TcpScpiConnector::new(5025, WINDOW).open(" ").await;
    assert!(matches!(result, Err(BenchError::InvalidAddress(_))));
}

// =============================================================================
// Command set over TCP
// =============================================================================

#[tokio::test]
async fn test_voltage_priority_sequence_on_the_wire() {
    let sink = FakeSink::spawn(Peer::Sink).await;
    let (_tx, rx) = watch::channel(TelemetrySample::default());
    let controller = SinkController::new(Arc::new(sink.connector()), rx);

    controller
        .set_voltage_priority_mode("127.0.0.1", 692.0, -32.0)
        .await
        .unwrap();

    assert_eq!(
        sink.received(),
        vec![
            "*IDN?",
            "SOUR:FUNC VOLT",
            "SOUR:CURR:LIM:POS:IMM:AMPL 32",
            "SOUR:CURR:LIM:NEG:IMM:AMPL -32",
            "SOUR:VOLT:LEV:IMM:AMPL 692",
        ]
    );
}

#[tokio::test]
async fn test_sink_power_over_tcp() {
    let sink = FakeSink::spawn(Peer::Sink).await;
    let (_tx, rx) = watch::channel(TelemetrySample::default());
    let controller = SinkController::new(Arc::new(sink.connector()), rx);

    let reading = controller.sink_power("127.0.0.1").await.unwrap();
    assert!(reading.successful);
    assert_eq!(reading.watts(), Some(1500.0));
}

#[tokio::test]
async fn test_each_operation_uses_its_own_connection() {
    let mock = MockScpiConnector::new();
    let (_tx, rx) = watch::channel(TelemetrySample {
        voltage_v: 400,
        ..Default::default()
    });
    let controller = SinkController::new(Arc::new(mock.clone()), rx);

    controller.set_output("sink", true).await.unwrap();
    controller.set_current_setpoint("sink", 12.5).await.unwrap();
    controller.sink_power("sink").await.unwrap();

    assert_eq!(mock.opened(), 3);
    assert_eq!(mock.closed(), 3);
    assert_eq!(
        mock.sessions(),
        vec![
            vec!["*IDN?", "OUTP ON"],
            vec!["*IDN?", "SOUR:CURR 12.5"],
            vec!["*IDN?", "MEAS:POW?"],
        ]
    );
}
