use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use peripage::{
    ConnectionError, ErrorKind, FakeBackendConfig, FakeBleAdapter, FakeDeviceProbe,
    PrinterConfig, PrinterError, PrinterSession, SessionError, SessionState, TextPrinter,
};

const FIXTURE: &str = "AA:BB:CC:DD:EE:FF|PeriPage_A6|-40";

fn session() -> anyhow::Result<(Arc<PrinterSession>, FakeDeviceProbe)> {
    let adapter = FakeBleAdapter::new(FakeBackendConfig::single_device(FIXTURE)?);
    let probe = adapter.probe();
    let config = PrinterConfig::builder()
        .device_filter("PeriPage_A6")
        .scan_timeout(Duration::from_secs(2))
        .build();
    let session = PrinterSession::new(Arc::new(adapter), config)?;
    Ok((Arc::new(session), probe))
}

#[tokio::test(start_paused = true)]
async fn concurrent_print_is_rejected_as_busy() -> anyhow::Result<()> {
    let (session, probe) = session()?;
    probe.set_ack_delay(Duration::from_millis(500));

    let first = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.print_text("first").await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = session.print_text("second").await;
    assert_matches!(second, Err(PrinterError::Session(SessionError::Busy)));

    let receipt = first.await??;
    assert_eq!(1, receipt.pages());
    assert_eq!(SessionState::Ready, session.state());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_link_requires_reconnect() -> anyhow::Result<()> {
    let (session, probe) = session()?;
    session.print_text("before").await?;

    probe.drop_link();
    let dropped = session.print_text("lost").await;
    assert_matches!(
        dropped,
        Err(PrinterError::Connection(ConnectionError::Dropped { .. }))
    );
    assert_eq!(SessionState::Error, session.state());
    assert_eq!(
        Some(ErrorKind::ConnectionDropped),
        session.last_error().map(|error| error.kind())
    );

    let refused = session.print_text("still lost").await;
    assert_matches!(
        refused,
        Err(PrinterError::Session(SessionError::NotReady {
            state: SessionState::Error,
            cause: Some(_),
        }))
    );

    session.reconnect().await?;
    assert_eq!(SessionState::Ready, session.state());
    assert_eq!(None, session.last_error());

    let receipt = session.print_text("after").await?;
    assert!(receipt.print_confirmed());
    assert_eq!(2, probe.connect_attempts());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn port_rejects_empty_text_without_connecting() -> anyhow::Result<()> {
    let (session, probe) = session()?;
    let printer: &dyn TextPrinter = session.as_ref();

    let result = printer.print_text("").await;

    assert_eq!(
        Some(ErrorKind::InvalidInput),
        result.err().map(|error| error.kind())
    );
    assert_eq!(0, probe.connect_attempts());
    assert_eq!(SessionState::Disconnected, session.state());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn print_json_goes_through_the_session() -> anyhow::Result<()> {
    let (session, probe) = session()?;
    let printer: &dyn TextPrinter = session.as_ref();

    let receipt = printer
        .print_json(&serde_json::json!({"order": 7, "items": ["tea"]}))
        .await?;

    assert!(receipt.rows() > 20);
    assert!(!probe.written_frames().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn print_runs_on_a_spawned_task() -> anyhow::Result<()> {
    let (session, probe) = session()?;

    let receipt = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.print_text("Hello").await }
    })
    .await??;
    assert!(receipt.print_confirmed());

    let printer: Arc<dyn TextPrinter> = session.clone();
    let receipt = tokio::spawn(async move { printer.print_text("again").await }).await??;
    assert_eq!(1, receipt.pages());
    assert_eq!(1, probe.connect_attempts());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn abandoned_print_returns_session_to_ready() -> anyhow::Result<()> {
    let (session, probe) = session()?;
    session.print_text("warm up").await?;
    probe.set_ack_delay(Duration::from_secs(1));

    let abandoned =
        tokio::time::timeout(Duration::from_millis(500), session.print_text("dropped")).await;
    assert!(abandoned.is_err());
    assert_eq!(SessionState::Ready, session.state());

    let receipt = session.print_text("next").await?;
    assert!(receipt.print_confirmed());
    Ok(())
}
