use std::{
    collections::HashSet,
    future::Future,
    ops::Deref,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tablemq::{
    address::QueueAddress,
    config::Config,
    dispatch::{Delay, Dispatcher, TransportOperation},
    error::Error,
    message::{Headers, OutgoingMessage},
    pipeline::{ErrorContext, ErrorHandleResult, ErrorHandler, MessageContext, MessageHandler},
    service::Service,
    transaction::{TransactionMode, TransportTransaction},
};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct TmpService {
    svc: Service,
    #[allow(unused)]
    tmpdir: TempDir,
}

impl Deref for TmpService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.svc
    }
}

async fn setup(configure: impl FnOnce(&mut Config)) -> TmpService {
    let path = tempfile::tempdir().unwrap();

    let mut config = Config {
        db_path: path.path().join("tablemq.db").to_string_lossy().to_string(),
        input_queue: QueueAddress::new("orders"),
        max_concurrency: 1,
        peek_delay_ms: 10,
        peek_timeout_ms: 1_000,
        purge_expired: false,
        ..Config::default()
    };
    configure(&mut config);

    TmpService {
        svc: Service::connect_with(config).await.unwrap(),
        tmpdir: path,
    }
}

async fn count(service: &Service, queue: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{queue}\""))
        .fetch_one(service.db())
        .await
        .unwrap()
}

async fn send(service: &Service, queue: &str, body: &'static str) {
    service
        .dispatcher()
        .dispatch(
            vec![TransportOperation::unicast(
                OutgoingMessage::new(Headers::new(), body),
                QueueAddress::new(queue),
            )],
            &mut TransportTransaction::None,
        )
        .await
        .unwrap();
}

/// Reports the body of every message it handles.
struct Recorder {
    tx: mpsc::UnboundedSender<String>,
}

impl MessageHandler for Recorder {
    fn on_message<'a>(
        &'a self,
        ctx: MessageContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let body = String::from_utf8_lossy(ctx.message.body()).into_owned();
            self.tx.send(body)?;
            Ok(())
        })
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_receives_in_order() {
    let service = setup(|_| {}).await;

    send(&service, "orders", "first").await;
    send(&service, "orders", "second").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut receiver = service.receiver();
    receiver
        .initialize(Arc::new(Recorder { tx }), Arc::new(service.immediate_retries()))
        .await
        .unwrap();
    receiver.start_receive().unwrap();

    assert_eq!(next(&mut rx).await, "first");
    assert_eq!(next(&mut rx).await, "second");

    receiver.stop_receive().await.unwrap();
    assert_eq!(count(&service, "orders").await, 0);
}

/// Sleeps while tracking how many calls overlap.
struct Overlap {
    current: AtomicUsize,
    peak: AtomicUsize,
    done: mpsc::UnboundedSender<String>,
}

impl MessageHandler for Overlap {
    fn on_message<'a>(
        &'a self,
        ctx: MessageContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            self.done.send(ctx.message.transport_id().to_owned())?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let service = setup(|config| {
        config.transaction_mode = TransactionMode::None;
        config.max_concurrency = 2;
    })
    .await;

    for _ in 0..6 {
        send(&service, "orders", "work").await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handler = Arc::new(Overlap {
        current: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
        done: tx,
    });

    let mut receiver = service.receiver();
    receiver
        .initialize(handler.clone(), Arc::new(service.immediate_retries()))
        .await
        .unwrap();
    receiver.start_receive().unwrap();

    let mut ids = HashSet::new();
    for _ in 0..6 {
        ids.insert(next(&mut rx).await);
    }
    receiver.stop_receive().await.unwrap();

    assert_eq!(ids.len(), 6);
    assert!(handler.peak.load(Ordering::SeqCst) <= 2);
}

/// Fails the first time it sees a message.
struct FailOnce {
    seen: Mutex<HashSet<String>>,
    done: mpsc::UnboundedSender<String>,
}

impl MessageHandler for FailOnce {
    fn on_message<'a>(
        &'a self,
        ctx: MessageContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let id = ctx.message.transport_id().to_owned();
            if self.seen.lock().unwrap().insert(id.clone()) {
                eyre::bail!("first attempt fails");
            }
            self.done.send(id)?;
            Ok(())
        })
    }
}

/// Always asks for another attempt and remembers the attempt counts it was given.
#[derive(Default)]
struct AlwaysRetry {
    attempts: Mutex<Vec<u32>>,
}

impl ErrorHandler for AlwaysRetry {
    fn on_error<'a>(
        &'a self,
        ctx: ErrorContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<ErrorHandleResult>> + Send + 'a>> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(ctx.attempts);
            Ok(ErrorHandleResult::RetryRequired)
        })
    }
}

#[tokio::test]
async fn test_failed_message_is_retried() {
    let service = setup(|_| {}).await;
    send(&service, "orders", "flaky").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let errors = Arc::new(AlwaysRetry::default());

    let mut receiver = service.receiver();
    receiver
        .initialize(
            Arc::new(FailOnce {
                seen: Mutex::new(HashSet::new()),
                done: tx,
            }),
            errors.clone(),
        )
        .await
        .unwrap();
    receiver.start_receive().unwrap();

    next(&mut rx).await;
    receiver.stop_receive().await.unwrap();

    assert_eq!(*errors.attempts.lock().unwrap(), vec![1]);
    assert!(receiver.failures().is_empty());
    assert_eq!(count(&service, "orders").await, 0);
    assert_eq!(count(&service, "error").await, 0);
}

#[tokio::test]
async fn test_isolated_dispatch_rolls_back_together() {
    let service = setup(|_| {}).await;

    let message = || OutgoingMessage::new(Headers::new(), "payload");
    let result = service
        .dispatcher()
        .dispatch(
            vec![
                TransportOperation::unicast(message(), QueueAddress::new("orders")).isolated(),
                TransportOperation::unicast(message(), QueueAddress::new("missing")).isolated(),
            ],
            &mut TransportTransaction::None,
        )
        .await;

    assert!(matches!(result, Err(Error::QueueNotFound { .. })));
    assert_eq!(count(&service, "orders").await, 0);
}

#[tokio::test]
async fn test_poison_message_does_not_block_queue() {
    let service = setup(|_| {}).await;

    sqlx::query(
        "INSERT INTO \"orders\" (Id, Recoverable, Headers, Body) \
         VALUES ('bad', 1, 'not json', x'00')",
    )
    .execute(service.db())
    .await
    .unwrap();
    send(&service, "orders", "good").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut receiver = service.receiver();
    receiver
        .initialize(Arc::new(Recorder { tx }), Arc::new(service.immediate_retries()))
        .await
        .unwrap();
    receiver.start_receive().unwrap();

    assert_eq!(next(&mut rx).await, "good");
    receiver.stop_receive().await.unwrap();

    let (id, headers): (String, String) =
        sqlx::query_as("SELECT Id, Headers FROM \"error\"")
            .fetch_one(service.db())
            .await
            .unwrap();
    assert_eq!(id, "bad");
    assert_eq!(headers, "not json");
}

#[tokio::test]
async fn test_publish_reaches_each_subscriber() {
    let service = setup(|_| {}).await;
    service
        .create_queue(&QueueAddress::new("billing"))
        .await
        .unwrap();

    let subscriptions = service.subscriptions();
    for _ in 0..2 {
        subscriptions
            .subscribe("billing", &QueueAddress::new("billing"), "OrderPlaced")
            .await
            .unwrap();
    }
    subscriptions
        .subscribe("orders", &QueueAddress::new("orders"), "OrderPlaced")
        .await
        .unwrap();

    service
        .dispatcher()
        .dispatch(
            vec![TransportOperation::multicast(
                OutgoingMessage::new(Headers::new(), "placed"),
                ["OrderPlaced"],
            )],
            &mut TransportTransaction::None,
        )
        .await
        .unwrap();

    assert_eq!(count(&service, "billing").await, 1);
    assert_eq!(count(&service, "orders").await, 1);
}

#[tokio::test]
async fn test_delayed_message_is_delivered_to_destination() {
    let service = setup(|config| config.delayed_max_interval_secs = 1).await;
    service
        .create_queue(&QueueAddress::new("billing"))
        .await
        .unwrap();

    let cancel = tokio_util::sync::CancellationToken::new();
    let delayed = service.start_delayed_delivery(cancel.clone()).unwrap();

    service
        .dispatcher()
        .dispatch(
            vec![TransportOperation::unicast(
                OutgoingMessage::new(Headers::new(), "later"),
                QueueAddress::new("billing"),
            )
            .delayed(Delay::For(Duration::from_millis(100)))],
            &mut TransportTransaction::None,
        )
        .await
        .unwrap();

    assert_eq!(count(&service, "billing").await, 0);

    // The matured message lands in the input queue, which forwards it on.
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut receiver = service.receiver();
    receiver
        .initialize(Arc::new(Recorder { tx }), Arc::new(service.immediate_retries()))
        .await
        .unwrap();
    receiver.start_receive().unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        while count(&service, "billing").await == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    receiver.stop_receive().await.unwrap();
    cancel.cancel();
    delayed.await.unwrap();

    let headers: String = sqlx::query_scalar("SELECT Headers FROM \"billing\"")
        .fetch_one(service.db())
        .await
        .unwrap();
    assert!(!headers.contains("ForwardDestination"));
}

/// Forwards each message to `billing`, and optionally records it in `audit` on its own.
/// Fails the first attempt at every message when `fail_first` is set.
struct Forwarder {
    dispatcher: Dispatcher,
    audit: bool,
    fail_first: bool,
    seen: Mutex<HashSet<String>>,
    done: mpsc::UnboundedSender<String>,
}

impl MessageHandler for Forwarder {
    fn on_message<'a>(
        &'a self,
        ctx: MessageContext<'a>,
    ) -> Pin<Box<dyn Future<Output = eyre::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let body = ctx.message.body().clone();
            let mut operations = vec![TransportOperation::unicast(
                OutgoingMessage::new(Headers::new(), body.clone()),
                QueueAddress::new("billing"),
            )];
            if self.audit {
                operations.push(
                    TransportOperation::unicast(
                        OutgoingMessage::new(Headers::new(), body),
                        QueueAddress::new("audit"),
                    )
                    .isolated(),
                );
            }
            self.dispatcher.dispatch(operations, ctx.transaction).await?;

            let id = ctx.message.transport_id().to_owned();
            if self.fail_first && self.seen.lock().unwrap().insert(id.clone()) {
                eyre::bail!("first attempt fails");
            }
            self.done.send(id)?;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_receive_only_handler_sends_to_another_queue() {
    let service = setup(|config| config.transaction_mode = TransactionMode::ReceiveOnly).await;
    service
        .create_queue(&QueueAddress::new("billing"))
        .await
        .unwrap();
    send(&service, "orders", "invoice me").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut receiver = service.receiver();
    receiver
        .initialize(
            Arc::new(Forwarder {
                dispatcher: service.dispatcher(),
                audit: false,
                fail_first: false,
                seen: Mutex::new(HashSet::new()),
                done: tx,
            }),
            Arc::new(service.immediate_retries()),
        )
        .await
        .unwrap();
    receiver.start_receive().unwrap();

    next(&mut rx).await;
    receiver.stop_receive().await.unwrap();

    assert_eq!(count(&service, "orders").await, 0);
    assert_eq!(count(&service, "billing").await, 1);
    assert_eq!(count(&service, "error").await, 0);

    let body: Vec<u8> = sqlx::query_scalar("SELECT Body FROM \"billing\"")
        .fetch_one(service.db())
        .await
        .unwrap();
    assert_eq!(body, b"invoice me");
}

#[tokio::test]
async fn test_isolated_send_survives_failed_attempt() {
    let service = setup(|_| {}).await;
    for queue in ["billing", "audit"] {
        service
            .create_queue(&QueueAddress::new(queue))
            .await
            .unwrap();
    }
    send(&service, "orders", "invoice me").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut receiver = service.receiver();
    receiver
        .initialize(
            Arc::new(Forwarder {
                dispatcher: service.dispatcher(),
                audit: true,
                fail_first: true,
                seen: Mutex::new(HashSet::new()),
                done: tx,
            }),
            Arc::new(AlwaysRetry::default()),
        )
        .await
        .unwrap();
    receiver.start_receive().unwrap();

    next(&mut rx).await;
    receiver.stop_receive().await.unwrap();

    // The billing send rolled back with the first attempt, the audit record did not.
    assert_eq!(count(&service, "orders").await, 0);
    assert_eq!(count(&service, "billing").await, 1);
    assert_eq!(count(&service, "audit").await, 2);
}
