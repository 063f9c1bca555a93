use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use control_registry::{ControlError, ControlRegistry, OperationSet};
use futures::stream::{self, BoxStream, StreamExt};
use hub_bus::{command_topic, Bus, Message, CONTROL_SERVICE, TOPIC_EVENTS};
use hub_provider::bridge::connection_in_use;
use hub_provider::{
    BridgeError, ConnectionError, DirectSubmitter, HubClient, HubDevice, HubProvider, Job,
    JobConfig, JobState, LifecycleState, ProviderConfig, ProviderError, SubmissionError,
    Submitter, Topology,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

/// Device fed by the test through a channel; commands sent to the hub are
/// forwarded to another channel.
struct ChannelDevice {
    id: String,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    outbound: mpsc::UnboundedSender<Message>,
}

struct DeviceHarness {
    inbound: mpsc::UnboundedSender<Message>,
    outbound: mpsc::UnboundedReceiver<Message>,
}

fn channel_device(id: &str) -> (ChannelDevice, DeviceHarness) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    (
        ChannelDevice {
            id: id.into(),
            inbound: Mutex::new(Some(inbound_rx)),
            outbound: outbound_tx,
        },
        DeviceHarness {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
    )
}

#[async_trait]
impl HubDevice for ChannelDevice {
    fn connection_id(&self) -> String {
        self.id.clone()
    }

    fn events(&self) -> BoxStream<'static, Message> {
        match self.inbound.lock().take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|msg| (msg, rx))
            })
            .boxed(),
            None => stream::empty().boxed(),
        }
    }

    async fn send_command(&self, command: Message) -> Result<(), ConnectionError> {
        self.outbound
            .send(command)
            .map_err(|_| ConnectionError::Closed)
    }
}

/// Records submission attempts and fails the one named `fail_on`.
struct RecordingSubmitter {
    inner: DirectSubmitter,
    fail_on: Option<String>,
    attempts: Mutex<Vec<String>>,
}

impl RecordingSubmitter {
    fn new(fail_on: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            inner: DirectSubmitter::new(),
            fail_on: fail_on.map(str::to_string),
            attempts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Submitter for RecordingSubmitter {
    fn new_topology(&self, name: Option<&str>) -> Topology {
        self.inner.new_topology(name)
    }

    async fn submit(&self, topology: Topology, config: JobConfig) -> Result<Job, SubmissionError> {
        let name = config
            .job_name
            .clone()
            .unwrap_or_else(|| topology.name().to_string());
        self.attempts.lock().push(name.clone());
        if self.fail_on.as_deref() == Some(name.as_str()) {
            return Err(SubmissionError::Rejected(format!("{name} refused")));
        }
        self.inner.submit(topology, config).await
    }
}

fn provider(
    id: &str,
    submitter: Arc<dyn Submitter>,
) -> (HubProvider, DeviceHarness, Arc<ControlRegistry>) {
    let (device, harness) = channel_device(id);
    let registry = Arc::new(ControlRegistry::new());
    let provider = HubProvider::with_registry(
        device,
        submitter,
        ProviderConfig::default(),
        registry.clone(),
    )
    .expect("provider");
    (provider, harness, registry)
}

/// Wraps a control request the way the hub sends it.
fn control(request: Message) -> Message {
    HubClient::command(CONTROL_SERVICE, request)
}

async fn eventually<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn control_command_reaches_registered_operation_once() {
    let (provider, harness, registry) = provider("it-control", Arc::new(DirectSubmitter::new()));
    let calls: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = calls.clone();
    registry
        .register(
            "log",
            "root",
            OperationSet::new().with("setLevel", move |args| {
                recorded.lock().push(args);
                Ok(())
            }),
        )
        .unwrap();
    provider.start().await.expect("start");

    provider
        .bus()
        .publish(
            &command_topic(CONTROL_SERVICE),
            control(json!({
                "type": "log",
                "id": "root",
                "op": "setLevel",
                "args": {"level": "DEBUG"}
            })),
        )
        .unwrap();
    eventually(|| calls.lock().len() == 1).await;

    // The same request arriving from the hub goes through the bridge.
    harness
        .inbound
        .send(control(json!({
            "type": "log",
            "id": "root",
            "op": "setLevel",
            "args": {"level": "INFO"}
        })))
        .unwrap();
    eventually(|| calls.lock().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        calls.lock().as_slice(),
        [json!({"level": "DEBUG"}), json!({"level": "INFO"})]
    );
}

#[tokio::test]
async fn handler_failure_does_not_block_later_commands() {
    let (provider, harness, registry) =
        provider("it-handler-error", Arc::new(DirectSubmitter::new()));
    let resets = Arc::new(Mutex::new(0usize));
    let counter = resets.clone();
    registry
        .register(
            "metrics",
            "all",
            OperationSet::new()
                .with("fail", |_| Err("metrics store offline".into()))
                .with("reset", move |_| {
                    *counter.lock() += 1;
                    Ok(())
                }),
        )
        .unwrap();
    provider.start().await.expect("start");

    for op in ["fail", "missing", "reset"] {
        harness
            .inbound
            .send(control(json!({"type": "metrics", "id": "all", "op": op})))
            .unwrap();
    }
    harness
        .inbound
        .send(json!({"cmd": "controlService", "payload": "not an object"}))
        .unwrap();
    harness
        .inbound
        .send(control(json!({"type": "metrics", "id": "all", "op": "reset"})))
        .unwrap();

    eventually(|| *resets.lock() == 2).await;
}

#[tokio::test]
async fn event_subscribers_each_see_every_event_in_order() {
    let (provider, harness, _) = provider("it-fanout", Arc::new(DirectSubmitter::new()));
    let client = provider.client();
    let slow_seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let fast_seen: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));

    let mut slow = client.events();
    let slow_sink = slow_seen.clone();
    tokio::spawn(async move {
        while let Some(msg) = slow.recv().await {
            tokio::time::sleep(Duration::from_millis(30)).await;
            slow_sink.lock().push(msg.payload);
        }
    });
    let mut fast = client.events();
    let fast_sink = fast_seen.clone();
    tokio::spawn(async move {
        while let Some(msg) = fast.recv().await {
            fast_sink.lock().push(msg.payload);
        }
    });

    provider.start().await.expect("start");
    for n in 1..=3 {
        harness.inbound.send(json!({"reading": n})).unwrap();
    }

    // The fast subscriber finishes while the slow one is still working.
    eventually(|| fast_seen.lock().len() == 3).await;
    eventually(|| slow_seen.lock().len() == 3).await;
    let expected = vec![json!({"reading": 1}), json!({"reading": 2}), json!({"reading": 3})];
    assert_eq!(*fast_seen.lock(), expected);
    assert_eq!(*slow_seen.lock(), expected);
}

#[tokio::test]
async fn application_commands_reach_the_connection() {
    let (provider, mut harness, _) = provider("it-outbound", Arc::new(DirectSubmitter::new()));
    provider.start().await.expect("start");

    let client = provider.client();
    client
        .send_command(HubClient::command("blink", json!({"times": 2})))
        .unwrap();
    let sent = tokio::time::timeout(Duration::from_secs(2), harness.outbound.recv())
        .await
        .expect("timeout")
        .expect("command");
    assert_eq!(sent, json!({"cmd": "blink", "payload": {"times": 2}}));
}

#[tokio::test]
async fn second_provider_cannot_claim_a_live_connection() {
    let (first, _harness, _) = provider("it-single-owner", Arc::new(DirectSubmitter::new()));
    let (device, _) = channel_device("it-single-owner");
    let err = HubProvider::with_registry(
        device,
        Arc::new(DirectSubmitter::new()),
        ProviderConfig::default(),
        Arc::new(ControlRegistry::new()),
    )
    .err()
    .expect("second provider must fail");
    assert!(matches!(
        err,
        ProviderError::Bridge(BridgeError::ConnectionInUse(ref id)) if id == "it-single-owner"
    ));

    drop(first);
    let (device, _) = channel_device("it-single-owner");
    assert!(HubProvider::with_registry(
        device,
        Arc::new(DirectSubmitter::new()),
        ProviderConfig::default(),
        Arc::new(ControlRegistry::new()),
    )
    .is_ok());
}

#[tokio::test]
async fn providers_sharing_a_registry_cannot_both_own_the_app_service() {
    let registry = Arc::new(ControlRegistry::new());
    let build = |id: &str| {
        let (device, _) = channel_device(id);
        HubProvider::with_registry(
            device,
            Arc::new(DirectSubmitter::new()),
            ProviderConfig::default(),
            registry.clone(),
        )
    };

    let first = build("it-shared-a").expect("first provider");
    let err = build("it-shared-b").err().expect("second provider must fail");
    assert!(matches!(
        err,
        ProviderError::Control(ControlError::AlreadyRegistered { ref kind, ref id })
            if kind == "appService" && id == "hub"
    ));
    assert!(!connection_in_use("it-shared-b"));

    drop(first);
    assert!(!registry.contains("appService", "hub"));
    assert!(build("it-shared-b").is_ok());
}

#[tokio::test]
async fn start_submits_in_order_and_names_jobs() {
    let submitter = RecordingSubmitter::new(None);
    let (provider, _harness, _) = provider("it-order", submitter.clone());
    let mut extra = provider.new_topology(Some("HubHeartbeat"));
    extra.add_task("beat", futures::future::pending());
    provider.register_system_app(extra).unwrap();
    assert_eq!(
        provider.system_app_names(),
        ["HubDevice", "HubCommandsToControl", "HubHeartbeat"]
    );

    let jobs = provider.start().await.expect("start");
    let names: Vec<&str> = jobs.iter().map(|job| job.name()).collect();
    assert_eq!(names, ["HubDevice", "HubCommandsToControl", "HubHeartbeat"]);
    assert_eq!(
        *submitter.attempts.lock(),
        ["HubDevice", "HubCommandsToControl", "HubHeartbeat"]
    );
    assert_eq!(provider.state(), LifecycleState::Started);
    assert!(jobs.iter().all(|job| job.state() == JobState::Running));

    let late = provider.new_topology(Some("late"));
    assert!(matches!(
        provider.register_system_app(late),
        Err(ProviderError::InvalidState(LifecycleState::Started))
    ));
    assert!(matches!(
        provider.start().await,
        Err(ProviderError::InvalidState(LifecycleState::Started))
    ));
}

#[tokio::test]
async fn start_stops_at_first_failed_submission() {
    let submitter = RecordingSubmitter::new(Some("HubDevice"));
    let (provider, _harness, _) = provider("it-fail-fast", submitter.clone());

    let err = provider.start().await.expect_err("start must fail");
    match err {
        ProviderError::Submission { app, source } => {
            assert_eq!(app, "HubDevice");
            assert!(matches!(source, SubmissionError::Rejected(_)));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(*submitter.attempts.lock(), ["HubDevice"]);
    assert_eq!(provider.state(), LifecycleState::StartFailed);
}

#[tokio::test]
async fn later_failure_leaves_earlier_jobs_running() {
    let submitter = RecordingSubmitter::new(Some("HubCommandsToControl"));
    let (provider, _harness, _) = provider("it-partial", submitter.clone());

    assert!(provider.start().await.is_err());
    assert_eq!(*submitter.attempts.lock(), ["HubDevice", "HubCommandsToControl"]);
    let device_job = submitter.inner.job("HubDevice").expect("device job running");
    assert_eq!(device_job.state(), JobState::Running);
}

#[tokio::test]
async fn jobs_can_be_cancelled_by_control_command() {
    let (provider, harness, registry) =
        provider("it-job-control", Arc::new(DirectSubmitter::new()));
    provider.start().await.expect("start");

    let mut topology = provider.new_topology(Some("sensor"));
    topology.add_task("sample", futures::future::pending());
    let job = provider
        .submit(topology, JobConfig::default())
        .await
        .expect("submitted");
    assert_eq!(registry.operations("job", "sensor"), Some(vec!["cancel".to_string()]));

    harness
        .inbound
        .send(control(json!({"type": "job", "id": "sensor", "op": "cancel"})))
        .unwrap();
    let state = tokio::time::timeout(Duration::from_secs(2), job.wait())
        .await
        .expect("job cancelled");
    assert_eq!(state, JobState::Cancelled);
    eventually(|| !registry.contains("job", "sensor")).await;
}

#[tokio::test]
async fn applications_submit_by_name_and_by_control_request() {
    let (provider, mut harness, _) = provider("it-apps", Arc::new(DirectSubmitter::new()));
    let client = provider.client();
    let apps = provider.application_service();
    apps.register_application("echo", move |topology, config| {
        let prefix = config
            .get("prefix")
            .and_then(Message::as_str)
            .unwrap_or("echo")
            .to_string();
        let client = client.clone();
        let mut events = client.events();
        topology.add_task("echo", async move {
            while let Some(msg) = events.recv().await {
                if msg.payload.get("cmd").is_some() {
                    continue;
                }
                client.send_command(HubClient::command(&prefix, msg.payload))?;
            }
            Ok(())
        });
        Ok(())
    })
    .unwrap();
    assert_eq!(apps.applications(), ["echo"]);
    assert!(matches!(
        apps.submit_application("missing", json!({})).await,
        Err(ProviderError::UnknownApplication(name)) if name == "missing"
    ));

    provider.start().await.expect("start");
    harness
        .inbound
        .send(control(json!({
            "type": "appService",
            "id": "hub",
            "op": "submit",
            "args": {"name": "echo", "config": {"prefix": "mirror"}}
        })))
        .unwrap();
    // Give the submission a moment before feeding the event it should echo.
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.inbound.send(json!({"temp": 19})).unwrap();

    let echoed = tokio::time::timeout(Duration::from_secs(2), harness.outbound.recv())
        .await
        .expect("timeout")
        .expect("command");
    assert_eq!(echoed, json!({"cmd": "mirror", "payload": {"temp": 19}}));
}

#[tokio::test]
async fn dropping_the_provider_closes_the_bus() {
    let (provider, _harness, _) = provider("it-teardown", Arc::new(DirectSubmitter::new()));
    let mut events = provider.bus().subscribe(TOPIC_EVENTS);
    drop(provider);
    assert!(events.recv().await.is_none());
}
