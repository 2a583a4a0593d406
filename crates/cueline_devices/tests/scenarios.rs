use std::sync::Arc;

use cueline::{
    Clock, Conductor, ConductorConfig, ConductorSettings, Content, DeviceHandle, DeviceId,
    IntervalResolver, LayerMapping, ManualClock, Mapping, Time, TimelineObject, TransportStatus,
};
use cueline_devices::casparcg::LayerContent;
use cueline_devices::{
    CasparAdapter, CasparCommand, CasparState, DeckAdapter, DeckCommand, DeckState,
    LoopbackDriver, RouterAdapter, RouterCommand, RouterState, default_factories,
};

type CasparDevice = DeviceHandle<CasparAdapter, LoopbackDriver<CasparCommand, CasparState>>;
type DeckDevice = DeviceHandle<DeckAdapter, LoopbackDriver<DeckCommand, DeckState>>;
type RouterDevice = DeviceHandle<RouterAdapter, LoopbackDriver<RouterCommand, RouterState>>;

// Helper function to create a conductor on a manual clock
fn create_conductor(start: Time) -> (Conductor, Arc<ManualClock>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cueline=debug,cueline_devices=debug".into()),
        )
        .with_test_writer()
        .try_init();

    let clock = Arc::new(ManualClock::new(start));
    let conductor = Conductor::new(
        ConductorSettings::default(),
        Arc::new(IntervalResolver::new()),
        clock.clone(),
    );
    (conductor, clock)
}

fn caspar(id: &str) -> Arc<CasparDevice> {
    Arc::new(DeviceHandle::new(
        id,
        CasparAdapter::default(),
        LoopbackDriver::new(),
    ))
}

fn video(id: &str, layer: &str, start: Time, duration: Option<Time>) -> TimelineObject {
    TimelineObject::new(
        id,
        layer,
        start,
        duration,
        Content::Video {
            file: id.to_uppercase(),
            looping: false,
            seek: None,
        },
    )
}

fn l1_on(device: &str) -> Mapping {
    let mut mapping = Mapping::new();
    mapping.insert("L1".into(), LayerMapping::casparcg(device, 1, 10));
    mapping
}

fn is_play_of(command: &CasparCommand, expected: &str) -> bool {
    matches!(command, CasparCommand::Play { channel: 1, layer: 10, clip, .. } if clip == expected)
}

const CLEAR_L1: CasparCommand = CasparCommand::Clear {
    channel: 1,
    layer: 10,
};

// Scenario A: a single clip, resolved at its start and again in the middle
async fn scenario_a() -> (Conductor, Arc<ManualClock>, Arc<CasparDevice>) {
    let (conductor, clock) = create_conductor(0);
    let x = caspar("deviceX");
    conductor.add_device(x.clone()).unwrap();
    conductor.init().await;
    conductor.process_device_events().await;

    conductor.set_mapping(l1_on("deviceX"));
    let report = conductor.set_timeline(vec![video("a", "L1", 0, Some(10_000))]);
    assert_eq!(report.commands_for("deviceX"), 1);

    let queue = x.queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].time, 0);
    assert!(is_play_of(&queue[0].command, "A"));

    conductor.dispatch_due().await;
    assert_eq!(x.driver().executed().len(), 1);
    (conductor, clock, x)
}

#[tokio::test]
async fn test_scenario_a_no_new_commands_mid_clip() {
    let (conductor, clock, x) = scenario_a().await;

    clock.set(5_000);
    let report = conductor.resolve_timeline();

    assert_eq!(report.commands_for("deviceX"), 0);
    assert!(x.queue().is_empty());
    conductor.dispatch_due().await;
    assert_eq!(x.driver().executed().len(), 1);
}

#[tokio::test]
async fn test_scenario_b_remap_moves_the_clip() {
    let (conductor, clock) = create_conductor(0);
    let x = caspar("deviceX");
    let y = caspar("deviceY");
    conductor.add_device(x.clone()).unwrap();
    conductor.add_device(y.clone()).unwrap();
    conductor.init().await;
    conductor.process_device_events().await;
    conductor.set_mapping(l1_on("deviceX"));
    conductor.set_timeline(vec![video("a", "L1", 0, Some(10_000))]);
    conductor.dispatch_due().await;

    clock.set(5_000);
    conductor.resolve_timeline();
    conductor.set_mapping(l1_on("deviceY"));

    let x_queue = x.queue();
    assert_eq!(x_queue.len(), 1);
    assert_eq!((x_queue[0].time, &x_queue[0].command), (5_000, &CLEAR_L1));

    let y_queue = y.queue();
    assert_eq!(y_queue.len(), 1);
    assert_eq!(y_queue[0].time, 5_000);
    assert!(is_play_of(&y_queue[0].command, "A"));

    conductor.dispatch_due().await;
    assert_eq!(x.driver().executed().last(), Some(&CLEAR_L1));
    assert_eq!(y.driver().executed().len(), 1);
}

#[tokio::test]
async fn test_scenario_b_remap_in_the_same_millisecond() {
    let (conductor, _clock) = create_conductor(1_000);
    let x = caspar("deviceX");
    let y = caspar("deviceY");
    conductor.add_device(x.clone()).unwrap();
    conductor.add_device(y.clone()).unwrap();
    conductor.init().await;
    conductor.process_device_events().await;
    conductor.set_mapping(l1_on("deviceX"));
    conductor.set_timeline(vec![video("a", "L1", 0, None)]);
    conductor.dispatch_due().await;
    assert_eq!(x.driver().executed().len(), 1);

    conductor.set_mapping(l1_on("deviceY"));
    let x_queue = x.queue();
    assert_eq!(x_queue.len(), 1);
    assert_eq!(x_queue[0].command, CLEAR_L1);

    conductor.dispatch_due().await;
    assert_eq!(x.driver().executed().last(), Some(&CLEAR_L1));
    let y_executed = y.driver().executed();
    assert_eq!(y_executed.len(), 1);
    assert!(is_play_of(&y_executed[0], "A"));
}

#[tokio::test]
async fn test_play_taken_early_is_sent_once() {
    let (conductor, clock) = create_conductor(0);
    let x = caspar("deviceX");
    conductor.add_device(x.clone()).unwrap();
    conductor.init().await;
    conductor.process_device_events().await;
    conductor.set_mapping(l1_on("deviceX"));
    conductor.set_timeline(vec![video("a", "L1", 3_000, None)]);

    clock.set(2_985);
    conductor.dispatch_due().await;
    clock.set(2_990);
    assert_eq!(conductor.resolve_timeline().commands_for("deviceX"), 0);
    clock.set(3_000);
    conductor.dispatch_due().await;

    let executed = x.driver().executed();
    assert_eq!(executed.len(), 1);
    assert!(is_play_of(&executed[0], "A"));
}

#[tokio::test]
async fn test_scenario_c_reconnect_replans() {
    let (conductor, clock, x) = scenario_a().await;

    x.driver().set_connected(false);
    conductor.process_device_events().await;
    clock.set(1_000);
    let report = conductor.resolve_timeline();
    assert_eq!(report.skipped, vec![DeviceId::new("deviceX")]);

    // Without a queryable state the device is assumed to be cleared
    clock.set(2_000);
    x.driver().set_connected(true);
    conductor.process_device_events().await;
    let queue = x.queue();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].time, 2_000);
    assert!(is_play_of(&queue[0].command, "A"));
    conductor.dispatch_due().await;
    assert_eq!(x.driver().executed().len(), 2);

    // With a queryable state nothing needs to be resent
    let known = x.baseline(clock.now() + 1);
    assert_eq!(
        known.layer(1, 10).map(|l| &l.content),
        Some(&LayerContent::Media {
            clip: "A".into(),
            looping: false,
            seek: None
        })
    );
    x.driver().set_known_state(Some(known));
    x.driver().set_connected(false);
    conductor.process_device_events().await;
    clock.set(3_000);
    x.driver().set_connected(true);
    conductor.process_device_events().await;
    assert!(x.queue().is_empty());
}

#[tokio::test]
async fn test_scenario_d_removed_objects_stop_once() {
    let (conductor, clock, x) = scenario_a().await;

    clock.set(2_000);
    let report = conductor.set_timeline(Vec::new());
    assert_eq!(report.commands_for("deviceX"), 1);
    let queue = x.queue();
    assert_eq!((queue[0].time, &queue[0].command), (2_000, &CLEAR_L1));
    conductor.dispatch_due().await;

    for t in [3_000, 10_000, 20_000] {
        clock.set(t);
        let report = conductor.resolve_timeline();
        assert_eq!(report.commands_for("deviceX"), 0, "at {t}");
    }
    conductor.dispatch_due().await;
    let executed = x.driver().executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[1], CLEAR_L1);
}

#[tokio::test]
async fn test_deck_records_until_the_object_ends() {
    let (conductor, clock) = create_conductor(0);
    let deck: Arc<DeckDevice> = Arc::new(DeviceHandle::new(
        "deck",
        DeckAdapter::default(),
        LoopbackDriver::new(),
    ));
    conductor.add_device(deck.clone()).unwrap();
    conductor.init().await;
    conductor.process_device_events().await;

    let mut mapping = Mapping::new();
    mapping.insert("rec".into(), LayerMapping::hyperdeck("deck"));
    conductor.set_mapping(mapping);
    conductor.set_timeline(vec![TimelineObject::new(
        "record-show",
        "rec",
        0,
        Some(10_000),
        Content::Transport {
            status: TransportStatus::Record,
            record_filename: Some("show".into()),
        },
    )]);
    assert_eq!(
        deck.queue().into_iter().map(|e| (e.time, e.command)).collect::<Vec<_>>(),
        vec![(
            0,
            DeckCommand::Record {
                filename: Some("show".into())
            }
        )]
    );
    conductor.dispatch_due().await;

    clock.set(6_000);
    conductor.resolve_timeline();
    assert_eq!(
        deck.queue().into_iter().map(|e| (e.time, e.command)).collect::<Vec<_>>(),
        vec![(10_000, DeckCommand::Stop)]
    );
}

#[tokio::test]
async fn test_router_releases_output_to_safe_source() {
    let (conductor, _clock) = create_conductor(0);
    let hub: Arc<RouterDevice> = Arc::new(DeviceHandle::new(
        "hub",
        RouterAdapter::default(),
        LoopbackDriver::new(),
    ));
    conductor.add_device(hub.clone()).unwrap();
    conductor.init().await;
    conductor.process_device_events().await;

    let mut mapping = Mapping::new();
    mapping.insert("cam".into(), LayerMapping::router("hub", 1));
    conductor.set_mapping(mapping);
    conductor.set_timeline(vec![TimelineObject::new(
        "cam3",
        "cam",
        0,
        Some(4_000),
        Content::Crosspoint { source: 3 },
    )]);

    assert_eq!(
        hub.queue().into_iter().map(|e| (e.time, e.command)).collect::<Vec<_>>(),
        vec![
            (0, RouterCommand::Take { output: 1, source: 3 }),
            (4_000, RouterCommand::Take { output: 1, source: 0 }),
        ]
    );
}

#[tokio::test]
async fn test_devices_from_config() {
    let json = r#"{
        "settings": { "lookahead": 2000 },
        "devices": {
            "ccg": { "kind": "caspar_cg", "connection": { "type": "virtual" } },
            "hub": { "kind": "router", "connection": { "type": "virtual" }, "options": { "safe_source": 7 } },
            "broken": { "kind": "router", "connection": { "type": "virtual" }, "options": { "safe_source": -1 } }
        }
    }"#;
    let config = ConductorConfig::from_json_str(json).unwrap();
    let (conductor, clock) = {
        let clock = Arc::new(ManualClock::new(0));
        let (conductor, errors) = Conductor::from_config(
            &config,
            &default_factories(),
            Arc::new(IntervalResolver::new()),
            clock.clone(),
        );
        assert_eq!(errors.len(), 1);
        (conductor, clock)
    };
    assert_eq!(conductor.settings().lookahead, 2_000);
    assert_eq!(
        conductor.device_ids(),
        vec![DeviceId::new("ccg"), DeviceId::new("hub")]
    );

    conductor.init().await;
    conductor.process_device_events().await;
    let mut mapping = l1_on("ccg");
    mapping.insert("cam".into(), LayerMapping::router("hub", 2));
    conductor.set_mapping(mapping);
    conductor.set_timeline(vec![
        video("a", "L1", 0, None),
        TimelineObject::new("cam", "cam", 0, Some(1_000), Content::Crosspoint { source: 4 }),
    ]);

    let hub = conductor.device("hub").unwrap();
    let queued: Vec<_> = hub.queued().into_iter().map(|q| (q.time, q.command)).collect();
    assert_eq!(
        queued,
        vec![
            (0, "Take { output: 2, source: 4 }".to_string()),
            (1_000, "Take { output: 2, source: 7 }".to_string()),
        ]
    );
    assert_eq!(conductor.device("ccg").unwrap().queued().len(), 1);

    clock.set(1_000);
    let reports = conductor.dispatch_due().await;
    assert_eq!(reports[&DeviceId::new("hub")].executed(), 2);
    assert_eq!(reports[&DeviceId::new("ccg")].executed(), 1);
}
