use std::time::Duration;

use spb_client::channel::{ChannelBroker, ChannelTransport, TransportOp};
use spb_client::TransportEvent;
use spb_edge::{EdgeNode, EdgeNodeConfig, Error};
use spb_types::payload::{metric::Value, Message, Payload};
use spb_types::topic::QoS;
use spb_types::PayloadBuilder;
use tokio::time::{sleep, timeout};

async fn recv_op(broker: &mut ChannelBroker) -> TransportOp {
    timeout(Duration::from_secs(1), broker.rx_ops.recv())
        .await
        .expect("timed out waiting for a transport op")
        .expect("transport closed")
}

fn decode(bytes: &[u8]) -> Payload {
    Payload::decode(bytes).expect("payload did not decode")
}

fn bdseq_of(payload: &Payload) -> Option<u64> {
    payload.metrics.iter().find_map(|m| {
        if m.name.as_deref() != Some("bdSeq") {
            return None;
        }
        match m.value {
            Some(Value::LongValue(v)) => Some(v),
            _ => None,
        }
    })
}

fn new_node(config: EdgeNodeConfig) -> (EdgeNode, ChannelBroker) {
    let (transport, broker, events) = ChannelTransport::new();
    let node = EdgeNode::new(config, transport, events).unwrap();
    (node, broker)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(1), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time")
}

fn temperature_birth() -> PayloadBuilder {
    PayloadBuilder::new().add_metric_with_alias("Temperature", 1, 20.5)
}

#[tokio::test]
async fn happy_path_birth_and_data() {
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();

    let will = match recv_op(&mut broker).await {
        TransportOp::Connect { will } => will.unwrap(),
        op => panic!("expected connect, got {op:?}"),
    };
    assert_eq!(will.topic, "spBv1.0/Energy/NDEATH/Gateway01");
    assert_eq!(will.qos, QoS::AtLeastOnce);
    assert!(!will.retain);
    let death = decode(&will.payload);
    assert_eq!(bdseq_of(&death), Some(1));
    assert_eq!(death.seq, None);

    match recv_op(&mut broker).await {
        TransportOp::Subscribe { filter, qos } => {
            assert_eq!(filter, "spBv1.0/Energy/NCMD/Gateway01");
            assert_eq!(qos, QoS::AtLeastOnce);
        }
        op => panic!("expected NCMD subscribe, got {op:?}"),
    }

    node.publish_birth(temperature_birth()).await.unwrap();
    match recv_op(&mut broker).await {
        TransportOp::Publish {
            topic,
            payload,
            qos,
            retain,
        } => {
            assert_eq!(topic, "spBv1.0/Energy/NBIRTH/Gateway01");
            assert_eq!(qos, QoS::AtMostOnce);
            assert!(!retain);
            let birth = decode(&payload);
            assert_eq!(birth.seq, Some(0));
            assert_eq!(bdseq_of(&birth), Some(1));
            let temperature = &birth.metrics[0];
            assert_eq!(temperature.name.as_deref(), Some("Temperature"));
            assert_eq!(temperature.alias, Some(1));
        }
        op => panic!("expected NBIRTH publish, got {op:?}"),
    }

    for expected_seq in 1..=3u64 {
        node.publish_data(PayloadBuilder::new().add_metric_by_alias(1, 21.0))
            .await
            .unwrap();
        match recv_op(&mut broker).await {
            TransportOp::Publish { topic, payload, .. } => {
                assert_eq!(topic, "spBv1.0/Energy/NDATA/Gateway01");
                let data = decode(&payload);
                assert_eq!(data.seq, Some(expected_seq));
                assert_eq!(data.metrics[0].alias, Some(1));
                assert_eq!(data.metrics[0].name, None);
            }
            op => panic!("expected NDATA publish, got {op:?}"),
        }
    }

    assert_eq!(node.get_seq(), 3);
    assert_eq!(node.get_bd_seq(), 1);
}

#[tokio::test]
async fn sequence_wraps_at_256() {
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();
    node.publish_birth(temperature_birth()).await.unwrap();
    // connect + subscribe + birth
    for _ in 0..3 {
        recv_op(&mut broker).await;
    }

    let mut last_seq = None;
    for _ in 0..256 {
        node.publish_data(PayloadBuilder::new().add_metric_by_alias(1, 1.0))
            .await
            .unwrap();
        match recv_op(&mut broker).await {
            TransportOp::Publish { payload, .. } => last_seq = decode(&payload).seq,
            op => panic!("expected NDATA publish, got {op:?}"),
        }
    }

    assert_eq!(last_seq, Some(0));
    assert_eq!(node.get_seq(), 0);
}

#[tokio::test]
async fn rebirth_advances_bdseq_once() {
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();
    node.publish_birth(temperature_birth()).await.unwrap();
    for _ in 0..3 {
        recv_op(&mut broker).await;
    }
    let first_will = broker.last_will().unwrap();
    assert_eq!(bdseq_of(&decode(&first_will.payload)), Some(1));

    node.rebirth().await.unwrap();

    assert_eq!(recv_op(&mut broker).await, TransportOp::Disconnect);
    match recv_op(&mut broker).await {
        TransportOp::Connect { will } => {
            let death = decode(&will.unwrap().payload);
            assert_eq!(bdseq_of(&death), Some(2));
        }
        op => panic!("expected reconnect, got {op:?}"),
    }
    match recv_op(&mut broker).await {
        TransportOp::Subscribe { filter, .. } => {
            assert_eq!(filter, "spBv1.0/Energy/NCMD/Gateway01")
        }
        op => panic!("expected NCMD subscribe, got {op:?}"),
    }
    match recv_op(&mut broker).await {
        TransportOp::Publish { topic, payload, .. } => {
            assert_eq!(topic, "spBv1.0/Energy/NBIRTH/Gateway01");
            let birth = decode(&payload);
            assert_eq!(birth.seq, Some(0));
            assert_eq!(bdseq_of(&birth), Some(2));
        }
        op => panic!("expected NBIRTH publish, got {op:?}"),
    }

    assert_eq!(node.get_bd_seq(), 2);
    assert_eq!(node.get_seq(), 0);
}

#[tokio::test]
async fn dbirth_requires_nbirth() {
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();
    for _ in 0..2 {
        recv_op(&mut broker).await;
    }

    let err = node
        .publish_device_birth("Sensor01", PayloadBuilder::new())
        .await
        .unwrap_err();
    match err {
        Error::ProtocolState(message) => {
            assert_eq!(message, "Must publish NBIRTH before DBIRTH")
        }
        other => panic!("expected protocol state error, got {other:?}"),
    }
    // nothing went on the wire
    assert!(broker.rx_ops.try_recv().is_err());
}

#[tokio::test]
async fn primary_host_gates_births() {
    let (node, mut broker) = new_node(
        EdgeNodeConfig::new("Energy", "Gateway01").with_primary_host("SCADA01"),
    );
    node.connect().await.unwrap();

    recv_op(&mut broker).await; // connect
    recv_op(&mut broker).await; // NCMD subscribe
    match recv_op(&mut broker).await {
        TransportOp::Subscribe { filter, .. } => assert_eq!(filter, "spBv1.0/STATE/SCADA01"),
        op => panic!("expected STATE subscribe, got {op:?}"),
    }

    assert!(!node.is_primary_host_online());
    assert!(matches!(
        node.publish_birth(temperature_birth()).await,
        Err(Error::ProtocolState(_))
    ));

    broker
        .tx_events
        .send(TransportEvent::Message {
            topic: "spBv1.0/STATE/SCADA01".into(),
            payload: br#"{"online":true,"timestamp":1000}"#.to_vec(),
        })
        .unwrap();
    wait_until(|| node.is_primary_host_online()).await;

    node.publish_birth(temperature_birth()).await.unwrap();
    match recv_op(&mut broker).await {
        TransportOp::Publish { topic, .. } => {
            assert_eq!(topic, "spBv1.0/Energy/NBIRTH/Gateway01")
        }
        op => panic!("expected NBIRTH publish, got {op:?}"),
    }

    broker
        .tx_events
        .send(TransportEvent::Message {
            topic: "spBv1.0/STATE/SCADA01".into(),
            payload: br#"{"online":false,"timestamp":2000}"#.to_vec(),
        })
        .unwrap();
    wait_until(|| !node.is_primary_host_online()).await;
    assert!(matches!(
        node.publish_birth(temperature_birth()).await,
        Err(Error::ProtocolState(_))
    ));
}

#[tokio::test]
async fn connect_waits_for_primary_host_state() {
    let (node, broker) = new_node(
        EdgeNodeConfig::new("Energy", "Gateway01")
            .with_primary_host("SCADA01")
            .with_primary_host_wait(Duration::from_millis(500)),
    );

    let tx_events = broker.tx_events.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        _ = tx_events.send(TransportEvent::Message {
            topic: "spBv1.0/STATE/SCADA01".into(),
            payload: br#"{"online":true,"timestamp":1}"#.to_vec(),
        });
    });

    node.connect().await.unwrap();
    assert!(node.is_primary_host_online());
}

#[tokio::test]
async fn device_lifecycle_shares_sequence_counter() {
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();
    node.publish_birth(temperature_birth()).await.unwrap();
    for _ in 0..3 {
        recv_op(&mut broker).await;
    }

    node.publish_device_birth(
        "Sensor01",
        PayloadBuilder::new().add_metric_with_alias("Humidity", 1, 55.0),
    )
    .await
    .unwrap();

    match recv_op(&mut broker).await {
        TransportOp::Subscribe { filter, .. } => {
            assert_eq!(filter, "spBv1.0/Energy/DCMD/Gateway01/Sensor01")
        }
        op => panic!("expected DCMD subscribe before DBIRTH, got {op:?}"),
    }
    match recv_op(&mut broker).await {
        TransportOp::Publish { topic, payload, .. } => {
            assert_eq!(topic, "spBv1.0/Energy/DBIRTH/Gateway01/Sensor01");
            assert_eq!(decode(&payload).seq, Some(1));
        }
        op => panic!("expected DBIRTH publish, got {op:?}"),
    }

    node.publish_device_data("Sensor01", PayloadBuilder::new().add_metric_by_alias(1, 56.0))
        .await
        .unwrap();
    match recv_op(&mut broker).await {
        TransportOp::Publish { topic, payload, .. } => {
            assert_eq!(topic, "spBv1.0/Energy/DDATA/Gateway01/Sensor01");
            assert_eq!(decode(&payload).seq, Some(2));
        }
        op => panic!("expected DDATA publish, got {op:?}"),
    }

    node.publish_device_death("Sensor01").await.unwrap();
    match recv_op(&mut broker).await {
        TransportOp::Publish {
            topic,
            payload,
            qos,
            ..
        } => {
            assert_eq!(topic, "spBv1.0/Energy/DDEATH/Gateway01/Sensor01");
            assert_eq!(qos, QoS::AtLeastOnce);
            assert_eq!(decode(&payload).seq, Some(3));
        }
        op => panic!("expected DDEATH publish, got {op:?}"),
    }

    // the device must re-birth before more data
    assert!(matches!(
        node.publish_device_data("Sensor01", PayloadBuilder::new().add_metric_by_alias(1, 57.0))
            .await,
        Err(Error::ProtocolState(_))
    ));
    assert!(matches!(
        node.publish_device_data("Unknown", PayloadBuilder::new().add_metric_by_alias(1, 1.0))
            .await,
        Err(Error::ProtocolState(_))
    ));
}

#[tokio::test]
async fn rebirth_invalidates_device_sessions() {
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();
    node.publish_birth(temperature_birth()).await.unwrap();
    node.publish_device_birth(
        "Sensor01",
        PayloadBuilder::new().add_metric_with_alias("Humidity", 1, 55.0),
    )
    .await
    .unwrap();
    node.rebirth().await.unwrap();
    while broker.rx_ops.try_recv().is_ok() {}

    assert!(matches!(
        node.publish_device_data("Sensor01", PayloadBuilder::new().add_metric_by_alias(1, 1.0))
            .await,
        Err(Error::ProtocolState(_))
    ));
}

#[tokio::test]
async fn explicit_death_publishes_and_disconnects() {
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();
    node.publish_birth(temperature_birth()).await.unwrap();
    for _ in 0..3 {
        recv_op(&mut broker).await;
    }

    node.publish_death().await.unwrap();
    match recv_op(&mut broker).await {
        TransportOp::Publish {
            topic,
            payload,
            qos,
            ..
        } => {
            assert_eq!(topic, "spBv1.0/Energy/NDEATH/Gateway01");
            assert_eq!(qos, QoS::AtLeastOnce);
            let death = decode(&payload);
            assert_eq!(death.seq, Some(1));
            assert_eq!(bdseq_of(&death), Some(1));
        }
        op => panic!("expected NDEATH publish, got {op:?}"),
    }
    assert_eq!(recv_op(&mut broker).await, TransportOp::Disconnect);
    assert!(!node.is_connected());
}

#[tokio::test]
async fn operations_fail_when_not_connected() {
    let (node, _broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));

    assert!(matches!(
        node.publish_birth(PayloadBuilder::new()).await,
        Err(Error::ProtocolState(_))
    ));
    assert!(matches!(
        node.publish_data(PayloadBuilder::new()).await,
        Err(Error::ProtocolState(_))
    ));
    assert!(matches!(
        node.publish_device_birth("d", PayloadBuilder::new()).await,
        Err(Error::ProtocolState(_))
    ));
    assert!(matches!(node.rebirth().await, Err(Error::ProtocolState(_))));
    assert!(matches!(node.disconnect().await, Err(Error::ProtocolState(_))));
}

#[tokio::test]
async fn connection_lost_is_observed_not_retried() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();
    node.publish_birth(temperature_birth()).await.unwrap();
    for _ in 0..3 {
        recv_op(&mut broker).await;
    }

    broker.drop_connection();
    wait_until(|| !node.is_connected()).await;

    assert!(matches!(
        node.publish_data(PayloadBuilder::new().add_metric_by_alias(1, 1.0))
            .await,
        Err(Error::ProtocolState(_))
    ));
    // no reconnect was attempted on our behalf
    assert!(broker.rx_ops.try_recv().is_err());

    // a manual reconnect opens the next session
    node.connect().await.unwrap();
    assert_eq!(node.get_bd_seq(), 2);
}

#[tokio::test]
async fn commands_reach_the_callback() {
    let (node, mut broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    node.set_command_callback(std::sync::Arc::new(move |topic, payload| {
        _ = tx.send((topic, payload));
    }));
    node.connect().await.unwrap();
    for _ in 0..2 {
        recv_op(&mut broker).await;
    }

    let cmd = PayloadBuilder::new().add_node_control_rebirth(true).build();
    broker
        .tx_events
        .send(TransportEvent::Message {
            topic: "spBv1.0/Energy/NCMD/Gateway01".into(),
            payload: cmd,
        })
        .unwrap();

    let (topic, payload) = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(topic.to_topic_string(), "spBv1.0/Energy/NCMD/Gateway01");
    assert_eq!(
        payload.metrics[0].name.as_deref(),
        Some("Node Control/Rebirth")
    );

    // non-sparkplug traffic is dropped without fuss
    broker
        .tx_events
        .send(TransportEvent::Message {
            topic: "some/other/topic".into(),
            payload: vec![1, 2, 3],
        })
        .unwrap();
    sleep(Duration::from_millis(20)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn invalid_identifiers_are_config_errors() {
    let (transport, _broker, events) = ChannelTransport::new();
    assert!(matches!(
        EdgeNode::new(EdgeNodeConfig::new("bad/group", "node"), transport, events),
        Err(Error::Config(_))
    ));

    let (node, _broker) = new_node(EdgeNodeConfig::new("Energy", "Gateway01"));
    node.connect().await.unwrap();
    assert!(matches!(
        node.publish_device_birth("bad+device", PayloadBuilder::new())
            .await,
        Err(Error::Config(_))
    ));
}
