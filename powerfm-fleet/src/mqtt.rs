use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, Publish, QoS};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MqttConf;
use crate::ingest::{apply_heartbeat, apply_registration, SharedRepository};
use crate::models::{HeartbeatIn, NodeRegistration};
use crate::store::FleetError;

pub const HEARTBEAT_TOPIC: &str = "powerfm/relays/heartbeat@v1";
pub const REGISTRATION_TOPIC: &str = "powerfm/relays/registration@v1";

/// Écoute les topics relais jusqu'à annulation
pub fn spawn_mqtt_listener(repo: SharedRepository, conf: MqttConf, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut opts = MqttOptions::new("powerfm-fleet", &conf.host, conf.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);

        for topic in [HEARTBEAT_TOPIC, REGISTRATION_TOPIC] {
            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                error!("MQTT subscribe to {} failed: {:?}", topic, e);
                return;
            }
        }
        info!("MQTT listener on {}:{}", conf.host, conf.port);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        let repo = repo.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || handle_publish(&repo, &p)).await {
                            error!("MQTT store task failed: {}", e);
                        }
                    }
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => info!("MQTT connected"),
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        }
        let _ = client.disconnect().await;
        debug!("MQTT listener stopped");
    })
}

fn handle_publish(repo: &SharedRepository, publish: &Publish) {
    let result = match publish.topic.as_str() {
        HEARTBEAT_TOPIC => match serde_json::from_slice::<HeartbeatIn>(&publish.payload) {
            Ok(msg) => apply_heartbeat(repo.as_ref(), msg, None),
            Err(e) => {
                warn!("Invalid heartbeat JSON: {}", e);
                return;
            }
        },
        REGISTRATION_TOPIC => match serde_json::from_slice::<NodeRegistration>(&publish.payload) {
            Ok(msg) => apply_registration(repo.as_ref(), msg).map(|_| ()),
            Err(e) => {
                warn!("Invalid registration JSON: {}", e);
                return;
            }
        },
        other => {
            debug!("Ignoring message on {}", other);
            return;
        }
    };

    match result {
        Ok(()) => {}
        Err(FleetError::NodeNotFound(id)) => warn!("Heartbeat from unregistered node {}", id),
        Err(e) => error!("Failed to store {} message: {}", publish.topic, e),
    }
}
