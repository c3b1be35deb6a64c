//! Turns watched cluster changes into broker events.

use crate::k8s::{parse_mesh_config, MeshConfigRef};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use k8s_openapi::api::{
    core::v1::{ConfigMap, Pod, Service},
    discovery::v1::EndpointSlice,
};
use kube::ResourceExt;
use meshplane_controller_broker::Broker;
use meshplane_controller_core::{
    event::{Kind, Payload, PodMeta, PubSubMessage},
    mesh_config::MeshConfig,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{trace, warn};

#[derive(Debug)]
pub struct Events {
    broker: Broker,
    mesh_config_ref: MeshConfigRef,
    mesh_config: Arc<MeshConfig>,
    pods: HashMap<(String, String), Arc<PodMeta>>,
    services: HashSet<(String, String)>,
    endpoint_slices: HashSet<(String, String)>,
}

impl Events {
    pub fn shared(broker: Broker, mesh_config_ref: MeshConfigRef) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self {
            broker,
            mesh_config_ref,
            mesh_config: Default::default(),
            pods: HashMap::default(),
            services: HashSet::default(),
            endpoint_slices: HashSet::default(),
        }))
    }

    fn emit(&self, msg: PubSubMessage) {
        trace!(kind = %msg.kind, "Emitting event");
        self.broker.add_rate_limited(msg);
    }

    /// Emits an added or updated event for an object tracked only by name.
    fn object_applied(
        broker: &Broker,
        known: &mut HashSet<(String, String)>,
        kind: Kind,
        namespace: String,
        name: String,
    ) {
        let payload = Payload::object(Some(namespace.clone()), &name);
        let msg = if known.insert((namespace, name)) {
            PubSubMessage::added(kind, payload)
        } else {
            PubSubMessage::updated(kind, payload.clone(), payload)
        };
        broker.add_rate_limited(msg);
    }

    fn object_deleted(
        broker: &Broker,
        known: &mut HashSet<(String, String)>,
        kind: Kind,
        namespace: String,
        name: String,
    ) {
        let payload = Payload::object(Some(namespace.clone()), &name);
        if known.remove(&(namespace, name)) {
            broker.add_rate_limited(PubSubMessage::deleted(kind, payload));
        }
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for Events {
    fn apply(&mut self, pod: Pod) {
        let Some(namespace) = pod.namespace() else {
            return;
        };
        let meta = Arc::new(PodMeta {
            name: pod.name_unchecked(),
            namespace: namespace.clone(),
            labels: pod.labels().clone(),
            annotations: pod.annotations().clone(),
        });
        let msg = match self
            .pods
            .insert((namespace, meta.name.clone()), meta.clone())
        {
            Some(old) if old == meta => return,
            Some(old) => PubSubMessage::updated(Kind::Pod, Payload::Pod(old), Payload::Pod(meta)),
            None => PubSubMessage::added(Kind::Pod, Payload::Pod(meta)),
        };
        self.emit(msg);
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(old) = self.pods.remove(&(namespace, name)) {
            self.emit(PubSubMessage::deleted(Kind::Pod, Payload::Pod(old)));
        }
    }
}

impl kubert::index::IndexNamespacedResource<Service> for Events {
    fn apply(&mut self, svc: Service) {
        if let Some(namespace) = svc.namespace() {
            let name = svc.name_unchecked();
            Self::object_applied(&self.broker, &mut self.services, Kind::Service, namespace, name);
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        Self::object_deleted(&self.broker, &mut self.services, Kind::Service, namespace, name);
    }
}

impl kubert::index::IndexNamespacedResource<EndpointSlice> for Events {
    fn apply(&mut self, slice: EndpointSlice) {
        if let Some(namespace) = slice.namespace() {
            let name = slice.name_unchecked();
            Self::object_applied(
                &self.broker,
                &mut self.endpoint_slices,
                Kind::Endpoint,
                namespace,
                name,
            );
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        Self::object_deleted(
            &self.broker,
            &mut self.endpoint_slices,
            Kind::Endpoint,
            namespace,
            name,
        );
    }
}

impl kubert::index::IndexNamespacedResource<ConfigMap> for Events {
    fn apply(&mut self, cm: ConfigMap) {
        if !self.mesh_config_ref.matches(&cm) {
            return;
        }
        let new = match parse_mesh_config(&cm) {
            Ok(config) => Arc::new(config),
            Err(error) => {
                warn!(%error, "Invalid mesh configuration");
                return;
            }
        };
        if new == self.mesh_config {
            return;
        }

        // The first configuration read is reported as an update of the
        // defaults, so that consumers comparing fields see every change.
        let old = std::mem::replace(&mut self.mesh_config, new.clone());
        self.emit(PubSubMessage::updated(
            Kind::MeshConfig,
            Payload::MeshConfig(old),
            Payload::MeshConfig(new),
        ));
    }

    fn delete(&mut self, _namespace: String, _name: String) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kubert::index::IndexNamespacedResource;
    use meshplane_controller_broker::BrokerMetrics;
    use meshplane_controller_core::event::EventType;

    fn mk_pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn emits_pod_changes() {
        let (_signal, shutdown) = drain::channel();
        let broker = Broker::new(Default::default(), BrokerMetrics::default(), shutdown);
        let mut sub = broker.subscribe_kube_events([
            Kind::Pod.added(),
            Kind::Pod.updated(),
            Kind::Pod.deleted(),
        ]);
        let events = Events::shared(
            broker.clone(),
            MeshConfigRef {
                namespace: "mesh".to_string(),
                name: "mesh-config".to_string(),
            },
        );

        events.write().apply(mk_pod("a", &[("app", "a")]));
        // Unchanged pods are not reported again.
        events.write().apply(mk_pod("a", &[("app", "a")]));
        events.write().apply(mk_pod("a", &[("app", "b")]));
        for _ in 0..2 {
            <Events as IndexNamespacedResource<Pod>>::delete(
                &mut events.write(),
                "ns".to_string(),
                "a".to_string(),
            );
        }

        let mut kinds = Vec::new();
        for _ in 0..3 {
            let msg = sub.recv().await.expect("event");
            kinds.push(msg.kind.event_type);
        }
        assert_eq!(
            kinds,
            [EventType::Added, EventType::Updated, EventType::Deleted]
        );
        assert!(sub.try_recv().is_err());
        broker.unsubscribe_kube_events(&mut sub).await;
    }

    #[tokio::test(start_paused = true)]
    async fn emits_mesh_config_updates() {
        let (_signal, shutdown) = drain::channel();
        let broker = Broker::new(Default::default(), BrokerMetrics::default(), shutdown);
        let mut sub = broker.subscribe_kube_events([Kind::MeshConfig.updated()]);
        let events = Events::shared(
            broker.clone(),
            MeshConfigRef {
                namespace: "mesh".to_string(),
                name: "mesh-config".to_string(),
            },
        );

        let mk_cm = |ns: &str, json: &str| ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some("mesh-config".to_string()),
                ..Default::default()
            },
            data: Some(maplit::btreemap! {
                crate::k8s::MESH_CONFIG_KEY.to_string() => json.to_string(),
            }),
            ..Default::default()
        };

        events
            .write()
            .apply(mk_cm("other", r#"{"traffic": {"enableEgress": true}}"#));
        events.write().apply(mk_cm("mesh", "not json"));
        events
            .write()
            .apply(mk_cm("mesh", r#"{"traffic": {"enableEgress": true}}"#));

        let msg = sub.recv().await.expect("event");
        match (msg.old, msg.new) {
            (Some(Payload::MeshConfig(old)), Some(Payload::MeshConfig(new))) => {
                assert!(!old.traffic.enable_egress);
                assert!(new.traffic.enable_egress);
            }
            (old, new) => panic!("unexpected payloads: {old:?} {new:?}"),
        }
        assert!(sub.try_recv().is_err());
        broker.unsubscribe_kube_events(&mut sub).await;
    }
}
