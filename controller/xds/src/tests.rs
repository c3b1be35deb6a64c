use crate::*;
use futures::prelude::*;
use meshplane_controller_core::{
    resources::{Resource, ResourceBundle, TypeUrl},
    ConnectionId, Proxy, ProxyKind, ServiceIdentity, Uuid,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{sync::mpsc, time};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct Callbacks {
    uuid: Uuid,
    reject: Option<tonic::Code>,
    connected: Mutex<Vec<(ConnectionId, CancellationToken)>>,
    disconnected: Mutex<Vec<ConnectionId>>,
}

impl StreamCallbacks for Callbacks {
    fn proxy_connected(
        &self,
        peer: &PeerInfo,
        connection_id: ConnectionId,
        cancel: CancellationToken,
    ) -> Result<Arc<Proxy>, tonic::Status> {
        if let Some(code) = self.reject {
            return Err(tonic::Status::new(code, "rejected"));
        }
        self.connected.lock().push((connection_id, cancel));
        Ok(Arc::new(Proxy::new(
            ProxyKind::Sidecar,
            self.uuid,
            ServiceIdentity::new("sa", "ns"),
            peer.addr,
            connection_id,
        )))
    }

    fn proxy_disconnected(&self, connection_id: ConnectionId) {
        self.disconnected.lock().push(connection_id);
    }
}

struct Harness {
    server: DiscoveryServer<Callbacks>,
    callbacks: Arc<Callbacks>,
    uuid: Uuid,
    _signal: drain::Signal,
}

type Requests = mpsc::UnboundedSender<Result<DiscoveryRequest, tonic::Status>>;

fn harness(reject: Option<tonic::Code>) -> Harness {
    let uuid = Uuid::new_v4();
    let callbacks = Arc::new(Callbacks {
        uuid,
        reject,
        ..Default::default()
    });
    let (signal, drain) = drain::channel();
    let server = DiscoveryServer::new(
        callbacks.clone(),
        SnapshotCache::default(),
        XdsLog::default(),
        DiscoveryMetrics::default(),
        drain,
    );
    Harness {
        server,
        callbacks,
        uuid,
        _signal: signal,
    }
}

impl Harness {
    fn open(&self) -> Result<(Requests, ResponseStream), tonic::Status> {
        let (tx, rx) = mpsc::unbounded_channel();
        let stream = self
            .server
            .stream_aggregated_resources(PeerInfo::default(), UnboundedReceiverStream::new(rx))?;
        Ok((tx, stream))
    }

    fn publish(&self, clusters: &[&str]) -> u64 {
        let bundle = clusters.iter().fold(ResourceBundle::default(), |b, c| {
            b.with(TypeUrl::Cluster, Resource::new(*c, c.to_string()))
        });
        self.server
            .cache()
            .set_snapshot(self.uuid, bundle)
            .expect("snapshot must be consistent")
    }
}

fn request(type_url: TypeUrl, version: &str, nonce: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: version.to_string(),
        type_url: type_url.as_str().to_string(),
        response_nonce: nonce.to_string(),
        ..Default::default()
    }
}

async fn next(stream: &mut ResponseStream) -> Result<DiscoveryResponse, tonic::Status> {
    time::timeout(time::Duration::from_secs(10), stream.next())
        .await
        .expect("timed out waiting for a response")
        .expect("stream must not end")
}

async fn assert_idle(stream: &mut ResponseStream) {
    let res = time::timeout(time::Duration::from_secs(10), stream.next()).await;
    assert!(res.is_err(), "unexpected response: {res:?}");
}

fn names(rsp: &DiscoveryResponse) -> Vec<String> {
    rsp.resources
        .iter()
        .map(|a| String::from_utf8(a.value.clone()).expect("payloads are utf8"))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn responds_once_a_snapshot_is_published() {
    let h = harness(None);
    let (tx, mut stream) = h.open().expect("stream must be admitted");

    tx.send(Ok(request(TypeUrl::Cluster, "", ""))).unwrap();
    assert_idle(&mut stream).await;

    h.publish(&["a"]);
    let rsp = next(&mut stream).await.expect("response");
    assert_eq!(rsp.version_info, "1");
    assert_eq!(rsp.type_url, TypeUrl::Cluster.as_str());
    assert_eq!(names(&rsp), ["a"]);

    // Acknowledging the current version does not produce a response.
    tx.send(Ok(request(TypeUrl::Cluster, "1", &rsp.nonce))).unwrap();
    assert_idle(&mut stream).await;

    h.publish(&["a", "b"]);
    let rsp = next(&mut stream).await.expect("response");
    assert_eq!(rsp.version_info, "2");
    assert_eq!(names(&rsp), ["a", "b"]);
    assert_eq!(h.server.xds_log().get(&h.uuid)[0].1.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn responds_immediately_when_a_snapshot_exists() {
    let h = harness(None);
    h.publish(&["a"]);
    let (tx, mut stream) = h.open().expect("stream must be admitted");

    tx.send(Ok(request(TypeUrl::Cluster, "", ""))).unwrap();
    assert_eq!(next(&mut stream).await.expect("response").version_info, "1");

    // Types that were never requested are not sent.
    h.publish(&["a"]);
    let rsp = next(&mut stream).await.expect("response");
    assert_eq!(rsp.type_url, TypeUrl::Cluster.as_str());
    assert_idle(&mut stream).await;
}

#[tokio::test(start_paused = true)]
async fn nacks_wait_for_a_new_snapshot() {
    let h = harness(None);
    h.publish(&["a"]);
    let (tx, mut stream) = h.open().expect("stream must be admitted");

    tx.send(Ok(request(TypeUrl::Cluster, "", ""))).unwrap();
    let rsp = next(&mut stream).await.expect("response");

    tx.send(Ok(DiscoveryRequest {
        error_detail: Some("bad cluster".to_string()),
        ..request(TypeUrl::Cluster, "", &rsp.nonce)
    }))
    .unwrap();
    assert_idle(&mut stream).await;

    h.publish(&["b"]);
    let rsp = next(&mut stream).await.expect("response");
    assert_eq!(rsp.version_info, "2");
}

#[tokio::test(start_paused = true)]
async fn stale_nonces_are_ignored() {
    let h = harness(None);
    h.publish(&["a"]);
    let (tx, mut stream) = h.open().expect("stream must be admitted");

    tx.send(Ok(request(TypeUrl::Cluster, "", ""))).unwrap();
    let first = next(&mut stream).await.expect("response");
    h.publish(&["b"]);
    let second = next(&mut stream).await.expect("response");
    assert_ne!(first.nonce, second.nonce);

    // A late NACK of the first response must not suppress anything.
    tx.send(Ok(DiscoveryRequest {
        error_detail: Some("late".to_string()),
        ..request(TypeUrl::Cluster, "", &first.nonce)
    }))
    .unwrap();
    assert_idle(&mut stream).await;

    h.publish(&["c"]);
    assert_eq!(next(&mut stream).await.expect("response").version_info, "3");
}

#[tokio::test(start_paused = true)]
async fn resource_names_filter_responses() {
    let h = harness(None);
    h.publish(&["a", "b", "c"]);
    let (tx, mut stream) = h.open().expect("stream must be admitted");

    tx.send(Ok(DiscoveryRequest {
        resource_names: vec!["b".to_string()],
        ..request(TypeUrl::Cluster, "", "")
    }))
    .unwrap();
    let rsp = next(&mut stream).await.expect("response");
    assert_eq!(names(&rsp), ["b"]);

    // Changing the subscription resends the current version.
    tx.send(Ok(DiscoveryRequest {
        resource_names: vec!["a".to_string(), "c".to_string()],
        ..request(TypeUrl::Cluster, "1", &rsp.nonce)
    }))
    .unwrap();
    let rsp = next(&mut stream).await.expect("response");
    assert_eq!(rsp.version_info, "1");
    assert_eq!(names(&rsp), ["a", "c"]);
}

#[tokio::test(start_paused = true)]
async fn unknown_type_urls_are_invalid() {
    let h = harness(None);
    let (tx, mut stream) = h.open().expect("stream must be admitted");

    tx.send(Ok(DiscoveryRequest {
        type_url: "type.googleapis.com/envoy.config.core.v3.Node".to_string(),
        ..Default::default()
    }))
    .unwrap();
    let status = next(&mut stream).await.expect_err("stream must fail");
    assert_eq!(status.code(), tonic::Code::InvalidArgument);
    assert!(stream.next().await.is_none());

    drop(stream);
    assert_eq!(h.callbacks.disconnected.lock().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_streams_are_not_disconnected() {
    let h = harness(Some(tonic::Code::Unauthenticated));
    let status = h.open().err().expect("stream must be rejected");
    assert_eq!(status.code(), tonic::Code::Unauthenticated);
    assert!(h.callbacks.disconnected.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn closing_a_stream_releases_the_proxy() {
    let h = harness(None);
    let (_tx0, first) = h.open().expect("stream must be admitted");
    let (_tx1, second) = h.open().expect("stream must be admitted");
    h.publish(&["a"]);

    let (ids, tokens): (Vec<_>, Vec<_>) = h.callbacks.connected.lock().iter().cloned().unzip();
    assert!(ids[0] < ids[1], "connection ids must increase");

    drop(first);
    assert_eq!(*h.callbacks.disconnected.lock(), [ids[0]]);
    assert!(tokens[0].is_cancelled());
    assert!(!tokens[1].is_cancelled());
    assert!(!h.server.cache().is_empty(), "still watched by the second stream");

    drop(second);
    assert!(tokens[1].is_cancelled());
    assert!(h.server.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn streams_end_on_shutdown() {
    let h = harness(None);
    let (_tx, mut stream) = h.open().expect("stream must be admitted");
    let Harness {
        server,
        callbacks,
        _signal: signal,
        ..
    } = h;
    drop(server);

    let drained = tokio::spawn(signal.drain());
    assert!(stream.next().await.is_none());
    drop(stream);
    drained.await.expect("drain must complete");
    assert_eq!(callbacks.disconnected.lock().len(), 1);
}

#[tokio::test]
async fn fetch_and_delta_are_unsupported() {
    let h = harness(None);
    let status = h
        .server
        .fetch(request(TypeUrl::Cluster, "", ""))
        .await
        .expect_err("fetch must fail");
    assert_eq!(status.code(), tonic::Code::Unimplemented);

    let status = h
        .server
        .delta_aggregated_resources(PeerInfo::default(), stream::empty::<()>())
        .err()
        .expect("delta must fail");
    assert_eq!(status.code(), tonic::Code::Unimplemented);
}
