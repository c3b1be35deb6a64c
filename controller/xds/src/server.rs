use crate::{
    cache::{SnapshotCache, SnapshotRx},
    message::{DiscoveryRequest, DiscoveryResponse, PeerInfo},
    metrics::{DiscoveryMetrics, StreamObserver},
    snapshot::Snapshot,
    xds_log::XdsLog,
};
use futures::prelude::*;
use meshplane_controller_core::{resources::TypeUrl, ConnectionId, Proxy};
use std::{
    collections::BTreeMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{sync::watch, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Hooks invoked as discovery streams open and close.
pub trait StreamCallbacks: Send + Sync + 'static {
    /// Admits a new stream. The returned proxy is served for the lifetime of
    /// the stream; an error closes the stream with that status.
    ///
    /// `cancel` is cancelled once the stream ends.
    fn proxy_connected(
        &self,
        peer: &PeerInfo,
        connection_id: ConnectionId,
        cancel: CancellationToken,
    ) -> Result<Arc<Proxy>, tonic::Status>;

    /// Called exactly once for each stream that was admitted.
    fn proxy_disconnected(&self, connection_id: ConnectionId);
}

pub type ResponseStream =
    Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, tonic::Status>> + Send>>;

/// Serves snapshots from a [`SnapshotCache`] over aggregated discovery
/// streams.
#[derive(Debug)]
pub struct DiscoveryServer<C> {
    callbacks: Arc<C>,
    cache: SnapshotCache,
    log: XdsLog,
    metrics: DiscoveryMetrics,
    next_id: Arc<AtomicU64>,
    drain: drain::Watch,
}

/// Tears down a stream's registration when the stream is dropped, however it
/// ends.
struct StreamGuard<C: StreamCallbacks> {
    connection_id: ConnectionId,
    proxy: Arc<Proxy>,
    callbacks: Arc<C>,
    cancel: CancellationToken,
    cache: SnapshotCache,
    log: XdsLog,
    snapshots: SnapshotRx,
}

/// Per-stream protocol state.
#[derive(Debug, Default)]
struct StreamState {
    nonce: u64,
    watches: BTreeMap<TypeUrl, TypeWatch>,
}

#[derive(Debug, Default)]
struct TypeWatch {
    names: Vec<String>,
    /// The nonce of the last response sent for this type.
    nonce: Option<String>,
    /// The snapshot version of the last response sent for this type.
    version: Option<u64>,
}

struct Outgoing {
    type_url: TypeUrl,
    published: Instant,
    response: DiscoveryResponse,
}

// === impl DiscoveryServer ===

impl<C> Clone for DiscoveryServer<C> {
    fn clone(&self) -> Self {
        Self {
            callbacks: self.callbacks.clone(),
            cache: self.cache.clone(),
            log: self.log.clone(),
            metrics: self.metrics.clone(),
            next_id: self.next_id.clone(),
            drain: self.drain.clone(),
        }
    }
}

impl<C: StreamCallbacks> DiscoveryServer<C> {
    pub fn new(
        callbacks: Arc<C>,
        cache: SnapshotCache,
        log: XdsLog,
        metrics: DiscoveryMetrics,
        drain: drain::Watch,
    ) -> Self {
        Self {
            callbacks,
            cache,
            log,
            metrics,
            next_id: Arc::new(AtomicU64::new(1)),
            drain,
        }
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn xds_log(&self) -> &XdsLog {
        &self.log
    }

    /// Opens a state-of-the-world aggregated stream for a proxy.
    pub fn stream_aggregated_resources<S>(
        &self,
        peer: PeerInfo,
        requests: S,
    ) -> Result<ResponseStream, tonic::Status>
    where
        S: Stream<Item = Result<DiscoveryRequest, tonic::Status>> + Send + 'static,
    {
        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observer = self.metrics.stream();
        let cancel = CancellationToken::new();

        let proxy = match self
            .callbacks
            .proxy_connected(&peer, connection_id, cancel.clone())
        {
            Ok(proxy) => proxy,
            Err(status) => {
                debug!(%connection_id, peer = ?peer.addr, %status, "Rejected stream");
                observer.end(status.code());
                return Err(status);
            }
        };
        info!(%proxy, "Stream opened");

        let guard = StreamGuard {
            connection_id,
            snapshots: self.cache.watch(proxy.uuid),
            proxy,
            callbacks: self.callbacks.clone(),
            cancel,
            cache: self.cache.clone(),
            log: self.log.clone(),
        };
        Ok(response_stream(
            guard,
            requests,
            observer,
            self.drain.clone(),
        ))
    }

    pub async fn fetch(
        &self,
        _req: DiscoveryRequest,
    ) -> Result<DiscoveryResponse, tonic::Status> {
        Err(tonic::Status::unimplemented("fetch requests are not supported"))
    }

    pub fn delta_aggregated_resources<S>(
        &self,
        _peer: PeerInfo,
        _requests: S,
    ) -> Result<ResponseStream, tonic::Status> {
        Err(tonic::Status::unimplemented(
            "delta discovery is not supported",
        ))
    }
}

fn response_stream<C, S>(
    mut guard: StreamGuard<C>,
    requests: S,
    mut observer: StreamObserver,
    drain: drain::Watch,
) -> ResponseStream
where
    C: StreamCallbacks,
    S: Stream<Item = Result<DiscoveryRequest, tonic::Status>> + Send + 'static,
{
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
            let requests = requests;
        }
        let mut state = StreamState::default();

        loop {
            let step = tokio::select! {
                // Close the stream so that it doesn't hold the server open.
                _ = (&mut shutdown) => {
                    debug!(proxy = %guard.proxy, "Shutting down stream");
                    return;
                }

                req = requests.next() => match req {
                    None => {
                        debug!(proxy = %guard.proxy, "Proxy closed stream");
                        return;
                    }
                    Some(Err(status)) => Err(status),
                    Some(Ok(req)) => {
                        observer.msg_received();
                        let snapshot = guard.snapshots.borrow().clone();
                        state
                            .on_request(&guard.proxy, req, snapshot.as_deref(), &observer)
                            .map(|out| out.into_iter().collect::<Vec<_>>())
                    }
                },

                res = guard.snapshots.changed() => match res {
                    Ok(()) => {
                        let snapshot = guard.snapshots.borrow_and_update().clone();
                        Ok(snapshot.map(|s| state.on_snapshot(&s)).unwrap_or_default())
                    }
                    Err(_) => return,
                },
            };

            match step {
                Ok(outgoing) => {
                    for Outgoing { type_url, published, response } in outgoing {
                        trace!(
                            proxy = %guard.proxy,
                            %type_url,
                            version = %response.version_info,
                            nonce = %response.nonce,
                            resources = response.resources.len(),
                            "Sending response"
                        );
                        observer.msg_sent(type_url, published);
                        guard.log.record(guard.proxy.uuid, type_url);
                        yield response;
                    }
                }
                Err(status) => {
                    debug!(proxy = %guard.proxy, %status, "Stream failed");
                    observer.end(status.code());
                    Err::<(), _>(status)?;
                }
            }
        }
    })
}

// === impl StreamGuard ===

impl<C: StreamCallbacks> Drop for StreamGuard<C> {
    fn drop(&mut self) {
        info!(proxy = %self.proxy, "Stream closed");
        self.cancel.cancel();
        self.callbacks.proxy_disconnected(self.connection_id);

        // Release this stream's watch so that an unwatched entry can be pruned.
        drop(std::mem::replace(
            &mut self.snapshots,
            watch::channel(None).1,
        ));
        if self.cache.prune(&self.proxy.uuid) {
            self.log.remove(&self.proxy.uuid);
        }
    }
}

// === impl StreamState ===

impl StreamState {
    fn on_request(
        &mut self,
        proxy: &Proxy,
        req: DiscoveryRequest,
        snapshot: Option<&Snapshot>,
        observer: &StreamObserver,
    ) -> Result<Option<Outgoing>, tonic::Status> {
        let type_url = req
            .type_url
            .parse::<TypeUrl>()
            .map_err(|e| tonic::Status::invalid_argument(e.to_string()))?;
        let watch = self.watches.entry(type_url).or_default();

        if !req.response_nonce.is_empty()
            && watch.nonce.as_deref() != Some(req.response_nonce.as_str())
        {
            // A newer response has been sent since.
            trace!(%proxy, %type_url, nonce = %req.response_nonce, "Ignoring stale request");
            return Ok(None);
        }

        let names_changed = watch.names != req.resource_names;
        watch.names = req.resource_names;

        if let Some(error) = req.error_detail {
            warn!(%proxy, %type_url, version = %req.version_info, %error, "Proxy rejected configuration");
            observer.nack(type_url);
            // Wait for a new snapshot rather than resend the rejected one.
            return Ok(None);
        }
        if !req.response_nonce.is_empty() {
            trace!(%proxy, %type_url, version = %req.version_info, "Proxy acknowledged configuration");
        }

        let Some(snapshot) = snapshot else {
            trace!(%proxy, %type_url, "Waiting for an initial snapshot");
            return Ok(None);
        };
        let current = watch.version == Some(snapshot.version())
            && req.version_info == snapshot.version_info();
        if current && !names_changed {
            return Ok(None);
        }
        Ok(Some(self.respond(type_url, snapshot)))
    }

    /// Responds on every type this stream watches that has not yet been sent
    /// the snapshot's version.
    fn on_snapshot(&mut self, snapshot: &Snapshot) -> Vec<Outgoing> {
        let stale = self
            .watches
            .iter()
            .filter(|(_, w)| w.version != Some(snapshot.version()))
            .map(|(t, _)| *t)
            .collect::<Vec<_>>();
        stale
            .into_iter()
            .map(|t| self.respond(t, snapshot))
            .collect()
    }

    fn respond(&mut self, type_url: TypeUrl, snapshot: &Snapshot) -> Outgoing {
        self.nonce += 1;
        let nonce = self.nonce.to_string();

        let watch = self.watches.entry(type_url).or_default();
        watch.nonce = Some(nonce.clone());
        watch.version = Some(snapshot.version());

        let resources = snapshot
            .select(type_url, &watch.names)
            .map(|r| prost_types::Any {
                type_url: type_url.as_str().to_string(),
                value: r.payload.to_vec(),
            })
            .collect();

        Outgoing {
            type_url,
            published: snapshot.created_at(),
            response: DiscoveryResponse {
                version_info: snapshot.version_info(),
                resources,
                type_url: type_url.as_str().to_string(),
                nonce,
            },
        }
    }
}
