use meshplane_controller_core::resources::TypeUrl;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time;

const SERVICE: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService";
const METHOD: &str = "StreamAggregatedResources";
const STREAM_TYPE: &str = "bidi_stream";

#[derive(Clone, Debug)]
pub struct DiscoveryMetrics {
    started: Counter,
    active: Gauge,
    handling: Histogram,
    handled: Family<CodeLabels, Counter>,
    msg_received: Counter,
    msg_sent: Family<TypeLabels, Counter>,
    nacks: Family<TypeLabels, Counter>,
    response_latency: Family<TypeLabels, Histogram>,
}

pub(crate) struct StreamObserver {
    metrics: DiscoveryMetrics,
    handled: Option<StreamHandle>,
}

struct StreamHandle {
    start: time::Instant,
    durations: Histogram,
    codes: Family<CodeLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct CodeLabels {
    grpc_service: &'static str,
    grpc_method: &'static str,
    grpc_type: &'static str,
    grpc_code: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TypeLabels {
    type_url: &'static str,
}

// === impl DiscoveryMetrics ===

impl DiscoveryMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let started = Counter::default();
        reg.register(
            "streams_started",
            "Total number of discovery streams started",
            started.clone(),
        );

        let active = Gauge::default();
        reg.register(
            "streams_active",
            "Number of discovery streams currently open",
            active.clone(),
        );

        let handled = Family::<CodeLabels, Counter>::default();
        reg.register(
            "streams_handled",
            "Total number of discovery streams completed, regardless of success or failure",
            handled.clone(),
        );

        // Proxies hold their streams open for as long as they run.
        let handling = Histogram::new([1.0, 60.0, 3600.0, 86400.0]);
        reg.register_with_unit(
            "stream_duration",
            "Histogram of the lifetime (seconds) of discovery streams",
            Unit::Seconds,
            handling.clone(),
        );

        let msg_received = Counter::default();
        reg.register(
            "requests",
            "Total number of discovery requests received",
            msg_received.clone(),
        );

        let msg_sent = Family::<TypeLabels, Counter>::default();
        reg.register(
            "responses",
            "Total number of discovery responses sent",
            msg_sent.clone(),
        );

        let nacks = Family::<TypeLabels, Counter>::default();
        reg.register(
            "nacks",
            "Total number of responses rejected by proxies",
            nacks.clone(),
        );

        let response_latency = Family::<TypeLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.01, 0.1, 1.0, 10.0])
        });
        reg.register_with_unit(
            "response_latency",
            "Histogram of the time (seconds) from a snapshot being published to it being sent",
            Unit::Seconds,
            response_latency.clone(),
        );

        Self {
            started,
            active,
            handling,
            handled,
            msg_received,
            msg_sent,
            nacks,
            response_latency,
        }
    }

    pub(crate) fn stream(&self) -> StreamObserver {
        self.started.inc();
        self.active.inc();
        // Pre-register OK
        let _ = self.handled.get_or_create(&code_labels(tonic::Code::Ok));
        StreamObserver {
            metrics: self.clone(),
            handled: Some(StreamHandle {
                start: time::Instant::now(),
                durations: self.handling.clone(),
                codes: self.handled.clone(),
            }),
        }
    }

    pub fn total_streams_started(&self) -> u64 {
        self.started.get()
    }

    pub fn active_streams(&self) -> i64 {
        self.active.get()
    }

    pub fn total_responses(&self, type_url: TypeUrl) -> u64 {
        self.msg_sent.get_or_create(&type_labels(type_url)).get()
    }

    pub fn total_nacks(&self, type_url: TypeUrl) -> u64 {
        self.nacks.get_or_create(&type_labels(type_url)).get()
    }

    pub fn total_handled(&self, code: tonic::Code) -> u64 {
        self.handled.get_or_create(&code_labels(code)).get()
    }
}

impl Default for DiscoveryMetrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

// === impl StreamObserver ===

impl StreamObserver {
    pub(crate) fn msg_received(&self) {
        self.metrics.msg_received.inc();
    }

    pub(crate) fn nack(&self, type_url: TypeUrl) {
        self.metrics.nacks.get_or_create(&type_labels(type_url)).inc();
    }

    pub(crate) fn msg_sent(&self, type_url: TypeUrl, published: time::Instant) {
        let labels = type_labels(type_url);
        self.metrics.msg_sent.get_or_create(&labels).inc();
        self.metrics
            .response_latency
            .get_or_create(&labels)
            .observe(published.elapsed().as_secs_f64());
    }

    pub(crate) fn end(&mut self, code: tonic::Code) {
        if let Some(handle) = self.handled.take() {
            handle.inc_end(code);
        }
    }
}

impl Drop for StreamObserver {
    fn drop(&mut self) {
        self.metrics.active.dec();
        if let Some(inner) = self.handled.take() {
            inner.inc_end(tonic::Code::Ok);
        }
    }
}

// === impl StreamHandle ===

impl StreamHandle {
    #[inline]
    fn inc_end(self, code: tonic::Code) {
        let Self {
            start,
            durations,
            codes,
        } = self;
        durations.observe(start.elapsed().as_secs_f64());
        codes.get_or_create(&code_labels(code)).inc();
    }
}

fn type_labels(type_url: TypeUrl) -> TypeLabels {
    TypeLabels {
        type_url: type_url.short_name(),
    }
}

fn code_labels(code: tonic::Code) -> CodeLabels {
    CodeLabels {
        grpc_service: SERVICE,
        grpc_method: METHOD,
        grpc_type: STREAM_TYPE,
        grpc_code: code_str(code),
    }
}

fn code_str(code: tonic::Code) -> &'static str {
    use tonic::Code::*;
    match code {
        Ok => "OK",
        Cancelled => "CANCELLED",
        Unknown => "UNKNOWN",
        InvalidArgument => "INVALID_ARGUMENT",
        DeadlineExceeded => "DEADLINE_EXCEEDED",
        NotFound => "NOT_FOUND",
        AlreadyExists => "ALREADY_EXISTS",
        PermissionDenied => "PERMISSION_DENIED",
        ResourceExhausted => "RESOURCE_EXHAUSTED",
        FailedPrecondition => "FAILED_PRECONDITION",
        Aborted => "ABORTED",
        OutOfRange => "OUT_OF_RANGE",
        Unimplemented => "UNIMPLEMENTED",
        Internal => "INTERNAL",
        Unavailable => "UNAVAILABLE",
        DataLoss => "DATA_LOSS",
        Unauthenticated => "UNAUTHENTICATED",
    }
}
